//! Typed PostgreSQL `LISTEN`/`NOTIFY` subscriptions for row-change notifications.
//!
//! Trigger functions publish one JSON envelope per mutated row (see [`payload`]).
//! A [`ListenerRegistry`] owns a single push connection, multiplexes any number
//! of handlers over it and delivers decoded [`Notification`]s to them.
//!
//! ```no_run
//! use sqlx::postgres::{PgListener, PgPool};
//! use sqlx_pg_notify::{HandlerResult, ListenerEvent, ListenerRegistry, RegistryConfig};
//!
//! # async fn example(pool: PgPool) -> sqlx_pg_notify::Result<()> {
//! let listener = PgListener::connect_with(&pool).await?;
//! let registry = ListenerRegistry::start(listener, RegistryConfig::default());
//!
//! let handle = registry
//!    .subscribe("items_changes", |event: ListenerEvent| async move {
//!       if let Some(n) = event.notification() {
//!          println!("{} {:?}", n.payload.operation, n.payload.data);
//!       }
//!       HandlerResult::Ok(())
//!    })
//!    .await?;
//!
//! handle.unlisten().await?;
//! registry.dispose_all().await;
//! # Ok(())
//! # }
//! ```
//!
//! Delivery is at-most-once: notifications sent while no connection is listening
//! are lost, and a lost connection is reported rather than re-established.

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod payload;
pub mod registry;
pub mod stream;

pub use config::RegistryConfig;
pub use connection::{PushConnection, RawNotification};
pub use error::Error;
pub use handler::{HandlerError, HandlerResult, ListenerEvent, Notification, NotificationHandler};
pub use payload::{NotificationPayload, Operation, RowData};
pub use registry::{
   DisposeReport, HandlerId, ListenerFault, ListenerHandle, ListenerRegistry, RegistrySnapshot,
   RegistryStatus,
};
pub use stream::NotificationStream;

pub type Result<T> = std::result::Result<T, Error>;
