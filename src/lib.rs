//! Row-change notifications from PostgreSQL.
//!
//! Install notify triggers on tables and subscribe to their channels through a
//! single [`TriggerManager`]:
//!
//! ```no_run
//! use pg_triggers::{HandlerResult, ListenerEvent, Operation, TriggerDefinition};
//!
//! # async fn example() -> pg_triggers::Result<()> {
//! let triggers = pg_triggers::create_triggers("postgres://localhost/app")?;
//!
//! triggers
//!    .install(&TriggerDefinition::new("items", "items_changes").on(Operation::Insert))
//!    .await?;
//!
//! let handle = triggers
//!    .subscribe("items_changes", |event: ListenerEvent| async move {
//!       if let Some(n) = event.notification() {
//!          println!("{} at {}: {:?}", n.payload.operation, n.payload.timestamp, n.payload.data);
//!       }
//!       HandlerResult::Ok(())
//!    })
//!    .await?;
//!
//! triggers.unsubscribe(&handle).await?;
//! triggers.dispose().await;
//! # Ok(())
//! # }
//! ```
//!
//! Each mutated row produces one notification after its transaction commits.
//! Delivery is at-most-once and stops when the listening connection is lost.

mod backend;
mod config;
mod error;
mod manager;

pub use backend::{Backend, PgBackend};
pub use config::ManagerConfig;
pub use error::{Error, Result};
pub use manager::{ManagerState, SourceTransaction, TriggerManager};

pub use sqlx_pg_conn_mgr::{PgDatabase, PgDatabaseConfig};
pub use sqlx_pg_notify::{
   DisposeReport, HandlerError, HandlerId, HandlerResult, ListenerEvent, ListenerFault,
   ListenerHandle, Notification, NotificationHandler, NotificationPayload, NotificationStream,
   Operation, PushConnection, RawNotification, RegistryConfig, RegistrySnapshot, RowData,
};
pub use sqlx_pg_trigger_toolkit::{
   JsonRow, StatementExecutor, TransactionSource, TriggerDefinition, WriteQueryResult, build,
   build_teardown,
};

/// Creates a manager for the database at `url` with default settings.
///
/// Only the URL is parsed here; connections are opened on first use.
pub fn create_triggers(url: &str) -> Result<TriggerManager<PgBackend>> {
   create_triggers_with(url, None, ManagerConfig::default())
}

/// Like [`create_triggers`] with explicit pool and manager settings.
pub fn create_triggers_with(
   url: &str,
   database: Option<PgDatabaseConfig>,
   config: ManagerConfig,
) -> Result<TriggerManager<PgBackend>> {
   let backend = PgBackend::connect_lazy(url, database)?;
   tracing::debug!(url = %backend.database().redacted_url(), "Created trigger manager");
   Ok(TriggerManager::new(backend, config))
}
