//! PostgreSQL notify triggers: DDL generation and transactional installation.
//!
//! This crate sits between the connection manager (`sqlx-pg-conn-mgr`) and
//! application-level code. It provides:
//!
//! - [`TriggerDefinition`] with [`build`] / [`build_teardown`] to generate the
//!   notify function and trigger DDL
//! - [`transaction`] to run statements atomically, over the
//!   [`TransactionSource`] / [`StatementExecutor`] seams
//! - JSON binding ([`bind_value`]) and decoding ([`decode::to_json`]) for
//!   PostgreSQL values
//!
//! # Example
//!
//! ```no_run
//! use sqlx_pg_notify::Operation;
//! use sqlx_pg_trigger_toolkit::{
//!    PgDatabase, StatementExecutor, TriggerDefinition, build, transaction,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = PgDatabase::connect_lazy("postgres://localhost/app", None)?;
//! let definition = TriggerDefinition::new("items", "items_changes")
//!    .on(Operation::Insert)
//!    .on(Operation::Delete);
//! let statements = build(&definition)?;
//!
//! transaction(db.pool()?, move |tx| {
//!    Box::pin(async move { tx.execute_batch(&statements).await })
//! })
//! .await?;
//!
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod bind;
pub mod builder;
pub mod decode;
pub mod error;
pub mod transactions;

pub use bind::bind_value;
pub use builder::{
   MAX_IDENTIFIER_BYTES, TriggerDefinition, build, build_teardown, quote_ident,
   validate_identifier,
};
pub use error::{Error, Result};
pub use transactions::{
   JsonRow, StatementExecutor, TransactionSource, WriteQueryResult, decode_rows, transaction,
};

// Re-export commonly used types from dependencies
pub use sqlx_pg_conn_mgr::{PgDatabase, PgDatabaseConfig};
