//! # sqlx-pg-conn-mgr
//!
//! A minimal wrapper around SQLx that owns the PostgreSQL connection source for
//! trigger management and notification listening.
//!
//! ## Core Types
//!
//! - **[`PgDatabase`]**: Lazily created connection pool plus a factory for listener connections
//! - **[`PgDatabaseConfig`]**: Configuration for connection pool settings
//! - **[`Error`]**: Error type for database operations
//!
//! ## Architecture
//!
//! - **Cheap construction**: parsing the URL is the only work done up front
//! - **Lazy pool**: the pool is built on first use and connects on first acquire
//! - **Dedicated listeners**: each listener takes one connection out of the pool for its lifetime
//!
//! ## Usage
//!
//! ```no_run
//! use sqlx_pg_conn_mgr::PgDatabase;
//!
//! #[tokio::main]
//! async fn main() -> sqlx_pg_conn_mgr::Result<()> {
//!     let db = PgDatabase::connect_lazy("postgres://localhost/app", None)?;
//!
//!     let mut tx = db.pool()?.begin().await?;
//!     sqlx::query("INSERT INTO items (name) VALUES ($1)")
//!         .bind("Alice")
//!         .execute(&mut *tx)
//!         .await?;
//!     tx.commit().await?;
//!
//!     let mut listener = db.connect_listener().await?;
//!     listener.listen("items_changed").await?;
//!
//!     drop(listener);
//!     db.close().await?;
//!     Ok(())
//! }
//! ```
//!
mod config;
mod database;
mod error;

// Re-export public types
pub use config::PgDatabaseConfig;
pub use database::PgDatabase;
pub use error::Error;

/// A type alias for Results with our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
