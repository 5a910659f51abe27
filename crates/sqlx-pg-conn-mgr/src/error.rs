//! Error types for sqlx-pg-conn-mgr

use thiserror::Error;

/// Errors that may occur when working with sqlx-pg-conn-mgr
#[derive(Error, Debug)]
pub enum Error {
   /// Error from the sqlx library. Standard sqlx errors are converted to this variant
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// Database has been closed and cannot be used
   #[error("Database has been closed")]
   DatabaseClosed,

   /// The connection URL could not be parsed
   #[error("Invalid connection URL: {0}")]
   InvalidUrl(String),
}
