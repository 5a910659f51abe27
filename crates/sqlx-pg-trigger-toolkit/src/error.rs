/// Result type alias for toolkit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for trigger generation and transactional execution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from SQLx operations.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// Error from the connection manager.
   #[error(transparent)]
   ConnectionManager(#[from] sqlx_pg_conn_mgr::Error),

   /// PostgreSQL type that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// A statement inside a transaction failed; the transaction was rolled back.
   #[error("transaction failed: {0}")]
   TransactionFailed(Box<Error>),

   /// Transaction failed and rollback also failed.
   #[error("transaction failed: {transaction_error}; rollback also failed: {rollback_error}")]
   TransactionRollbackFailed {
      transaction_error: String,
      rollback_error: String,
   },

   /// A schema, table, channel or generated object name is not a plain SQL identifier.
   #[error("invalid identifier {value:?} for {kind}: {reason}")]
   InvalidIdentifier {
      kind: &'static str,
      value: String,
      reason: &'static str,
   },

   /// A trigger definition without any mutation events.
   #[error("trigger definition for {table}/{channel} has no events")]
   NoTriggerEvents { table: String, channel: String },

   /// Generic error for operations that don't fit other categories.
   #[error("{0}")]
   Other(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("PG_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::ConnectionManager(_) => "CONNECTION_ERROR".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::TransactionFailed(_) => "TRANSACTION_FAILED".to_string(),
         Error::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED".to_string(),
         Error::InvalidIdentifier { .. } => "INVALID_IDENTIFIER".to_string(),
         Error::NoTriggerEvents { .. } => "NO_TRIGGER_EVENTS".to_string(),
         Error::Other(_) => "ERROR".to_string(),
      }
   }

   /// Returns the error that caused a transaction to fail, if this is one.
   pub fn transaction_cause(&self) -> Option<&Error> {
      match self {
         Error::TransactionFailed(cause) => Some(cause),
         _ => None,
      }
   }
}
