use serde::{Serialize, Serializer};

/// Result type alias for manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error response for callers that forward errors as data.
#[derive(Serialize)]
struct ErrorResponse {
   code: String,
   message: String,
}

/// Error types for the trigger manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// The manager has been disposed; the operation had no effect.
   #[error("trigger manager has already been disposed")]
   AlreadyDisposed,

   /// Error from SQLx operations.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// Error from the connection manager.
   #[error(transparent)]
   ConnectionManager(#[from] sqlx_pg_conn_mgr::Error),

   /// Error from trigger generation or a transaction.
   #[error(transparent)]
   Toolkit(#[from] sqlx_pg_trigger_toolkit::Error),

   /// Error from the listener registry.
   #[error(transparent)]
   Notify(#[from] sqlx_pg_notify::Error),
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// Wrapped errors report the code of the crate that produced them.
   pub fn error_code(&self) -> String {
      match self {
         Error::AlreadyDisposed => "ALREADY_DISPOSED".to_string(),
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("PG_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::ConnectionManager(_) => "CONNECTION_ERROR".to_string(),
         Error::Toolkit(e) => e.error_code(),
         Error::Notify(e) => e.error_code(),
      }
   }
}

impl Serialize for Error {
   fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
   where
      S: Serializer,
   {
      let response = ErrorResponse {
         code: self.error_code(),
         message: self.to_string(),
      };
      response.serialize(serializer)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_already_disposed() {
      let err = Error::AlreadyDisposed;
      assert_eq!(err.error_code(), "ALREADY_DISPOSED");
      assert!(err.to_string().contains("disposed"));
   }

   #[test]
   fn test_wrapped_codes_pass_through() {
      let err = Error::from(sqlx_pg_notify::Error::SubscriptionFailed("reset".into()));
      assert_eq!(err.error_code(), "SUBSCRIPTION_FAILED");

      let err = Error::from(sqlx_pg_trigger_toolkit::Error::TransactionFailed(Box::new(
         sqlx_pg_trigger_toolkit::Error::Other("boom".into()),
      )));
      assert_eq!(err.error_code(), "TRANSACTION_FAILED");
      assert_eq!(err.to_string(), "transaction failed: boom");
   }

   #[test]
   fn test_serialize_as_code_and_message() {
      let value = serde_json::to_value(Error::AlreadyDisposed).unwrap();
      assert_eq!(
         value,
         serde_json::json!({
            "code": "ALREADY_DISPOSED",
            "message": "trigger manager has already been disposed",
         })
      );
   }
}
