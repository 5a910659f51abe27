//! Error types for the sqlx-pg-notify crate.

/// Errors that can occur while decoding notifications or managing subscriptions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// A notification payload did not have the expected envelope structure.
   #[error("malformed notification payload: {0}")]
   MalformedPayload(String),

   /// The shared listener connection is gone; no further subscriptions can be served.
   #[error("subscription connection failed: {0}")]
   SubscriptionFailed(String),

   /// The registry has been disposed or its receive loop has stopped.
   #[error("listener registry is closed")]
   RegistryClosed,

   /// Error from SQLx operations.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// Row data could not be converted into the requested type.
   #[error(transparent)]
   Json(#[from] serde_json::Error),
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::MalformedPayload(_) => "MALFORMED_PAYLOAD".to_string(),
         Error::SubscriptionFailed(_) => "SUBSCRIPTION_FAILED".to_string(),
         Error::RegistryClosed => "REGISTRY_CLOSED".to_string(),
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("PG_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::Json(_) => "JSON_ERROR".to_string(),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_error_codes() {
      assert_eq!(
         Error::MalformedPayload("x".into()).error_code(),
         "MALFORMED_PAYLOAD"
      );
      assert_eq!(
         Error::SubscriptionFailed("gone".into()).error_code(),
         "SUBSCRIPTION_FAILED"
      );
      assert_eq!(Error::RegistryClosed.error_code(), "REGISTRY_CLOSED");
      assert_eq!(
         Error::Sqlx(sqlx::Error::PoolClosed).error_code(),
         "SQLX_ERROR"
      );
   }

   #[test]
   fn test_subscription_failed_message() {
      let err = Error::SubscriptionFailed("connection reset".into());
      assert!(err.to_string().contains("connection reset"));
   }
}
