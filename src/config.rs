use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx_pg_notify::RegistryConfig;

/// Configuration for a [`TriggerManager`](crate::TriggerManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
   /// Settings for the listener registry created on first subscription.
   pub registry: RegistryConfig,

   /// Upper bound on closing the backend during dispose.
   ///
   /// Closing waits for checked-out connections to be returned, so a long
   /// running transaction can otherwise hold dispose open.
   ///
   /// Default: 5 seconds.
   pub close_timeout: Duration,
}

impl Default for ManagerConfig {
   fn default() -> Self {
      Self {
         registry: RegistryConfig::default(),
         close_timeout: Duration::from_secs(5),
      }
   }
}

impl ManagerConfig {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
      self.registry = registry;
      self
   }

   pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
      self.close_timeout = timeout;
      self
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_partial_config_keeps_defaults() {
      let config: ManagerConfig =
         serde_json::from_str(r#"{"close_timeout": {"secs": 1, "nanos": 0}}"#).unwrap();
      assert_eq!(config.close_timeout, Duration::from_secs(1));
      assert_eq!(config.registry.command_capacity, 64);
      assert_eq!(config.registry.teardown_timeout, Duration::from_secs(2));
   }
}
