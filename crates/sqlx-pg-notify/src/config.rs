use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`ListenerRegistry`](crate::ListenerRegistry).
///
/// Controls the capacity of the internal channels and how long teardown is
/// allowed to wait on individual steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
   /// Capacity of the command channel between callers and the receive loop.
   ///
   /// `subscribe`/`unsubscribe` wait for a free slot when it is full.
   ///
   /// Default: 64.
   pub command_capacity: usize,

   /// Capacity of the fault broadcast channel.
   ///
   /// Fault receivers that fall further behind than this observe
   /// [`tokio::sync::broadcast::error::RecvError::Lagged`]. Notifications are
   /// never dropped because of this setting; it only bounds fault reporting.
   ///
   /// Default: 256.
   pub fault_capacity: usize,

   /// Upper bound on each teardown step during dispose: one `UNLISTEN`, closing
   /// the connection, or waiting for handler workers to finish.
   ///
   /// A step that exceeds it is logged and skipped so the remaining resources
   /// are still released.
   ///
   /// Default: 2 seconds.
   pub teardown_timeout: Duration,

   /// Upper bound on the whole dispose, after which the receive loop is aborted.
   ///
   /// Default: 10 seconds.
   pub dispose_timeout: Duration,
}

impl Default for RegistryConfig {
   fn default() -> Self {
      Self {
         command_capacity: 64,
         fault_capacity: 256,
         teardown_timeout: Duration::from_secs(2),
         dispose_timeout: Duration::from_secs(10),
      }
   }
}

impl RegistryConfig {
   /// Creates a new registry configuration with default settings.
   pub fn new() -> Self {
      Self::default()
   }

   /// Sets the command channel capacity.
   pub fn with_command_capacity(mut self, capacity: usize) -> Self {
      self.command_capacity = capacity;
      self
   }

   /// Sets the fault broadcast channel capacity.
   pub fn with_fault_capacity(mut self, capacity: usize) -> Self {
      self.fault_capacity = capacity;
      self
   }

   /// Sets the per-step teardown bound.
   pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
      self.teardown_timeout = timeout;
      self
   }

   /// Sets the overall dispose bound.
   pub fn with_dispose_timeout(mut self, timeout: Duration) -> Self {
      self.dispose_timeout = timeout;
      self
   }
}
