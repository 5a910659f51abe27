//! Configuration for PostgreSQL connection pools

use serde::{Deserialize, Serialize};

/// Configuration for the pool behind a [`PgDatabase`](crate::PgDatabase)
///
/// # Examples
///
/// ```
/// use sqlx_pg_conn_mgr::PgDatabaseConfig;
///
/// // Use defaults
/// let config = PgDatabaseConfig::default();
///
/// // Override just one field
/// let config = PgDatabaseConfig {
///     max_connections: 4,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgDatabaseConfig {
   /// Maximum number of pooled connections
   ///
   /// A listener opened through [`PgDatabase::connect_listener`](crate::PgDatabase::connect_listener)
   /// keeps one of these for as long as it lives, so this must be at least 2 when
   /// transactions and subscriptions are used together.
   ///
   /// Default: 10
   pub max_connections: u32,

   /// How long to wait for a free connection before failing (in seconds)
   ///
   /// Default: 30
   pub acquire_timeout_secs: u64,

   /// Idle timeout for pooled connections (in seconds)
   ///
   /// Default: 600
   pub idle_timeout_secs: u64,
}

impl Default for PgDatabaseConfig {
   fn default() -> Self {
      Self {
         max_connections: 10,
         acquire_timeout_secs: 30,
         idle_timeout_secs: 600,
      }
   }
}
