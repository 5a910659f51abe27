//! Capabilities the manager needs from a data-access collaborator.

use futures::future::BoxFuture;
use sqlx::postgres::{PgListener, PgPool};
use sqlx_pg_conn_mgr::{PgDatabase, PgDatabaseConfig};
use sqlx_pg_notify::PushConnection;
use sqlx_pg_trigger_toolkit::TransactionSource;

use crate::Result;

/// What a [`TriggerManager`](crate::TriggerManager) is generic over: a source of
/// transactions and a way to open the push connection.
///
/// Neither method is called before the manager needs it.
pub trait Backend: Send + Sync + 'static {
   type Source: TransactionSource;
   type Connection: PushConnection;

   /// Returns the transaction source, creating it on first call.
   fn transaction_source(&self) -> Result<&Self::Source>;

   /// Opens a new connection dedicated to receiving notifications.
   fn connect_listener(&self) -> BoxFuture<'_, Result<Self::Connection>>;

   /// Releases every connection this backend holds.
   fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// [`Backend`] over a lazily connected PostgreSQL pool.
#[derive(Debug)]
pub struct PgBackend {
   db: PgDatabase,
}

impl PgBackend {
   /// Parses `url`; no connection is made until first use.
   pub fn connect_lazy(url: &str, config: Option<PgDatabaseConfig>) -> Result<Self> {
      Ok(Self {
         db: PgDatabase::connect_lazy(url, config)?,
      })
   }

   pub fn database(&self) -> &PgDatabase {
      &self.db
   }
}

impl From<PgDatabase> for PgBackend {
   fn from(db: PgDatabase) -> Self {
      Self { db }
   }
}

impl Backend for PgBackend {
   type Source = PgPool;
   type Connection = PgListener;

   fn transaction_source(&self) -> Result<&PgPool> {
      Ok(self.db.pool()?)
   }

   fn connect_listener(&self) -> BoxFuture<'_, Result<PgListener>> {
      Box::pin(async move { Ok(self.db.connect_listener().await?) })
   }

   fn close(&self) -> BoxFuture<'_, Result<()>> {
      Box::pin(async move { Ok(self.db.close().await?) })
   }
}
