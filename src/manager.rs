use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use sqlx_pg_notify::{
   DisposeReport, ListenerFault, ListenerHandle, ListenerRegistry, NotificationHandler,
   NotificationStream, RegistrySnapshot,
};
use sqlx_pg_trigger_toolkit::{
   StatementExecutor, TransactionSource, TriggerDefinition, build, build_teardown,
   validate_identifier,
};
use tokio::sync::{Mutex, broadcast};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::backend::Backend;
use crate::config::ManagerConfig;
use crate::error::{Error, Result};

/// Transaction type handed to [`TriggerManager::transaction`] closures.
pub type SourceTransaction<B> = <<B as Backend>::Source as TransactionSource>::Transaction;

/// Lifecycle of a [`TriggerManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
   /// Created; no connection has been established yet.
   Uninitialized,
   /// A transaction began or the push connection opened.
   Active,
   /// Disposed. Every operation fails with [`Error::AlreadyDisposed`].
   Disposed,
}

/// Entry point for installing notify triggers and subscribing to their channels.
///
/// Construction performs no I/O. The transaction source is touched on the first
/// [`transaction`](Self::transaction) and the push connection is opened on the
/// first [`subscribe`](Self::subscribe); both are released by
/// [`dispose`](Self::dispose).
///
/// Cloning is cheap and every clone shares the same connections and state.
pub struct TriggerManager<B: Backend> {
   inner: Arc<Inner<B>>,
}

struct Inner<B: Backend> {
   backend: B,
   config: ManagerConfig,
   state: RwLock<ManagerState>,
   /// Created on first use. Dispose holds this lock for its whole duration.
   registry: Mutex<Option<Arc<ListenerRegistry>>>,
}

impl<B: Backend> TriggerManager<B> {
   pub fn new(backend: B, config: ManagerConfig) -> Self {
      Self {
         inner: Arc::new(Inner {
            backend,
            config,
            state: RwLock::new(ManagerState::Uninitialized),
            registry: Mutex::new(None),
         }),
      }
   }

   pub fn state(&self) -> ManagerState {
      *self.inner.state.read()
   }

   pub fn backend(&self) -> &B {
      &self.inner.backend
   }

   pub fn config(&self) -> &ManagerConfig {
      &self.inner.config
   }

   /// Runs `f` inside a transaction and commits if it returns `Ok`.
   ///
   /// Any error from `f`, including one from a statement, rolls the whole
   /// transaction back and is returned wrapped in
   /// [`TransactionFailed`](sqlx_pg_trigger_toolkit::Error::TransactionFailed).
   /// No lock is held while `f` runs, so transactions and subscriptions proceed
   /// concurrently.
   ///
   /// ```no_run
   /// use sqlx_pg_trigger_toolkit::StatementExecutor;
   ///
   /// # async fn example(triggers: pg_triggers::TriggerManager<pg_triggers::PgBackend>) -> pg_triggers::Result<()> {
   /// let name = String::from("lamp");
   /// let inserted = triggers
   ///    .transaction(move |tx| {
   ///       Box::pin(async move {
   ///          let result = tx
   ///             .execute("INSERT INTO items (name) VALUES ($1)", vec![name.into()])
   ///             .await?;
   ///          Ok(result.rows_affected)
   ///       })
   ///    })
   ///    .await?;
   /// assert_eq!(inserted, 1);
   /// # Ok(())
   /// # }
   /// ```
   pub async fn transaction<F, T>(&self, f: F) -> Result<T>
   where
      F: for<'c> FnOnce(
         &'c mut SourceTransaction<B>,
      ) -> BoxFuture<'c, sqlx_pg_trigger_toolkit::Result<T>>,
   {
      self.ensure_open()?;
      let source = self.inner.backend.transaction_source()?;

      let began = AtomicBool::new(false);
      let result = sqlx_pg_trigger_toolkit::transaction(source, |tx| {
         began.store(true, Ordering::Relaxed);
         f(tx)
      })
      .await;

      if began.load(Ordering::Relaxed) {
         self.mark_active();
      }
      Ok(result?)
   }

   /// Installs the notify function and triggers for `definition` atomically.
   ///
   /// Installing the same definition again replaces it in place.
   pub async fn install(&self, definition: &TriggerDefinition) -> Result<()> {
      self.install_all(std::slice::from_ref(definition)).await
   }

   /// Installs several definitions in one transaction; either all of them are
   /// in place afterwards or none are.
   pub async fn install_all(&self, definitions: &[TriggerDefinition]) -> Result<()> {
      let mut statements = Vec::new();
      for definition in definitions {
         statements.extend(build(definition)?);
      }

      self
         .transaction(move |tx| Box::pin(async move { tx.execute_batch(&statements).await }))
         .await?;

      for definition in definitions {
         info!(
            table = %definition.table(),
            channel = %definition.channel(),
            "Installed notify triggers"
         );
      }
      Ok(())
   }

   /// Drops the triggers and notify function created for `definition`.
   pub async fn uninstall(&self, definition: &TriggerDefinition) -> Result<()> {
      let statements = build_teardown(definition)?;
      self
         .transaction(move |tx| Box::pin(async move { tx.execute_batch(&statements).await }))
         .await?;

      info!(
         table = %definition.table(),
         channel = %definition.channel(),
         "Removed notify triggers"
      );
      Ok(())
   }

   /// Lists the base tables in `schema`, sorted by name.
   pub async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
      validate_identifier("schema", schema)?;
      let schema = schema.to_string();

      let rows = self
         .transaction(move |tx| {
            Box::pin(async move {
               tx.fetch_all(
                  "SELECT table_name::text AS table_name
                     FROM information_schema.tables
                    WHERE table_schema = $1 AND table_type = 'BASE TABLE'
                    ORDER BY table_name",
                  vec![json!(schema)],
               )
               .await
            })
         })
         .await?;

      Ok(rows
         .into_iter()
         .filter_map(|mut row| match row.shift_remove("table_name") {
            Some(serde_json::Value::String(name)) => Some(name),
            _ => None,
         })
         .collect())
   }

   /// Registers `handler` for notifications on `channel`.
   ///
   /// The first call opens the push connection. Handlers receive every
   /// notification sent on the channel after this returns, in send order.
   pub async fn subscribe<H: NotificationHandler>(
      &self,
      channel: &str,
      handler: H,
   ) -> Result<ListenerHandle> {
      let registry = self.registry().await?;
      let handle = registry
         .subscribe(channel, handler)
         .await
         .map_err(|e| self.disposed_or(e))?;

      debug!(channel = %channel, handler_id = handle.id(), "Subscribed");
      Ok(handle)
   }

   /// Like [`subscribe`](Self::subscribe) but yields the events as a stream.
   pub async fn subscribe_stream(
      &self,
      channel: &str,
   ) -> Result<(ListenerHandle, NotificationStream)> {
      let registry = self.registry().await?;
      let subscription = registry
         .subscribe_stream(channel)
         .await
         .map_err(|e| self.disposed_or(e))?;

      debug!(channel = %channel, handler_id = subscription.0.id(), "Subscribed stream");
      Ok(subscription)
   }

   /// Cancels one registration. Cancelling the same handle twice is a no-op.
   pub async fn unsubscribe(&self, handle: &ListenerHandle) -> Result<()> {
      self.ensure_open()?;
      handle.unlisten().await.map_err(|e| self.disposed_or(e))
   }

   /// Receives failures isolated by the listener: malformed payloads, handler
   /// errors and panics, and connection loss.
   ///
   /// Opens the push connection if it is not open yet.
   pub async fn faults(&self) -> Result<broadcast::Receiver<ListenerFault>> {
      Ok(self.registry().await?.faults())
   }

   /// Channels and handler counts currently registered.
   pub async fn snapshot(&self) -> Result<RegistrySnapshot> {
      self.ensure_open()?;
      let registry = self.inner.registry.lock().await.clone();
      match registry {
         Some(registry) => registry.snapshot().await.map_err(|e| self.disposed_or(e)),
         None => Ok(RegistrySnapshot::default()),
      }
   }

   /// Cancels every subscription and releases every connection.
   ///
   /// Waits until the listener has stopped and the backend is closed, each
   /// bounded by its configured timeout. Teardown failures are logged and
   /// collected in the report rather than returned. Calling this again, or
   /// concurrently, is a no-op that returns an empty report.
   pub async fn dispose(&self) -> DisposeReport {
      let mut slot = self.inner.registry.lock().await;
      {
         let mut state = self.inner.state.write();
         if *state == ManagerState::Disposed {
            trace!("Trigger manager already disposed");
            return DisposeReport::default();
         }
         *state = ManagerState::Disposed;
      }

      let mut report = match slot.take() {
         Some(registry) => registry.dispose_all().await,
         None => DisposeReport::default(),
      };

      let deadline = self.inner.config.close_timeout;
      match timeout(deadline, self.inner.backend.close()).await {
         Ok(Ok(())) => {}
         Ok(Err(e)) => {
            warn!(error = %e, "Failed to close backend");
            report.errors.push(format!("backend: {e}"));
         }
         Err(_) => {
            warn!(timeout = ?deadline, "Backend close timed out");
            report
               .errors
               .push(format!("backend: close timed out after {deadline:?}"));
         }
      }

      info!(
         handlers_cancelled = report.handlers_cancelled,
         channels_released = report.channels_released,
         errors = report.errors.len(),
         "Trigger manager disposed"
      );
      report
   }

   /// Returns the registry, opening the push connection on first use.
   async fn registry(&self) -> Result<Arc<ListenerRegistry>> {
      let mut slot = self.inner.registry.lock().await;
      // Checked under the lock so a concurrent dispose cannot be overtaken.
      self.ensure_open()?;

      if let Some(registry) = slot.as_ref() {
         return Ok(Arc::clone(registry));
      }

      debug!("Opening listener connection");
      let connection = self.inner.backend.connect_listener().await?;
      let registry = Arc::new(ListenerRegistry::start(
         connection,
         self.inner.config.registry.clone(),
      ));
      *slot = Some(Arc::clone(&registry));
      self.mark_active();
      Ok(registry)
   }

   fn ensure_open(&self) -> Result<()> {
      if self.state() == ManagerState::Disposed {
         return Err(Error::AlreadyDisposed);
      }
      Ok(())
   }

   fn mark_active(&self) {
      let mut state = self.inner.state.write();
      if *state == ManagerState::Uninitialized {
         *state = ManagerState::Active;
         info!("Trigger manager active");
      }
   }

   /// A registry that went away because of dispose reports `AlreadyDisposed`.
   fn disposed_or(&self, error: sqlx_pg_notify::Error) -> Error {
      if matches!(error, sqlx_pg_notify::Error::RegistryClosed)
         && self.state() == ManagerState::Disposed
      {
         return Error::AlreadyDisposed;
      }
      Error::Notify(error)
   }
}

impl<B: Backend> Clone for TriggerManager<B> {
   fn clone(&self) -> Self {
      Self {
         inner: Arc::clone(&self.inner),
      }
   }
}

impl<B: Backend + fmt::Debug> fmt::Debug for TriggerManager<B> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("TriggerManager")
         .field("state", &self.state())
         .field("backend", &self.inner.backend)
         .finish_non_exhaustive()
   }
}
