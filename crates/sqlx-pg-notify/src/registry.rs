//! Listener registry: channel subscriptions served by a single receive loop.
//!
//! One push connection is owned by one background task. Callers never touch the
//! connection directly; `subscribe`, `unsubscribe` and `dispose_all` are sent to
//! the loop as commands and acknowledged once the server has confirmed them.
//!
//! # Data Flow
//!
//! ```text
//! ┌──────────────┐  commands   ┌──────────────────────┐   per-handler FIFO   ┌───────────┐
//! │  subscribe   │────────────►│                      │─────────────────────►│ handler 1 │
//! │  unsubscribe │             │     receive loop     │                      └───────────┘
//! │  dispose_all │◄────────────│  (owns PgListener)   │─────────────────────►┌───────────┐
//! └──────────────┘    acks     │                      │                      │ handler 2 │
//!                              └──────────┬───────────┘                      └───────────┘
//!                                         │ decode failures,
//!                                         │ handler errors/panics,
//!                                         ▼ connection loss
//!                                  faults (broadcast)
//! ```
//!
//! Each notification is decoded once and queued, in registration order, to every
//! handler registered for its channel. Every handler runs on its own worker task,
//! so a slow or failing handler delays only itself. Notifications on one channel
//! reach each handler in the order the server sent them; there is no ordering
//! between channels.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::config::RegistryConfig;
use crate::connection::{PushConnection, RawNotification};
use crate::handler::{HandlerResult, ListenerEvent, Notification, NotificationHandler};
use crate::payload;
use crate::stream::NotificationStream;
use crate::{Error, Result};

/// Identifies one handler registration within a registry.
pub type HandlerId = u64;

/// A failure isolated by the registry and reported on its fault channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListenerFault {
   #[error("malformed payload on channel {channel}: {reason}")]
   MalformedPayload { channel: String, reason: String },

   #[error("handler {handler_id} on channel {channel} failed: {reason}")]
   HandlerFailed {
      channel: String,
      handler_id: HandlerId,
      reason: String,
   },

   #[error("handler {handler_id} on channel {channel} panicked")]
   HandlerPanicked {
      channel: String,
      handler_id: HandlerId,
   },

   #[error("listener connection lost: {reason}")]
   Disconnected { reason: String },

   #[error("teardown of {target} failed: {reason}")]
   TeardownFailed { target: String, reason: String },
}

/// Lifecycle of a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryStatus {
   Running,
   /// The push connection was lost; existing handles can still be cancelled.
   Disconnected { reason: String },
   Disposed,
}

/// Outcome of [`ListenerRegistry::dispose_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisposeReport {
   pub handlers_cancelled: usize,
   pub channels_released: usize,
   /// Teardown steps that failed or timed out. Dispose continues past them.
   pub errors: Vec<String>,
}

impl DisposeReport {
   pub fn is_clean(&self) -> bool {
      self.errors.is_empty()
   }

   fn record(&mut self, faults: &broadcast::Sender<ListenerFault>, target: &str, reason: String) {
      warn!(target = %target, reason = %reason, "Teardown step failed, continuing");
      self.errors.push(format!("{target}: {reason}"));
      let _ = faults.send(ListenerFault::TeardownFailed {
         target: target.to_string(),
         reason,
      });
   }
}

/// Point-in-time view of the registered channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
   /// Channel name to number of registered handlers.
   pub channels: BTreeMap<String, usize>,
}

impl RegistrySnapshot {
   pub fn handler_count(&self) -> usize {
      self.channels.values().sum()
   }

   pub fn is_empty(&self) -> bool {
      self.channels.is_empty()
   }
}

enum Command {
   Subscribe {
      channel: String,
      slot: HandlerSlot,
      ack: oneshot::Sender<Result<()>>,
   },
   Unsubscribe {
      channel: String,
      id: HandlerId,
      ack: oneshot::Sender<Result<()>>,
   },
   Snapshot {
      ack: oneshot::Sender<RegistrySnapshot>,
   },
   Shutdown {
      ack: oneshot::Sender<DisposeReport>,
   },
}

/// A registered handler: its queue and the worker task draining it.
struct HandlerSlot {
   id: HandlerId,
   active: Arc<AtomicBool>,
   queue: mpsc::UnboundedSender<ListenerEvent>,
   worker: JoinHandle<()>,
}

impl HandlerSlot {
   fn spawn(
      id: HandlerId,
      channel: &str,
      handler: Arc<dyn NotificationHandler>,
      faults: broadcast::Sender<ListenerFault>,
   ) -> Self {
      let (queue, rx) = mpsc::unbounded_channel();
      let active = Arc::new(AtomicBool::new(true));
      let worker = tokio::spawn(run_handler(
         id,
         channel.to_string(),
         handler,
         Arc::clone(&active),
         rx,
         faults,
      ));

      Self {
         id,
         active,
         queue,
         worker,
      }
   }

   fn deliver(&self, event: ListenerEvent) {
      if self.queue.send(event).is_err() {
         trace!(handler_id = self.id, "Handler worker already stopped");
      }
   }

   /// Stops delivery. Events still queued are discarded by the worker.
   fn cancel(self) -> JoinHandle<()> {
      let HandlerSlot {
         active,
         queue,
         worker,
         ..
      } = self;
      active.store(false, Ordering::Release);
      drop(queue);
      worker
   }
}

async fn run_handler(
   id: HandlerId,
   channel: String,
   handler: Arc<dyn NotificationHandler>,
   active: Arc<AtomicBool>,
   mut queue: mpsc::UnboundedReceiver<ListenerEvent>,
   faults: broadcast::Sender<ListenerFault>,
) {
   while let Some(event) = queue.recv().await {
      if !active.load(Ordering::Acquire) {
         break;
      }

      // handle() is called inside the async block so a panic while building the
      // future is caught as well.
      let outcome: std::thread::Result<HandlerResult> =
         AssertUnwindSafe(async { handler.handle(event).await })
            .catch_unwind()
            .await;

      match outcome {
         Ok(Ok(())) => {}
         Ok(Err(e)) => {
            warn!(channel = %channel, handler_id = id, error = %e, "Notification handler failed");
            let _ = faults.send(ListenerFault::HandlerFailed {
               channel: channel.clone(),
               handler_id: id,
               reason: e.to_string(),
            });
         }
         Err(_) => {
            error!(channel = %channel, handler_id = id, "Notification handler panicked");
            let _ = faults.send(ListenerFault::HandlerPanicked {
               channel: channel.clone(),
               handler_id: id,
            });
         }
      }
   }
   trace!(channel = %channel, handler_id = id, "Handler worker stopped");
}

/// State owned by the background receive task.
struct ReceiveLoop<C> {
   connection: C,
   /// Set once the connection is lost; no further reads are attempted.
   lost: Option<String>,
   channels: HashMap<String, Vec<HandlerSlot>>,
   status: Arc<RwLock<RegistryStatus>>,
   faults: broadcast::Sender<ListenerFault>,
   teardown_timeout: Duration,
}

impl<C: PushConnection> ReceiveLoop<C> {
   async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
      debug!("Listener receive loop started");

      loop {
         tokio::select! {
            biased;

            command = commands.recv() => match command {
               Some(Command::Subscribe { channel, slot, ack }) => {
                  let result = self.add_handler(channel, slot).await;
                  let _ = ack.send(result);
               }
               Some(Command::Unsubscribe { channel, id, ack }) => {
                  let result = self.remove_handler(&channel, id).await;
                  let _ = ack.send(result);
               }
               Some(Command::Snapshot { ack }) => {
                  let _ = ack.send(self.snapshot());
               }
               Some(Command::Shutdown { ack }) => {
                  let report = self.shutdown().await;
                  let _ = ack.send(report);
                  return;
               }
               None => {
                  debug!("Registry dropped without dispose, shutting down receive loop");
                  self.shutdown().await;
                  return;
               }
            },

            received = self.connection.recv(), if self.lost.is_none() => {
               self.on_received(received);
            }
         }
      }
   }

   async fn add_handler(&mut self, channel: String, slot: HandlerSlot) -> Result<()> {
      if let Some(reason) = &self.lost {
         return Err(Error::SubscriptionFailed(reason.clone()));
      }

      if let Some(slots) = self.channels.get_mut(&channel) {
         debug!(channel = %channel, handler_id = slot.id, "Added handler to open channel");
         slots.push(slot);
         return Ok(());
      }

      // On failure the slot is dropped here, which ends its worker.
      self.connection.listen(&channel).await?;
      info!(channel = %channel, handler_id = slot.id, "Listening on channel");
      self.channels.insert(channel, vec![slot]);
      Ok(())
   }

   async fn remove_handler(&mut self, channel: &str, id: HandlerId) -> Result<()> {
      let Some(slots) = self.channels.get_mut(channel) else {
         return Ok(());
      };
      let Some(position) = slots.iter().position(|slot| slot.id == id) else {
         return Ok(());
      };

      drop(slots.remove(position).cancel());
      debug!(channel = %channel, handler_id = id, "Removed handler");

      if !slots.is_empty() {
         return Ok(());
      }

      self.channels.remove(channel);
      if self.lost.is_some() {
         return Ok(());
      }

      self.connection.unlisten(channel).await?;
      info!(channel = %channel, "Stopped listening on channel");
      Ok(())
   }

   fn snapshot(&self) -> RegistrySnapshot {
      RegistrySnapshot {
         channels: self
            .channels
            .iter()
            .map(|(channel, slots)| (channel.clone(), slots.len()))
            .collect(),
      }
   }

   fn on_received(&mut self, received: Result<Option<RawNotification>>) {
      match received {
         Ok(Some(raw)) => self.dispatch(raw),
         Ok(None) => self.connection_lost("connection closed".to_string()),
         Err(e) => self.connection_lost(e.to_string()),
      }
   }

   fn dispatch(&self, raw: RawNotification) {
      let Some(slots) = self.channels.get(&raw.channel) else {
         trace!(channel = %raw.channel, "Notification for channel without handlers");
         return;
      };

      let payload = match payload::decode(&raw.payload) {
         Ok(payload) => Arc::new(payload),
         Err(e) => {
            warn!(channel = %raw.channel, error = %e, "Dropping malformed notification");
            let _ = self.faults.send(ListenerFault::MalformedPayload {
               channel: raw.channel,
               reason: e.to_string(),
            });
            return;
         }
      };

      trace!(
         channel = %raw.channel,
         operation = %payload.operation,
         handlers = slots.len(),
         "Dispatching notification"
      );

      let notification = Notification {
         channel: raw.channel,
         process_id: raw.process_id,
         payload,
      };
      for slot in slots {
         slot.deliver(ListenerEvent::Notification(notification.clone()));
      }
   }

   fn connection_lost(&mut self, reason: String) {
      error!(reason = %reason, "Listener connection lost");
      *self.status.write() = RegistryStatus::Disconnected {
         reason: reason.clone(),
      };
      let _ = self.faults.send(ListenerFault::Disconnected {
         reason: reason.clone(),
      });

      for slot in self.channels.values().flatten() {
         slot.deliver(ListenerEvent::Disconnected {
            reason: reason.clone(),
         });
      }
      self.lost = Some(reason);
   }

   async fn shutdown(self) -> DisposeReport {
      let ReceiveLoop {
         mut connection,
         lost,
         channels,
         status,
         faults,
         teardown_timeout,
      } = self;

      let mut report = DisposeReport::default();
      let mut workers = Vec::new();

      for (channel, slots) in channels {
         report.handlers_cancelled += slots.len();
         workers.extend(slots.into_iter().map(HandlerSlot::cancel));

         if lost.is_some() {
            continue;
         }
         match timeout(teardown_timeout, connection.unlisten(&channel)).await {
            Ok(Ok(())) => report.channels_released += 1,
            Ok(Err(e)) => report.record(&faults, &channel, e.to_string()),
            Err(_) => report.record(&faults, &channel, "unlisten timed out".to_string()),
         }
      }

      if lost.is_some() {
         // Closing would reconnect just to send UNLISTEN; dropping is enough.
         drop(connection);
      } else {
         match timeout(teardown_timeout, connection.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => report.record(&faults, "connection", e.to_string()),
            Err(_) => report.record(&faults, "connection", "close timed out".to_string()),
         }
      }

      let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
      if timeout(teardown_timeout, futures::future::join_all(workers))
         .await
         .is_err()
      {
         let busy: Vec<_> = aborts.iter().filter(|abort| !abort.is_finished()).collect();
         for abort in &busy {
            abort.abort();
         }
         report.record(
            &faults,
            "handlers",
            format!("{} worker(s) still busy, aborted", busy.len()),
         );
      }

      *status.write() = RegistryStatus::Disposed;
      info!(
         handlers = report.handlers_cancelled,
         channels = report.channels_released,
         errors = report.errors.len(),
         "Listener registry disposed"
      );
      report
   }
}

/// Owns the channel subscriptions of one shared push connection.
///
/// Created with [`ListenerRegistry::start`], which moves the connection into a
/// background receive task. Must be used from within a tokio runtime.
pub struct ListenerRegistry {
   commands: mpsc::Sender<Command>,
   status: Arc<RwLock<RegistryStatus>>,
   faults: broadcast::Sender<ListenerFault>,
   task: Mutex<Option<JoinHandle<()>>>,
   next_id: AtomicU64,
   config: RegistryConfig,
}

impl ListenerRegistry {
   /// Takes ownership of `connection` and spawns the receive loop.
   pub fn start<C: PushConnection>(connection: C, config: RegistryConfig) -> Self {
      let (commands, commands_rx) = mpsc::channel(config.command_capacity.max(1));
      let (faults, _) = broadcast::channel(config.fault_capacity.max(1));
      let status = Arc::new(RwLock::new(RegistryStatus::Running));

      let receive_loop = ReceiveLoop {
         connection,
         lost: None,
         channels: HashMap::new(),
         status: Arc::clone(&status),
         faults: faults.clone(),
         teardown_timeout: config.teardown_timeout,
      };
      let task = tokio::spawn(receive_loop.run(commands_rx));

      Self {
         commands,
         status,
         faults,
         task: Mutex::new(Some(task)),
         next_id: AtomicU64::new(1),
         config,
      }
   }

   /// Registers `handler` for notifications on `channel`.
   ///
   /// The first handler on a channel issues `LISTEN` and waits for the server to
   /// acknowledge it; later handlers reuse the open subscription.
   pub async fn subscribe<H: NotificationHandler>(
      &self,
      channel: &str,
      handler: H,
   ) -> Result<ListenerHandle> {
      self.ensure_running()?;

      let id = self.next_id.fetch_add(1, Ordering::Relaxed);
      let slot = HandlerSlot::spawn(id, channel, Arc::new(handler), self.faults.clone());

      let (ack, ack_rx) = oneshot::channel();
      self
         .commands
         .send(Command::Subscribe {
            channel: channel.to_string(),
            slot,
            ack,
         })
         .await
         .map_err(|_| Error::RegistryClosed)?;
      ack_rx.await.map_err(|_| Error::RegistryClosed)??;

      Ok(ListenerHandle {
         channel: channel.to_string(),
         id,
         commands: self.commands.downgrade(),
      })
   }

   /// Subscribes to `channel` and returns the events as a stream.
   ///
   /// The stream ends once the handle is cancelled or the registry is disposed.
   pub async fn subscribe_stream(
      &self,
      channel: &str,
   ) -> Result<(ListenerHandle, NotificationStream)> {
      let (tx, rx) = mpsc::unbounded_channel();
      let handle = self
         .subscribe(channel, move |event: ListenerEvent| {
            let _ = tx.send(event);
            futures::future::ready(HandlerResult::Ok(()))
         })
         .await?;
      Ok((handle, NotificationStream::new(rx)))
   }

   /// Cancels one registration. Cancelling twice is a no-op.
   pub async fn unsubscribe(&self, handle: &ListenerHandle) -> Result<()> {
      handle.unlisten().await
   }

   /// Returns the channels and handler counts currently registered.
   pub async fn snapshot(&self) -> Result<RegistrySnapshot> {
      let (ack, ack_rx) = oneshot::channel();
      self
         .commands
         .send(Command::Snapshot { ack })
         .await
         .map_err(|_| Error::RegistryClosed)?;
      ack_rx.await.map_err(|_| Error::RegistryClosed)
   }

   /// Receives isolated failures: malformed payloads, handler errors and panics,
   /// connection loss and teardown problems.
   pub fn faults(&self) -> broadcast::Receiver<ListenerFault> {
      self.faults.subscribe()
   }

   pub fn status(&self) -> RegistryStatus {
      self.status.read().clone()
   }

   /// Cancels every handler, releases every channel and the connection, and
   /// waits for the receive loop to exit.
   ///
   /// Individual teardown failures are logged and collected rather than returned.
   /// Calling this more than once is a no-op.
   pub async fn dispose_all(&self) -> DisposeReport {
      let Some(task) = self.task.lock().take() else {
         trace!("Listener registry already disposed");
         return DisposeReport::default();
      };
      let abort = task.abort_handle();
      let deadline = self.config.dispose_timeout;

      let shutdown = async {
         let (ack, ack_rx) = oneshot::channel();
         if self.commands.send(Command::Shutdown { ack }).await.is_err() {
            return None;
         }
         ack_rx.await.ok()
      };

      let mut report = match timeout(deadline, shutdown).await {
         Ok(Some(report)) => report,
         Ok(None) => {
            debug!("Receive loop already stopped");
            DisposeReport::default()
         }
         Err(_) => {
            warn!(timeout = ?deadline, "Receive loop did not shut down in time, aborting");
            abort.abort();
            DisposeReport {
               errors: vec![format!("receive loop: shutdown timed out after {deadline:?}")],
               ..Default::default()
            }
         }
      };

      if let Err(e) = task.await
         && !e.is_cancelled()
      {
         error!(error = %e, "Receive loop terminated abnormally");
         report.errors.push(format!("receive loop: {e}"));
      }

      *self.status.write() = RegistryStatus::Disposed;
      report
   }

   fn ensure_running(&self) -> Result<()> {
      match &*self.status.read() {
         RegistryStatus::Running => Ok(()),
         RegistryStatus::Disconnected { reason } => Err(Error::SubscriptionFailed(reason.clone())),
         RegistryStatus::Disposed => Err(Error::RegistryClosed),
      }
   }
}

impl fmt::Debug for ListenerRegistry {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ListenerRegistry")
         .field("status", &*self.status.read())
         .field("config", &self.config)
         .finish()
   }
}

/// Cancellation handle for one handler registration.
///
/// Does not keep the registry alive; cancelling after the registry is gone is a
/// no-op.
#[derive(Clone)]
pub struct ListenerHandle {
   channel: String,
   id: HandlerId,
   commands: mpsc::WeakSender<Command>,
}

impl ListenerHandle {
   pub fn channel(&self) -> &str {
      &self.channel
   }

   pub fn id(&self) -> HandlerId {
      self.id
   }

   /// Removes this handler. The channel is released when its last handler goes.
   pub async fn unlisten(&self) -> Result<()> {
      let Some(commands) = self.commands.upgrade() else {
         return Ok(());
      };

      let (ack, ack_rx) = oneshot::channel();
      let sent = commands
         .send(Command::Unsubscribe {
            channel: self.channel.clone(),
            id: self.id,
            ack,
         })
         .await;
      drop(commands);

      if sent.is_err() {
         return Ok(());
      }
      ack_rx.await.unwrap_or(Ok(()))
   }
}

impl fmt::Debug for ListenerHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ListenerHandle")
         .field("channel", &self.channel)
         .field("id", &self.id)
         .finish()
   }
}
