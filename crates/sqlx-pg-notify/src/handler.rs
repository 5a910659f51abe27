//! Handler-facing event types.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::payload::NotificationPayload;

/// Error type handlers may return. Reported on the fault channel, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by a [`NotificationHandler`].
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// A decoded notification together with the channel it arrived on.
#[derive(Debug, Clone)]
pub struct Notification {
   pub channel: String,
   /// PID of the server backend that issued the `NOTIFY`.
   pub process_id: u32,
   pub payload: Arc<NotificationPayload>,
}

/// Event delivered to a subscribed handler.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
   /// A row change published on the subscribed channel.
   Notification(Notification),
   /// The shared listener connection was lost. No further notifications will
   /// arrive on this subscription.
   Disconnected { reason: String },
}

impl ListenerEvent {
   /// Returns the notification, if this event carries one.
   pub fn notification(&self) -> Option<&Notification> {
      match self {
         ListenerEvent::Notification(n) => Some(n),
         ListenerEvent::Disconnected { .. } => None,
      }
   }
}

/// Callback invoked for every event on a subscribed channel.
///
/// Implemented for any `Fn(ListenerEvent) -> impl Future<Output = HandlerResult>`:
///
/// ```
/// use sqlx_pg_notify::{HandlerResult, ListenerEvent};
///
/// let handler = |event: ListenerEvent| async move {
///     if let Some(n) = event.notification() {
///         println!("{} on {}", n.payload.operation, n.channel);
///     }
///     HandlerResult::Ok(())
/// };
/// # fn assert_handler<H: sqlx_pg_notify::NotificationHandler>(_: H) {}
/// # assert_handler(handler);
/// ```
pub trait NotificationHandler: Send + Sync + 'static {
   fn handle(&self, event: ListenerEvent) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> NotificationHandler for F
where
   F: Fn(ListenerEvent) -> Fut + Send + Sync + 'static,
   Fut: Future<Output = HandlerResult> + Send + 'static,
{
   fn handle(&self, event: ListenerEvent) -> BoxFuture<'static, HandlerResult> {
      Box::pin(self(event))
   }
}
