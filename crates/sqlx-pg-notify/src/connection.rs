//! The push-connection seam used by the listener registry.
//!
//! The registry only needs three things from the connection that receives
//! `NOTIFY` traffic: start listening on a channel, stop listening, and wait for
//! the next message. [`PushConnection`] captures that, and is implemented for
//! sqlx's [`PgListener`].

use futures::future::BoxFuture;
use sqlx::postgres::PgListener;
use tracing::trace;

use crate::Result;

/// A notification as it arrives from the server, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
   pub channel: String,
   pub payload: String,
   pub process_id: u32,
}

/// A long-lived connection that receives pushed notifications.
///
/// Implementations are owned exclusively by one registry receive loop.
pub trait PushConnection: Send + 'static {
   /// Starts receiving notifications for `channel`. Resolves once the server
   /// has acknowledged the subscription.
   fn listen<'a>(&'a mut self, channel: &'a str) -> BoxFuture<'a, Result<()>>;

   /// Stops receiving notifications for `channel`.
   fn unlisten<'a>(&'a mut self, channel: &'a str) -> BoxFuture<'a, Result<()>>;

   /// Waits for the next notification.
   ///
   /// `Ok(None)` means the connection was lost. Must be cancel-safe: the registry
   /// races it against incoming commands.
   fn recv(&mut self) -> BoxFuture<'_, Result<Option<RawNotification>>>;

   /// Releases the connection.
   fn close(self) -> BoxFuture<'static, Result<()>>
   where
      Self: Sized;
}

impl PushConnection for PgListener {
   fn listen<'a>(&'a mut self, channel: &'a str) -> BoxFuture<'a, Result<()>> {
      Box::pin(async move {
         PgListener::listen(self, channel).await?;
         trace!(channel, "LISTEN acknowledged");
         Ok(())
      })
   }

   fn unlisten<'a>(&'a mut self, channel: &'a str) -> BoxFuture<'a, Result<()>> {
      Box::pin(async move {
         PgListener::unlisten(self, channel).await?;
         trace!(channel, "UNLISTEN acknowledged");
         Ok(())
      })
   }

   fn recv(&mut self) -> BoxFuture<'_, Result<Option<RawNotification>>> {
      // try_recv reports a dropped connection as Ok(None) instead of silently
      // reconnecting, which recv() would do.
      Box::pin(async move {
         let received = self.try_recv().await?;
         Ok(received.map(|notification| RawNotification {
            channel: notification.channel().to_string(),
            payload: notification.payload().to_string(),
            process_id: notification.process_id(),
         }))
      })
   }

   fn close(mut self) -> BoxFuture<'static, Result<()>> {
      Box::pin(async move {
         self.unlisten_all().await?;
         drop(self);
         Ok(())
      })
   }
}
