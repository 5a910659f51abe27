use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::handler::ListenerEvent;
use crate::payload::Operation;

/// Events of one subscription as a `Stream`.
///
/// Returned by [`ListenerRegistry::subscribe_stream`](crate::ListenerRegistry::subscribe_stream).
/// Ends after the subscription is cancelled or the registry is disposed.
pub struct NotificationStream {
   inner: UnboundedReceiverStream<ListenerEvent>,
   filter_operations: Option<Vec<Operation>>,
}

impl NotificationStream {
   pub(crate) fn new(rx: mpsc::UnboundedReceiver<ListenerEvent>) -> Self {
      Self {
         inner: UnboundedReceiverStream::new(rx),
         filter_operations: None,
      }
   }

   /// Only yields notifications for the given operations.
   ///
   /// [`ListenerEvent::Disconnected`] is always yielded.
   pub fn filter_operations(mut self, operations: Vec<Operation>) -> Self {
      self.filter_operations = Some(operations);
      self
   }
}

impl Stream for NotificationStream {
   type Item = ListenerEvent;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      loop {
         match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(event)) => {
               if let (Some(operations), Some(notification)) =
                  (&self.filter_operations, event.notification())
                  && !operations.contains(&notification.payload.operation)
               {
                  continue;
               }
               return Poll::Ready(Some(event));
            }
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => return Poll::Pending,
         }
      }
   }
}
