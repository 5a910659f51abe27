//! Integration tests for the listener registry.
//!
//! Tests run against an in-memory push connection and verify:
//! - Subscription: LISTEN on first handler, reuse for later handlers
//! - Delivery: decoded payloads, per-channel ordering, stream adapter
//! - Isolation: malformed payloads, failing/panicking/stuck handlers
//! - Lifecycle: unsubscribe, connection loss, bounded idempotent dispose

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::json;
use sqlx_pg_notify::payload::encode;
use sqlx_pg_notify::{
   Error, HandlerResult, ListenerEvent, ListenerFault, ListenerRegistry, NotificationHandler,
   Operation, PushConnection, RawNotification, RegistryConfig, RegistryStatus, RowData,
};
use time::macros::datetime;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Default, Clone, Copy)]
struct Behavior {
   fail_listen: bool,
   hang_unlisten: bool,
}

/// Push connection fed from a channel. `None` simulates a dropped connection.
struct MockConnection {
   incoming: mpsc::UnboundedReceiver<Option<RawNotification>>,
   log: Arc<Mutex<Vec<String>>>,
   behavior: Behavior,
}

/// The "server" side of a [`MockConnection`].
struct MockServer {
   outgoing: mpsc::UnboundedSender<Option<RawNotification>>,
   log: Arc<Mutex<Vec<String>>>,
}

impl MockServer {
   fn notify(&self, channel: &str, payload: impl Into<String>) {
      self
         .outgoing
         .send(Some(RawNotification {
            channel: channel.to_string(),
            payload: payload.into(),
            process_id: 4242,
         }))
         .unwrap();
   }

   fn notify_row(&self, channel: &str, operation: Operation, id: i64) {
      let mut row = RowData::new();
      row.insert("id".into(), json!(id));
      row.insert("name".into(), json!(format!("item-{id}")));
      self.notify(
         channel,
         encode(operation, datetime!(2024-05-01 10:00 UTC), &row).unwrap(),
      );
   }

   fn disconnect(&self) {
      self.outgoing.send(None).unwrap();
   }

   fn log(&self) -> Vec<String> {
      self.log.lock().clone()
   }
}

fn mock_connection(behavior: Behavior) -> (MockConnection, MockServer) {
   let (outgoing, incoming) = mpsc::unbounded_channel();
   let log = Arc::new(Mutex::new(Vec::new()));
   (
      MockConnection {
         incoming,
         log: Arc::clone(&log),
         behavior,
      },
      MockServer { outgoing, log },
   )
}

impl PushConnection for MockConnection {
   fn listen<'a>(&'a mut self, channel: &'a str) -> BoxFuture<'a, sqlx_pg_notify::Result<()>> {
      Box::pin(async move {
         if self.behavior.fail_listen {
            return Err(Error::SubscriptionFailed("permission denied".into()));
         }
         self.log.lock().push(format!("LISTEN {channel}"));
         Ok(())
      })
   }

   fn unlisten<'a>(&'a mut self, channel: &'a str) -> BoxFuture<'a, sqlx_pg_notify::Result<()>> {
      Box::pin(async move {
         if self.behavior.hang_unlisten {
            futures::future::pending::<()>().await;
         }
         self.log.lock().push(format!("UNLISTEN {channel}"));
         Ok(())
      })
   }

   fn recv(&mut self) -> BoxFuture<'_, sqlx_pg_notify::Result<Option<RawNotification>>> {
      Box::pin(async move { Ok(self.incoming.recv().await.flatten()) })
   }

   fn close(self) -> BoxFuture<'static, sqlx_pg_notify::Result<()>> {
      Box::pin(async move {
         self.log.lock().push("CLOSE".to_string());
         Ok(())
      })
   }
}

fn start_registry(behavior: Behavior) -> (ListenerRegistry, MockServer) {
   let _ = tracing_subscriber::fmt().with_test_writer().try_init();
   let (connection, server) = mock_connection(behavior);
   let config = RegistryConfig::default()
      .with_teardown_timeout(Duration::from_millis(100))
      .with_dispose_timeout(Duration::from_secs(2));
   (ListenerRegistry::start(connection, config), server)
}

fn forward(tx: mpsc::UnboundedSender<ListenerEvent>) -> impl NotificationHandler {
   move |event: ListenerEvent| {
      let _ = tx.send(event);
      futures::future::ready(HandlerResult::Ok(()))
   }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ListenerEvent>) -> ListenerEvent {
   timeout(WAIT, rx.recv())
      .await
      .expect("timed out waiting for event")
      .expect("handler channel closed")
}

async fn next_fault(rx: &mut broadcast::Receiver<ListenerFault>) -> ListenerFault {
   timeout(WAIT, rx.recv())
      .await
      .expect("timed out waiting for fault")
      .expect("fault channel closed")
}

/// Passes when nothing arrives, either because the handler is idle or gone.
async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<ListenerEvent>) {
   if let Ok(Some(event)) = timeout(Duration::from_millis(100), rx.recv()).await {
      panic!("expected no event, got {event:?}");
   }
}

// ============================================================================
// Subscription and delivery
// ============================================================================

#[tokio::test]
async fn test_subscribe_delivers_decoded_notification() {
   let (registry, server) = start_registry(Behavior::default());
   let (tx, mut rx) = mpsc::unbounded_channel();

   let handle = registry.subscribe("items_changes", forward(tx)).await.unwrap();
   assert_eq!(handle.channel(), "items_changes");
   assert_eq!(server.log(), vec!["LISTEN items_changes"]);

   server.notify_row("items_changes", Operation::Insert, 1);

   let event = next_event(&mut rx).await;
   let notification = event.notification().expect("notification event");
   assert_eq!(notification.channel, "items_changes");
   assert_eq!(notification.process_id, 4242);
   assert_eq!(notification.payload.operation, Operation::Insert);
   assert_eq!(notification.payload.timestamp, datetime!(2024-05-01 10:00 UTC));
   assert_eq!(notification.payload.get("id"), Some(&json!(1)));
   assert_eq!(notification.payload.get("name"), Some(&json!("item-1")));

   registry.dispose_all().await;
}

#[tokio::test]
async fn test_second_handler_reuses_channel_subscription() {
   let (registry, server) = start_registry(Behavior::default());
   let (tx1, mut rx1) = mpsc::unbounded_channel();
   let (tx2, mut rx2) = mpsc::unbounded_channel();

   let first = registry.subscribe("items_changes", forward(tx1)).await.unwrap();
   let second = registry.subscribe("items_changes", forward(tx2)).await.unwrap();
   assert_ne!(first.id(), second.id());
   assert_eq!(server.log(), vec!["LISTEN items_changes"]);

   server.notify_row("items_changes", Operation::Update, 7);

   for rx in [&mut rx1, &mut rx2] {
      let event = next_event(rx).await;
      let notification = event.notification().unwrap();
      assert_eq!(notification.payload.operation, Operation::Update);
      assert_eq!(notification.payload.get("id"), Some(&json!(7)));
   }

   let snapshot = registry.snapshot().await.unwrap();
   assert_eq!(snapshot.channels.get("items_changes"), Some(&2));
   assert_eq!(snapshot.handler_count(), 2);

   registry.dispose_all().await;
}

#[tokio::test]
async fn test_notifications_arrive_in_send_order() {
   let (registry, server) = start_registry(Behavior::default());
   let (tx, mut rx) = mpsc::unbounded_channel();
   registry.subscribe("ordered", forward(tx)).await.unwrap();

   for id in 0..50 {
      server.notify_row("ordered", Operation::Insert, id);
   }

   for expected in 0..50 {
      let event = next_event(&mut rx).await;
      assert_eq!(
         event.notification().unwrap().payload.get("id"),
         Some(&json!(expected))
      );
   }

   registry.dispose_all().await;
}

#[tokio::test]
async fn test_channels_are_delivered_independently() {
   let (registry, server) = start_registry(Behavior::default());
   let (items_tx, mut items_rx) = mpsc::unbounded_channel();
   let (orders_tx, mut orders_rx) = mpsc::unbounded_channel();

   registry.subscribe("items", forward(items_tx)).await.unwrap();
   registry.subscribe("orders", forward(orders_tx)).await.unwrap();

   server.notify_row("orders", Operation::Delete, 3);
   server.notify_row("unrelated", Operation::Insert, 99);

   let event = next_event(&mut orders_rx).await;
   assert_eq!(event.notification().unwrap().channel, "orders");
   assert_silent(&mut items_rx).await;

   registry.dispose_all().await;
}

#[tokio::test]
async fn test_subscribe_stream_filters_operations() {
   let (registry, server) = start_registry(Behavior::default());
   let (handle, stream) = registry.subscribe_stream("items").await.unwrap();
   let mut stream = stream.filter_operations(vec![Operation::Delete]);

   server.notify_row("items", Operation::Insert, 1);
   server.notify_row("items", Operation::Delete, 2);

   let event = timeout(WAIT, stream.next()).await.unwrap().unwrap();
   let notification = event.notification().unwrap();
   assert_eq!(notification.payload.operation, Operation::Delete);
   assert_eq!(notification.payload.get("id"), Some(&json!(2)));

   handle.unlisten().await.unwrap();
   let end = timeout(WAIT, stream.next()).await.unwrap();
   assert!(end.is_none(), "stream should end after unlisten");

   registry.dispose_all().await;
}

// ============================================================================
// Unsubscribe
// ============================================================================

#[tokio::test]
async fn test_unsubscribe_leaves_other_handlers_running() {
   let (registry, server) = start_registry(Behavior::default());
   let (tx1, mut rx1) = mpsc::unbounded_channel();
   let (tx2, mut rx2) = mpsc::unbounded_channel();

   let first = registry.subscribe("items", forward(tx1)).await.unwrap();
   let second = registry.subscribe("items", forward(tx2)).await.unwrap();

   registry.unsubscribe(&first).await.unwrap();
   assert_eq!(server.log(), vec!["LISTEN items"]);

   server.notify_row("items", Operation::Insert, 1);
   next_event(&mut rx2).await;
   assert_silent(&mut rx1).await;

   second.unlisten().await.unwrap();
   assert_eq!(server.log(), vec!["LISTEN items", "UNLISTEN items"]);
   assert!(registry.snapshot().await.unwrap().is_empty());

   registry.dispose_all().await;
}

#[tokio::test]
async fn test_unsubscribe_twice_is_noop() {
   let (registry, server) = start_registry(Behavior::default());
   let (tx, _rx) = mpsc::unbounded_channel();
   let handle = registry.subscribe("items", forward(tx)).await.unwrap();

   handle.unlisten().await.unwrap();
   handle.unlisten().await.unwrap();
   registry.unsubscribe(&handle.clone()).await.unwrap();

   assert_eq!(server.log(), vec!["LISTEN items", "UNLISTEN items"]);
   registry.dispose_all().await;
}

#[tokio::test]
async fn test_failed_listen_registers_nothing() {
   let (registry, server) = start_registry(Behavior {
      fail_listen: true,
      ..Default::default()
   });
   let (tx, _rx) = mpsc::unbounded_channel();

   let result = registry.subscribe("items", forward(tx)).await;
   assert!(matches!(result, Err(Error::SubscriptionFailed(_))));
   assert!(registry.snapshot().await.unwrap().is_empty());
   assert!(server.log().is_empty());

   registry.dispose_all().await;
}

// ============================================================================
// Fault isolation
// ============================================================================

#[tokio::test]
async fn test_malformed_payload_is_reported_and_skipped() {
   let (registry, server) = start_registry(Behavior::default());
   let mut faults = registry.faults();
   let (tx, mut rx) = mpsc::unbounded_channel();
   registry.subscribe("items", forward(tx)).await.unwrap();

   server.notify("items", "this is not json");
   server.notify_row("items", Operation::Insert, 2);

   match next_fault(&mut faults).await {
      ListenerFault::MalformedPayload { channel, .. } => assert_eq!(channel, "items"),
      other => panic!("unexpected fault: {other:?}"),
   }

   let event = next_event(&mut rx).await;
   assert_eq!(event.notification().unwrap().payload.get("id"), Some(&json!(2)));

   registry.dispose_all().await;
}

#[tokio::test]
async fn test_failing_and_panicking_handlers_are_isolated() {
   let (registry, server) = start_registry(Behavior::default());
   let mut faults = registry.faults();
   let (tx, mut rx) = mpsc::unbounded_channel();

   let failing = registry
      .subscribe("items", |_event: ListenerEvent| async move {
         HandlerResult::Err("rejected".into())
      })
      .await
      .unwrap();
   let panicking = registry
      .subscribe("items", |event: ListenerEvent| async move {
         assert!(event.notification().is_none(), "handler bug");
         HandlerResult::Ok(())
      })
      .await
      .unwrap();
   registry.subscribe("items", forward(tx)).await.unwrap();

   server.notify_row("items", Operation::Insert, 1);
   server.notify_row("items", Operation::Insert, 2);

   // The healthy handler sees both notifications.
   for expected in [1, 2] {
      let event = next_event(&mut rx).await;
      assert_eq!(
         event.notification().unwrap().payload.get("id"),
         Some(&json!(expected))
      );
   }

   let mut failed = 0;
   let mut panicked = 0;
   while failed < 2 || panicked < 2 {
      match next_fault(&mut faults).await {
         ListenerFault::HandlerFailed {
            handler_id, reason, ..
         } => {
            assert_eq!(handler_id, failing.id());
            assert_eq!(reason, "rejected");
            failed += 1;
         }
         ListenerFault::HandlerPanicked { handler_id, .. } => {
            assert_eq!(handler_id, panicking.id());
            panicked += 1;
         }
         other => panic!("unexpected fault: {other:?}"),
      }
   }

   // A panic does not unregister the handler.
   assert_eq!(
      registry.snapshot().await.unwrap().channels.get("items"),
      Some(&3)
   );
   registry.dispose_all().await;
}

#[tokio::test]
async fn test_stuck_handler_does_not_block_others() {
   let (registry, server) = start_registry(Behavior::default());
   let (tx, mut rx) = mpsc::unbounded_channel();

   registry
      .subscribe("items", |_event: ListenerEvent| async move {
         futures::future::pending::<()>().await;
         HandlerResult::Ok(())
      })
      .await
      .unwrap();
   registry.subscribe("items", forward(tx)).await.unwrap();

   for id in 0..3 {
      server.notify_row("items", Operation::Update, id);
   }
   for _ in 0..3 {
      next_event(&mut rx).await;
   }

   // The stuck worker is aborted once the teardown bound passes.
   let report = timeout(WAIT, registry.dispose_all()).await.unwrap();
   assert_eq!(report.handlers_cancelled, 2);
   assert!(report.errors.iter().any(|e| e.starts_with("handlers")));
}

// ============================================================================
// Connection loss
// ============================================================================

#[tokio::test]
async fn test_connection_loss_is_surfaced_to_handlers() {
   let (registry, server) = start_registry(Behavior::default());
   let mut faults = registry.faults();
   let (tx, mut rx) = mpsc::unbounded_channel();
   let handle = registry.subscribe("items", forward(tx)).await.unwrap();

   server.disconnect();

   match next_event(&mut rx).await {
      ListenerEvent::Disconnected { reason } => assert_eq!(reason, "connection closed"),
      other => panic!("expected disconnect, got {other:?}"),
   }
   assert!(matches!(
      next_fault(&mut faults).await,
      ListenerFault::Disconnected { .. }
   ));
   assert!(matches!(
      registry.status(),
      RegistryStatus::Disconnected { .. }
   ));

   // No silent resubscription: new handlers are refused.
   let (tx2, _rx2) = mpsc::unbounded_channel();
   assert!(matches!(
      registry.subscribe("items", forward(tx2)).await,
      Err(Error::SubscriptionFailed(_))
   ));

   // Existing handles can still be cancelled without touching the connection.
   handle.unlisten().await.unwrap();
   let report = registry.dispose_all().await;
   assert!(report.is_clean());
   assert_eq!(server.log(), vec!["LISTEN items"]);
}

// ============================================================================
// Dispose
// ============================================================================

#[tokio::test]
async fn test_dispose_releases_everything() {
   let (registry, server) = start_registry(Behavior::default());
   let (tx, mut rx) = mpsc::unbounded_channel();

   let handle = registry.subscribe("items", forward(tx.clone())).await.unwrap();
   registry.subscribe("items", forward(tx.clone())).await.unwrap();
   registry.subscribe("orders", forward(tx)).await.unwrap();

   let report = registry.dispose_all().await;
   assert!(report.is_clean(), "errors: {:?}", report.errors);
   assert_eq!(report.handlers_cancelled, 3);
   assert_eq!(report.channels_released, 2);
   assert_eq!(registry.status(), RegistryStatus::Disposed);

   let mut log = server.log();
   assert_eq!(log.pop().as_deref(), Some("CLOSE"));
   log.sort();
   assert_eq!(
      log,
      vec!["LISTEN items", "LISTEN orders", "UNLISTEN items", "UNLISTEN orders"]
   );

   // Nothing is delivered after dispose.
   let _ = server.outgoing.send(Some(RawNotification {
      channel: "items".into(),
      payload: "{}".into(),
      process_id: 1,
   }));
   let closed = timeout(WAIT, rx.recv()).await.unwrap();
   assert!(closed.is_none());

   // Late cancellation and re-dispose are no-ops.
   handle.unlisten().await.unwrap();
   assert_eq!(registry.dispose_all().await, Default::default());
}

#[tokio::test]
async fn test_subscribe_after_dispose_fails() {
   let (registry, _server) = start_registry(Behavior::default());
   registry.dispose_all().await;

   let (tx, _rx) = mpsc::unbounded_channel();
   assert!(matches!(
      registry.subscribe("items", forward(tx)).await,
      Err(Error::RegistryClosed)
   ));
   assert!(matches!(
      registry.snapshot().await,
      Err(Error::RegistryClosed)
   ));
}

#[tokio::test]
async fn test_stuck_unlisten_does_not_block_dispose() {
   let (registry, server) = start_registry(Behavior {
      hang_unlisten: true,
      ..Default::default()
   });
   let mut faults = registry.faults();
   let (tx, _rx) = mpsc::unbounded_channel();
   registry.subscribe("items", forward(tx.clone())).await.unwrap();
   registry.subscribe("orders", forward(tx)).await.unwrap();

   let report = timeout(WAIT, registry.dispose_all()).await.unwrap();
   assert_eq!(report.handlers_cancelled, 2);
   assert_eq!(report.channels_released, 0);
   assert_eq!(report.errors.len(), 2);
   assert!(matches!(
      next_fault(&mut faults).await,
      ListenerFault::TeardownFailed { .. }
   ));

   // Remaining teardown still ran.
   assert_eq!(server.log().last().map(String::as_str), Some("CLOSE"));
   assert_eq!(registry.status(), RegistryStatus::Disposed);
}

#[tokio::test]
async fn test_dropping_registry_stops_receive_loop() {
   let (registry, server) = start_registry(Behavior::default());
   let (tx, mut rx) = mpsc::unbounded_channel();
   registry.subscribe("items", forward(tx)).await.unwrap();

   drop(registry);

   assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
   timeout(WAIT, async {
      while !server.log().contains(&"CLOSE".to_string()) {
         tokio::time::sleep(Duration::from_millis(10)).await;
      }
   })
   .await
   .unwrap();
   assert!(server.log().contains(&"UNLISTEN items".to_string()));
}
