//! Registry tests against a live PostgreSQL server.
//!
//! Set `TEST_DATABASE_URL` (or `DATABASE_URL`) to run them; without either
//! variable every test returns early.

use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use sqlx::postgres::{PgListener, PgPool};
use sqlx_pg_notify::payload::encode;
use sqlx_pg_notify::{
   HandlerResult, ListenerEvent, ListenerRegistry, Operation, RegistryConfig, RowData,
};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn database_url() -> Option<String> {
   std::env::var("TEST_DATABASE_URL")
      .or_else(|_| std::env::var("DATABASE_URL"))
      .ok()
}

async fn start(url: &str) -> (PgPool, ListenerRegistry) {
   let pool = PgPool::connect(url).await.unwrap();
   let listener = PgListener::connect_with(&pool).await.unwrap();
   (pool, ListenerRegistry::start(listener, RegistryConfig::default()))
}

async fn send(pool: &PgPool, channel: &str, id: i64) {
   let mut row = RowData::new();
   row.insert("id".into(), json!(id));
   let payload = encode(Operation::Insert, OffsetDateTime::now_utc(), &row).unwrap();

   sqlx::query("SELECT pg_notify($1, $2)")
      .bind(channel)
      .bind(payload)
      .execute(pool)
      .await
      .unwrap();
}

#[tokio::test]
async fn test_live_notification_round_trip() {
   let Some(url) = database_url() else {
      return;
   };
   let (pool, registry) = start(&url).await;
   let (tx, mut rx) = mpsc::unbounded_channel();

   registry
      .subscribe("notify_live_round_trip", move |event: ListenerEvent| {
         let _ = tx.send(event);
         futures::future::ready(HandlerResult::Ok(()))
      })
      .await
      .unwrap();

   send(&pool, "notify_live_round_trip", 11).await;

   let event = timeout(Duration::from_secs(5), rx.recv())
      .await
      .expect("timed out waiting for notification")
      .unwrap();
   let notification = event.notification().unwrap();
   assert_eq!(notification.payload.operation, Operation::Insert);
   assert_eq!(notification.payload.get("id"), Some(&json!(11)));

   let report = registry.dispose_all().await;
   assert!(report.is_clean(), "errors: {:?}", report.errors);
   assert_eq!(report.channels_released, 1);
   pool.close().await;
}

#[tokio::test]
async fn test_live_rolled_back_notify_is_not_delivered() {
   let Some(url) = database_url() else {
      return;
   };
   let (pool, registry) = start(&url).await;
   let (handle, mut stream) = registry
      .subscribe_stream("notify_live_rollback")
      .await
      .unwrap();

   let mut tx = pool.begin().await.unwrap();
   sqlx::query("SELECT pg_notify('notify_live_rollback', 'discarded')")
      .execute(&mut *tx)
      .await
      .unwrap();
   tx.rollback().await.unwrap();

   send(&pool, "notify_live_rollback", 2).await;

   let event = timeout(Duration::from_secs(5), stream.next())
      .await
      .unwrap()
      .unwrap();
   // The first delivered notification is the committed one.
   assert_eq!(
      event.notification().unwrap().payload.get("id"),
      Some(&json!(2))
   );

   handle.unlisten().await.unwrap();
   registry.dispose_all().await;
   pool.close().await;
}
