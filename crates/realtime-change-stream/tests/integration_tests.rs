//! Integration tests for the change stream client over the in-process broker.
//!
//! Tests verify:
//! - Availability: subscribing without a transport fails recoverably
//! - Delivery: changes arrive in emission order, filtered by table, kind and predicate
//! - Status lifecycle: acknowledgement, rejection, timeout and recovery
//! - Teardown: close is idempotent and releases the channel exactly once
//! - Registry: owner-keyed bulk release and weak tracking

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use realtime_change_stream::{
   ChangeEvent, ChangeKind, ChangeStreamClient, ClientConfig, Error, EventKinds, LocalBroker,
   OwnerId, Predicate, RowImage, SubscriptionSpec, SubscriptionStatus,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn setup() -> (Arc<LocalBroker>, ChangeStreamClient) {
   let broker = LocalBroker::new();
   let client = ChangeStreamClient::new(broker.clone(), ClientConfig::default());
   (broker, client)
}

fn row(value: Value) -> RowImage {
   match value {
      Value::Object(map) => map,
      _ => RowImage::new(),
   }
}

fn collector() -> (
   impl Fn(ChangeEvent) + Send + Sync + 'static,
   mpsc::UnboundedReceiver<ChangeEvent>,
) {
   let (tx, rx) = mpsc::unbounded_channel();
   (
      move |change| {
         let _ = tx.send(change);
      },
      rx,
   )
}

async fn next(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> Option<ChangeEvent> {
   timeout(Duration::from_millis(200), rx.recv()).await.ok().flatten()
}

// ============================================================================
// Availability
// ============================================================================

#[tokio::test]
async fn test_unavailable_client_reports_error() {
   let client = ChangeStreamClient::unavailable(ClientConfig::default());
   assert!(!client.is_available());

   let result = client.subscribe(SubscriptionSpec::new("personas"), |_| {});
   assert!(matches!(result, Err(Error::TransportUnavailable)));
}

#[tokio::test]
async fn test_empty_table_is_rejected() {
   let (_broker, client) = setup();
   let result = client.subscribe(SubscriptionSpec::new(""), |_| {});
   assert!(matches!(result, Err(Error::EmptyTable)));
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_subscription_opens_and_delivers_in_order() {
   let (broker, client) = setup();
   let (callback, mut rx) = collector();

   let handle = client.subscribe(SubscriptionSpec::new("registros"), callback).unwrap();
   assert_eq!(handle.settled().await, SubscriptionStatus::Open);
   assert_eq!(handle.table(), "registros");
   assert!(handle.channel_name().starts_with("registros:"));

   for id in 0..5 {
      broker.publish(ChangeEvent::insert("registros", row(json!({"id": id}))));
   }

   for expected in 0..5 {
      let change = next(&mut rx).await.expect("change should be delivered");
      assert_eq!(change.kind(), ChangeKind::Insert);
      assert_eq!(change.after().and_then(|r| r.get("id")), Some(&json!(expected)));
   }
}

#[tokio::test]
async fn test_panicking_callback_loses_only_its_change() {
   let (broker, client) = setup();
   let (tx, mut rx) = mpsc::unbounded_channel();

   let handle = client
      .subscribe(SubscriptionSpec::new("registros"), move |change: ChangeEvent| {
         let id = change.after().and_then(|r| r.get("id")).and_then(Value::as_i64);
         if id == Some(0) {
            panic!("callback failed");
         }
         let _ = tx.send(id);
      })
      .unwrap();
   assert_eq!(handle.settled().await, SubscriptionStatus::Open);

   for id in 0..3 {
      broker.publish(ChangeEvent::insert("registros", row(json!({"id": id}))));
   }

   assert_eq!(timeout(Duration::from_millis(200), rx.recv()).await.unwrap(), Some(Some(1)));
   assert_eq!(timeout(Duration::from_millis(200), rx.recv()).await.unwrap(), Some(Some(2)));
   assert_eq!(handle.status(), SubscriptionStatus::Open);
}

#[tokio::test]
async fn test_changes_on_other_tables_are_not_delivered() {
   let (broker, client) = setup();
   let (callback, mut rx) = collector();

   let _handle = client.subscribe(SubscriptionSpec::new("personas"), callback).unwrap();
   broker.publish(ChangeEvent::insert("registros", row(json!({"id": 1}))));

   assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn test_predicate_narrows_delivery() {
   let (broker, client) = setup();
   let (five, mut five_rx) = collector();
   let (six, mut six_rx) = collector();

   let _a = client
      .subscribe(
         SubscriptionSpec::new("registros").with_predicate(Predicate::eq("proyecto_id", 5).unwrap()),
         five,
      )
      .unwrap();
   let _b = client
      .subscribe(
         SubscriptionSpec::new("registros").with_predicate(Predicate::eq("proyecto_id", 6).unwrap()),
         six,
      )
      .unwrap();

   assert_eq!(broker.publish(ChangeEvent::insert("registros", row(json!({"proyecto_id": 5})))), 1);

   assert!(next(&mut five_rx).await.is_some());
   assert!(next(&mut six_rx).await.is_none());
}

#[tokio::test]
async fn test_event_kinds_narrow_delivery() {
   let (broker, client) = setup();
   let (callback, mut rx) = collector();

   let _handle = client
      .subscribe(
         SubscriptionSpec::new("auditoria").with_events(EventKinds::only(ChangeKind::Insert)),
         callback,
      )
      .unwrap();

   broker.publish(ChangeEvent::delete("auditoria", row(json!({"id": 1}))));
   broker.publish(ChangeEvent::insert("auditoria", row(json!({"id": 2}))));

   let change = next(&mut rx).await.unwrap();
   assert_eq!(change.kind(), ChangeKind::Insert);
   assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn test_stream_subscription_ends_on_close() {
   let (broker, client) = setup();
   let (handle, mut stream) = client.subscribe_stream(SubscriptionSpec::new("usuarios")).unwrap();
   handle.settled().await;

   broker.publish(ChangeEvent::insert("usuarios", row(json!({"id": 1}))));
   let change = timeout(Duration::from_millis(200), stream.next()).await.unwrap();
   assert_eq!(change.map(|c| c.kind()), Some(ChangeKind::Insert));

   handle.close().await;
   let end = timeout(Duration::from_millis(200), stream.next()).await.unwrap();
   assert!(end.is_none());
}

// ============================================================================
// Status Lifecycle
// ============================================================================

#[tokio::test]
async fn test_rejected_join_reports_error_status() {
   let (broker, client) = setup();
   broker.reject_table("usuarios", "permission denied");

   let handle = client.subscribe(SubscriptionSpec::new("usuarios"), |_| {}).unwrap();
   let status = handle.settled().await;

   assert_eq!(status, SubscriptionStatus::Error("permission denied".into()));
   assert_eq!(status.error_message().as_deref(), Some("permission denied"));
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_join_times_out_then_recovers() {
   let (broker, client) = setup();
   broker.set_auto_ack(false);

   let handle = client.subscribe(SubscriptionSpec::new("personas"), |_| {}).unwrap();
   tokio::time::sleep(Duration::from_secs(5)).await;
   assert_eq!(handle.status(), SubscriptionStatus::Connecting);

   tokio::time::sleep(Duration::from_secs(6)).await;
   assert_eq!(handle.status(), SubscriptionStatus::TimedOut);

   assert!(broker.acknowledge(handle.channel_name()));
   let mut status = handle.watch_status();
   status.wait_for(|s| s.is_open()).await.unwrap();
}

#[tokio::test]
async fn test_connection_failure_and_recovery() {
   let (broker, client) = setup();
   let handle = client.subscribe(SubscriptionSpec::new("personas"), |_| {}).unwrap();
   handle.settled().await;

   let mut status = handle.watch_status();
   broker.fail_all("connection lost");
   status
      .wait_for(|s| matches!(s, SubscriptionStatus::Error(_)))
      .await
      .unwrap();

   broker.acknowledge_all();
   status.wait_for(|s| s.is_open()).await.unwrap();
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_close_is_idempotent() {
   let (broker, client) = setup();
   let handle = client.subscribe(SubscriptionSpec::new("personas"), |_| {}).unwrap();
   handle.settled().await;
   assert_eq!(broker.open_channels(), 1);

   handle.close().await;
   handle.close().await;
   handle.dispose();
   client.unsubscribe(Some(&handle)).await;
   client.unsubscribe(None).await;

   assert!(handle.is_closed());
   assert_eq!(handle.status(), SubscriptionStatus::Closed);
   assert_eq!(broker.open_channels(), 0);
   assert_eq!(broker.released_count(), 1);
}

#[tokio::test]
async fn test_closed_handle_receives_nothing() {
   let (broker, client) = setup();
   let (callback, mut rx) = collector();

   let handle = client.subscribe(SubscriptionSpec::new("personas"), callback).unwrap();
   handle.settled().await;
   handle.close().await;

   assert_eq!(broker.publish(ChangeEvent::insert("personas", row(json!({"id": 1})))), 0);
   assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn test_dropping_handle_releases_channel() {
   let (broker, client) = setup();
   let handle = client.subscribe(SubscriptionSpec::new("personas"), |_| {}).unwrap();
   handle.settled().await;

   drop(handle);
   tokio::time::sleep(Duration::from_millis(20)).await;

   assert_eq!(broker.open_channels(), 0);
   assert_eq!(broker.released_count(), 1);
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn test_release_all_closes_owner_subscriptions_only() {
   let (broker, client) = setup();
   let owner = OwnerId::new();
   let other = OwnerId::new();

   let mine: Vec<_> = ["personas", "registros", "usuarios"]
      .into_iter()
      .map(|table| client.subscribe_for(owner, SubscriptionSpec::new(table), |_| {}).unwrap())
      .collect();
   let theirs = client.subscribe_for(other, SubscriptionSpec::new("personas"), |_| {}).unwrap();

   assert_eq!(client.registry().active_count(owner), 3);
   assert_eq!(client.registry().owner_count(), 2);

   assert_eq!(client.release_all(owner), 3);
   assert_eq!(client.release_all(owner), 0);
   assert_eq!(client.registry().active_count(owner), 0);
   assert!(mine.iter().all(|h| h.is_closed()));
   assert!(!theirs.is_closed());

   tokio::time::sleep(Duration::from_millis(20)).await;
   assert_eq!(broker.open_channels(), 1);
}

#[tokio::test]
async fn test_release_everything_closes_every_owner() {
   let (broker, client) = setup();
   let first = client.subscribe_for(OwnerId::new(), SubscriptionSpec::new("personas"), |_| {}).unwrap();
   let second = client.subscribe_for(OwnerId::new(), SubscriptionSpec::new("registros"), |_| {}).unwrap();
   let unregistered = client.subscribe(SubscriptionSpec::new("usuarios"), |_| {}).unwrap();

   assert_eq!(client.registry().release_everything(), 2);
   assert_eq!(client.registry().release_everything(), 0);
   assert_eq!(client.registry().owner_count(), 0);
   assert!(first.is_closed() && second.is_closed());
   assert!(!unregistered.is_closed());

   tokio::time::sleep(Duration::from_millis(20)).await;
   assert_eq!(broker.open_channels(), 1);
}

#[tokio::test]
async fn test_registry_tracks_handles_weakly() {
   let (_broker, client) = setup();
   let owner = OwnerId::new();

   let first = client.subscribe_for(owner, SubscriptionSpec::new("personas"), |_| {}).unwrap();
   let second = client.subscribe_for(owner, SubscriptionSpec::new("registros"), |_| {}).unwrap();
   assert_eq!(client.registry().active_count(owner), 2);

   drop(first);
   assert_eq!(client.registry().active_count(owner), 1);

   client.registry().forget(owner, &second);
   assert_eq!(client.registry().active_count(owner), 0);
   assert!(!second.is_closed());
}
