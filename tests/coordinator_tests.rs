//! Integration tests for multi-table watching.
//!
//! Tests verify:
//! - Isolation: a change on one table reloads only that table
//! - Diffing: replacing the input list touches only the changed entries
//! - Status: per-table connection state and its roll-up
//! - Teardown: closing releases every member

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use realtime_change_stream::RowImage;
use realtime_sync::{
   ChangeEvent, LocalBroker, MultiTableSummary, Predicate, RealtimeDiagnostics, ReloadError, Reloader,
   RuntimeContext, SyncConfig, SyncIndicator, TablePreset, TableSetWatcher, TableSubscription, WatchSetOptions,
};
use serde_json::{Value, json};
use tokio::time::sleep;

fn setup() -> (Arc<LocalBroker>, RuntimeContext) {
   let broker = LocalBroker::new();
   let ctx = RuntimeContext::with_transport(broker.clone(), SyncConfig::default());
   (broker, ctx)
}

fn row(value: Value) -> RowImage {
   match value {
      Value::Object(map) => map,
      _ => RowImage::new(),
   }
}

async fn settle() {
   sleep(Duration::from_millis(1)).await;
}

fn counter() -> (Arc<AtomicUsize>, impl Reloader + Clone) {
   let calls = Arc::new(AtomicUsize::new(0));
   let counted = Arc::clone(&calls);
   let reload = move || {
      counted.fetch_add(1, Ordering::SeqCst);
      async { Ok::<(), ReloadError>(()) }
   };
   (calls, reload)
}

#[tokio::test(start_paused = true)]
async fn test_change_reloads_only_its_table() {
   let (broker, ctx) = setup();
   let (a_calls, a_reload) = counter();
   let (b_calls, b_reload) = counter();

   let watcher = TableSetWatcher::new(
      &ctx,
      vec![
         TableSubscription::new("personas", a_reload),
         TableSubscription::new("registros", b_reload),
      ],
      WatchSetOptions::default(),
   );
   settle().await;

   broker.publish(ChangeEvent::insert("personas", row(json!({"id": 1}))));
   settle().await;

   assert_eq!(a_calls.load(Ordering::SeqCst), 1);
   assert_eq!(b_calls.load(Ordering::SeqCst), 0);
   assert_eq!(watcher.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_removing_entry_keeps_other_subscriptions() {
   let (broker, ctx) = setup();
   let (a_calls, a_reload) = counter();
   let (_b_calls, b_reload) = counter();

   let mut watcher = TableSetWatcher::new(
      &ctx,
      vec![
         TableSubscription::new("personas", a_reload.clone()),
         TableSubscription::new("registros", b_reload),
      ],
      WatchSetOptions::default(),
   );
   settle().await;
   let personas = watcher.connection_id("personas").unwrap();

   watcher.set_subscriptions(vec![TableSubscription::new("personas", a_reload)]);
   settle().await;

   assert_eq!(watcher.connection_id("personas"), Some(personas));
   assert!(watcher.connection_id("registros").is_none());
   assert_eq!(broker.channels_for("registros"), 0);
   assert_eq!(broker.channels_for("personas"), 1);
   assert_eq!(watcher.state().tables().collect::<Vec<_>>(), ["personas"]);

   broker.publish(ChangeEvent::insert("personas", row(json!({"id": 2}))));
   settle().await;
   assert_eq!(a_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_adding_entry_opens_only_new_subscription() {
   let (broker, ctx) = setup();
   let (_calls, reload) = counter();

   let mut watcher = TableSetWatcher::new(
      &ctx,
      vec![TableSubscription::new("personas", reload.clone())],
      WatchSetOptions::default(),
   );
   settle().await;
   let personas = watcher.connection_id("personas").unwrap();

   watcher.set_subscriptions(vec![
      TableSubscription::new("personas", reload.clone()),
      TableSubscription::new("usuarios", reload.clone()),
      // Duplicate entries are watched once.
      TableSubscription::new("usuarios", reload),
   ]);
   settle().await;

   assert_eq!(watcher.len(), 2);
   assert_eq!(watcher.connection_id("personas"), Some(personas));
   assert_eq!(broker.channels_for("usuarios"), 1);
   assert_eq!(broker.released_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_changed_predicate_replaces_entry() {
   let (broker, ctx) = setup();
   let (calls, reload) = counter();

   let mut watcher = TableSetWatcher::new(
      &ctx,
      vec![
         TableSubscription::new("registros", reload.clone())
            .with_predicate(Predicate::eq("proyecto_id", 5).unwrap()),
      ],
      WatchSetOptions::default(),
   );
   settle().await;
   let before = watcher.connection_id("registros").unwrap();

   watcher.set_subscriptions(vec![
      TableSubscription::new("registros", reload).with_predicate(Predicate::eq("proyecto_id", 6).unwrap()),
   ]);
   settle().await;

   assert_ne!(watcher.connection_id("registros"), Some(before));
   assert_eq!(broker.channels_for("registros"), 1);

   broker.publish(ChangeEvent::insert("registros", row(json!({"proyecto_id": 5}))));
   broker.publish(ChangeEvent::insert("registros", row(json!({"proyecto_id": 6}))));
   settle().await;
   assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_state_reports_each_table() {
   let (broker, ctx) = setup();
   broker.reject_table("auditoria", "permission denied");
   let (_calls, reload) = counter();

   let watcher = TableSetWatcher::new(
      &ctx,
      vec![
         TableSubscription::new("personas", reload.clone()),
         TableSubscription::new("registros", reload.clone()),
         TableSubscription::new("auditoria", reload),
      ],
      WatchSetOptions::default(),
   );
   settle().await;

   let state = watcher.state();
   assert_eq!(state.len(), 3);
   assert!(state.get("personas").unwrap().connected);
   assert!(state.get("registros").unwrap().connected);
   let audit = state.get("auditoria").unwrap();
   assert!(!audit.connected);
   assert_eq!(audit.error.as_deref(), Some("permission denied"));

   let summary = MultiTableSummary::from_state(&state);
   assert_eq!(summary.label(), "2/3 tables live");
   assert_eq!(summary.indicator, SyncIndicator::Offline);
   assert_eq!(summary.failed, [("auditoria".to_string(), "permission denied".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_state_follows_connection_loss() {
   let (broker, ctx) = setup();
   let (_calls, reload) = counter();
   let watcher = TableSetWatcher::new(
      &ctx,
      vec![
         TableSubscription::new("personas", reload.clone()),
         TableSubscription::new("usuarios", reload),
      ],
      WatchSetOptions::default(),
   );
   let mut updates = watcher.watch_state();
   settle().await;
   assert!(watcher.state().all_connected());

   broker.fail_all("network down");
   let _ = updates.borrow_and_update();
   settle().await;
   assert!(updates.has_changed().unwrap());
   let state = watcher.state();
   assert!(!state.all_connected());
   assert_eq!(state.get("usuarios").unwrap().error.as_deref(), Some("network down"));

   broker.acknowledge_all();
   settle().await;
   assert!(watcher.state().all_connected());
}

#[tokio::test(start_paused = true)]
async fn test_disabling_releases_every_member() {
   let (broker, ctx) = setup();
   let (_calls, reload) = counter();
   let mut watcher = TableSetWatcher::new(
      &ctx,
      vec![
         TableSubscription::new("personas", reload.clone()),
         TableSubscription::new("usuarios", reload),
      ],
      WatchSetOptions::default(),
   );
   settle().await;

   watcher.set_enabled(false);
   settle().await;
   assert_eq!(broker.open_channels(), 0);
   assert!(!watcher.is_enabled());
   assert!(watcher.state().iter().all(|(_, table)| !table.connected));

   watcher.set_enabled(true);
   settle().await;
   assert_eq!(broker.open_channels(), 2);
   assert!(watcher.state().all_connected());
}

#[tokio::test(start_paused = true)]
async fn test_starting_disabled_opens_nothing() {
   let (broker, ctx) = setup();
   let (_calls, reload) = counter();
   let watcher = TableSetWatcher::new(
      &ctx,
      vec![TableSubscription::new("personas", reload)],
      WatchSetOptions::default().enabled(false),
   );
   settle().await;

   assert_eq!(broker.open_channels(), 0);
   assert!(watcher.handle("personas").is_none());
   assert!(!watcher.state().get("personas").unwrap().connected);
}

#[tokio::test(start_paused = true)]
async fn test_drop_releases_all_members() {
   let (broker, ctx) = setup();
   let (_calls, reload) = counter();
   let watcher = TableSetWatcher::new(
      &ctx,
      TablePreset::all()
         .iter()
         .map(|preset| TableSubscription::new(preset.table, reload.clone()).with_events(preset.events))
         .collect(),
      WatchSetOptions::default(),
   );
   settle().await;
   assert_eq!(broker.open_channels(), 6);
   assert_eq!(RealtimeDiagnostics::collect(&ctx).active_owners, 6);

   drop(watcher);
   settle().await;
   assert_eq!(broker.open_channels(), 0);
   assert_eq!(broker.released_count(), 6);
   assert_eq!(RealtimeDiagnostics::collect(&ctx).active_owners, 0);
}

#[tokio::test(start_paused = true)]
async fn test_members_share_debounce_window() {
   let (broker, ctx) = setup();
   let (calls, reload) = counter();
   let _watcher = TableSetWatcher::new(
      &ctx,
      vec![TableSubscription::new("registros", reload)],
      WatchSetOptions::default().debounce(Duration::from_millis(200)),
   );
   settle().await;

   for id in 0..4 {
      broker.publish(ChangeEvent::insert("registros", row(json!({"id": id}))));
   }
   sleep(Duration::from_millis(100)).await;
   assert_eq!(calls.load(Ordering::SeqCst), 0);

   sleep(Duration::from_millis(150)).await;
   assert_eq!(calls.load(Ordering::SeqCst), 1);
}
