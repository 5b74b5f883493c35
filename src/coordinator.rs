//! Several tables watched as one unit (`watchTables`).

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use indexmap::map::Entry;
use parking_lot::Mutex;
use realtime_change_stream::{ConnectionId, EventKinds, Predicate, SubscriptionHandle, SubscriptionSpec};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::RuntimeContext;
use crate::reconcile::{ReconciliationState, Reloader};
use crate::watcher::{TableWatcher, WatchOptions};

/// One entry of a [`TableSetWatcher`]'s input list.
#[derive(Clone)]
pub struct TableSubscription {
   spec: SubscriptionSpec,
   reload: Arc<dyn Reloader>,
}

impl TableSubscription {
   pub fn new(table: impl Into<String>, reload: impl Reloader) -> Self {
      Self {
         spec: SubscriptionSpec::new(table),
         reload: Arc::new(reload),
      }
   }

   pub fn with_predicate(mut self, predicate: impl Into<Option<Predicate>>) -> Self {
      self.spec = self.spec.with_predicate(predicate);
      self
   }

   pub fn with_events(mut self, events: EventKinds) -> Self {
      self.spec = self.spec.with_events(events);
      self
   }

   pub fn table(&self) -> &str {
      self.spec.table()
   }

   /// Entries with equal keys are the same member: updating the input list
   /// with an equal entry keeps the running subscription and its reload.
   pub fn key(&self) -> &SubscriptionSpec {
      &self.spec
   }
}

impl std::fmt::Debug for TableSubscription {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("TableSubscription").field("spec", &self.spec).finish()
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSetOptions {
   pub enabled: bool,
   /// Coalescing window applied to every member. Zero reloads once per event.
   pub debounce: Duration,
}

impl Default for WatchSetOptions {
   fn default() -> Self {
      Self {
         enabled: true,
         debounce: Duration::ZERO,
      }
   }
}

impl WatchSetOptions {
   pub fn enabled(mut self, enabled: bool) -> Self {
      self.enabled = enabled;
      self
   }

   pub fn debounce(mut self, debounce: Duration) -> Self {
      self.debounce = debounce;
      self
   }
}

/// Connection status of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableState {
   pub connected: bool,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub error: Option<String>,
}

/// Table name to [`TableState`], in input order.
///
/// A table watched by several entries (different predicates) is connected
/// only when all of them are, and reports the first entry's error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MultiTableState(IndexMap<String, TableState>);

impl MultiTableState {
   pub fn get(&self, table: &str) -> Option<&TableState> {
      self.0.get(table)
   }

   pub fn iter(&self) -> impl Iterator<Item = (&str, &TableState)> {
      self.0.iter().map(|(table, state)| (table.as_str(), state))
   }

   pub fn tables(&self) -> impl Iterator<Item = &str> {
      self.0.keys().map(String::as_str)
   }

   pub fn len(&self) -> usize {
      self.0.len()
   }

   pub fn is_empty(&self) -> bool {
      self.0.is_empty()
   }

   /// True for a non-empty set whose tables are all connected.
   pub fn all_connected(&self) -> bool {
      !self.0.is_empty() && self.0.values().all(|state| state.connected)
   }

   fn collect<'a>(members: impl Iterator<Item = (&'a str, &'a ReconciliationState)>) -> Self {
      let mut tables: IndexMap<String, TableState> = IndexMap::new();
      for (table, state) in members {
         match tables.entry(table.to_string()) {
            Entry::Occupied(mut entry) => {
               let entry = entry.get_mut();
               entry.connected &= state.connected;
               if entry.error.is_none() {
                  entry.error = state.error.clone();
               }
            }
            Entry::Vacant(entry) => {
               entry.insert(TableState {
                  connected: state.connected,
                  error: state.error.clone(),
               });
            }
         }
      }
      Self(tables)
   }
}

/// Latest state of every member, folded into one [`MultiTableState`].
struct StatusBoard {
   sources: Mutex<Vec<(String, watch::Receiver<ReconciliationState>)>>,
   state_tx: watch::Sender<MultiTableState>,
}

impl StatusBoard {
   fn replace(&self, sources: Vec<(String, watch::Receiver<ReconciliationState>)>) {
      *self.sources.lock() = sources;
      self.rebuild();
   }

   fn rebuild(&self) {
      let next = {
         let sources = self.sources.lock();
         let states: Vec<(&str, ReconciliationState)> = sources
            .iter()
            .map(|(table, rx)| (table.as_str(), rx.borrow().clone()))
            .collect();
         MultiTableState::collect(states.iter().map(|(table, state)| (*table, state)))
      };
      self.state_tx.send_if_modified(|current| {
         if *current == next {
            return false;
         }
         *current = next;
         true
      });
   }
}

struct Member {
   watcher: TableWatcher,
   relay: JoinHandle<()>,
}

impl Drop for Member {
   fn drop(&mut self) {
      self.relay.abort();
   }
}

/// Watches every table of an input list, each with its own subscription and
/// reload, and aggregates their connection status.
///
/// Replacing the list only touches the entries that changed: members whose
/// key is still present keep their subscription.
///
/// Must be created inside a tokio runtime.
pub struct TableSetWatcher {
   ctx: RuntimeContext,
   options: WatchSetOptions,
   members: IndexMap<SubscriptionSpec, Member>,
   board: Arc<StatusBoard>,
}

impl TableSetWatcher {
   pub fn new(ctx: &RuntimeContext, subscriptions: Vec<TableSubscription>, options: WatchSetOptions) -> Self {
      let (state_tx, _) = watch::channel(MultiTableState::default());
      let mut watcher = Self {
         ctx: ctx.clone(),
         options,
         members: IndexMap::new(),
         board: Arc::new(StatusBoard {
            sources: Mutex::new(Vec::new()),
            state_tx,
         }),
      };
      watcher.set_subscriptions(subscriptions);
      watcher
   }

   /// Replaces the input list. Entries whose key is already watched keep
   /// their subscription; other entries are opened, and members missing
   /// from the list are closed. Duplicate keys are watched once.
   pub fn set_subscriptions(&mut self, subscriptions: Vec<TableSubscription>) {
      let mut previous = std::mem::take(&mut self.members);
      let mut opened = 0usize;

      for subscription in subscriptions {
         if self.members.contains_key(&subscription.spec) {
            continue;
         }
         let member = match previous.shift_remove(&subscription.spec) {
            Some(member) => member,
            None => {
               opened += 1;
               self.spawn_member(subscription.spec.clone(), subscription.reload)
            }
         };
         self.members.insert(subscription.spec, member);
      }

      let closed = previous.len();
      drop(previous);

      self.board.replace(
         self
            .members
            .values()
            .map(|member| (member.watcher.table().to_string(), member.watcher.watch_state()))
            .collect(),
      );
      debug!(members = self.members.len(), opened, closed, "Updated watched tables");
   }

   pub fn set_enabled(&mut self, enabled: bool) {
      if self.options.enabled == enabled {
         return;
      }
      self.options.enabled = enabled;
      for member in self.members.values_mut() {
         member.watcher.set_enabled(enabled);
      }
   }

   pub fn is_enabled(&self) -> bool {
      self.options.enabled
   }

   pub fn state(&self) -> MultiTableState {
      self.board.state_tx.borrow().clone()
   }

   pub fn watch_state(&self) -> watch::Receiver<MultiTableState> {
      self.board.state_tx.subscribe()
   }

   pub fn len(&self) -> usize {
      self.members.len()
   }

   pub fn is_empty(&self) -> bool {
      self.members.is_empty()
   }

   /// The subscription of the first member watching `table`.
   pub fn handle(&self, table: &str) -> Option<&SubscriptionHandle> {
      self.watcher(table).and_then(TableWatcher::subscription)
   }

   pub fn connection_id(&self, table: &str) -> Option<ConnectionId> {
      self.handle(table).map(SubscriptionHandle::connection_id)
   }

   /// The first member watching `table`.
   pub fn watcher(&self, table: &str) -> Option<&TableWatcher> {
      self
         .members
         .values()
         .map(|member| &member.watcher)
         .find(|watcher| watcher.table() == table)
   }

   /// Releases every member. Idempotent; also run on drop.
   pub fn close(&mut self) {
      if self.members.is_empty() {
         return;
      }
      let closed = self.members.len();
      self.members.clear();
      self.board.replace(Vec::new());
      debug!(closed, "Stopped watching tables");
   }

   fn spawn_member(&self, spec: SubscriptionSpec, reload: Arc<dyn Reloader>) -> Member {
      let options = WatchOptions::new()
         .enabled(self.options.enabled)
         .debounce(self.options.debounce)
         .poll_interval(Duration::ZERO);
      let watcher = TableWatcher::with_spec(&self.ctx, spec, reload, options);

      let mut updates = watcher.watch_state();
      let board = Arc::clone(&self.board);
      let relay = tokio::spawn(async move {
         while updates.changed().await.is_ok() {
            board.rebuild();
         }
      });

      Member { watcher, relay }
   }
}

impl Drop for TableSetWatcher {
   fn drop(&mut self) {
      self.close();
   }
}

impl std::fmt::Debug for TableSetWatcher {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("TableSetWatcher")
         .field("options", &self.options)
         .field("tables", &self.members.keys().map(SubscriptionSpec::table).collect::<Vec<_>>())
         .finish()
   }
}
