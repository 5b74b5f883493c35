//! Debounced reconciliation of one table (`watchTable`).

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use realtime_change_stream::{
   ChangeEvent, ChangeStreamClient, EventCallback, EventKinds, OwnerId, Predicate, SubscriptionHandle,
   SubscriptionSpec, SubscriptionStatus,
};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};

use crate::context::RuntimeContext;
use crate::debounce::Debouncer;
use crate::error::Result;
use crate::polling::PollingFallback;
use crate::reconcile::{ReconciliationState, Reconciler, Reloader};

/// Options of a [`TableWatcher`]. Unset durations fall back to the
/// context's [`SyncConfig`](crate::SyncConfig).
#[derive(Clone)]
pub struct WatchOptions {
   enabled: bool,
   predicate: Option<Predicate>,
   events: EventKinds,
   debounce: Option<Duration>,
   poll_interval: Option<Duration>,
   on_change: Option<EventCallback>,
}

impl Default for WatchOptions {
   fn default() -> Self {
      Self {
         enabled: true,
         predicate: None,
         events: EventKinds::all(),
         debounce: None,
         poll_interval: None,
         on_change: None,
      }
   }
}

impl WatchOptions {
   pub fn new() -> Self {
      Self::default()
   }

   /// When false, no subscription is opened. Polling is unaffected.
   pub fn enabled(mut self, enabled: bool) -> Self {
      self.enabled = enabled;
      self
   }

   pub fn predicate(mut self, predicate: impl Into<Option<Predicate>>) -> Self {
      self.predicate = predicate.into();
      self
   }

   pub fn events(mut self, events: EventKinds) -> Self {
      self.events = events;
      self
   }

   /// Coalescing window. Zero reloads once per event.
   pub fn debounce(mut self, debounce: Duration) -> Self {
      self.debounce = Some(debounce);
      self
   }

   /// Polling fallback interval. Zero disables polling.
   pub fn poll_interval(mut self, interval: Duration) -> Self {
      self.poll_interval = Some(interval);
      self
   }

   /// Invoked once per raw change event, before any debounce. A panic in
   /// the callback is logged and the reload still happens.
   pub fn on_change<F>(mut self, on_change: F) -> Self
   where
      F: Fn(ChangeEvent) + Send + Sync + 'static,
   {
      self.on_change = Some(Arc::new(on_change));
      self
   }
}

impl std::fmt::Debug for WatchOptions {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("WatchOptions")
         .field("enabled", &self.enabled)
         .field("predicate", &self.predicate)
         .field("events", &self.events)
         .field("debounce", &self.debounce)
         .field("poll_interval", &self.poll_interval)
         .field("on_change", &self.on_change.is_some())
         .finish()
   }
}

/// What a view renders from a watcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchStatus {
   pub connected: bool,
   pub reconciling: bool,
   #[serde(with = "time::serde::rfc3339::option")]
   pub last_reconciled_at: Option<OffsetDateTime>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub error: Option<String>,
}

impl From<&ReconciliationState> for WatchStatus {
   fn from(state: &ReconciliationState) -> Self {
      Self {
         connected: state.connected,
         reconciling: state.reconciling,
         last_reconciled_at: state.last_reconciled_at,
         error: state.error.clone(),
      }
   }
}

/// Keeps a caller's data fresh by reloading it whenever `table` changes.
///
/// Each change event is counted, handed to the `on_change` hook, and then
/// either triggers a reload directly or (re)starts the debounce window.
/// Reloads are serialized through a [`Reconciler`]. An optional polling
/// fallback feeds the same reconciler.
///
/// Changing the table, predicate, event kinds or enabled flag tears the
/// subscription down and opens a new one. Dropping the watcher cancels the
/// pending debounce, stops polling and releases every subscription it owns;
/// a reload still executing at that point finishes without touching the
/// state.
///
/// Must be created inside a tokio runtime.
pub struct TableWatcher {
   client: ChangeStreamClient,
   owner: OwnerId,
   spec: SubscriptionSpec,
   enabled: bool,
   reconciler: Reconciler,
   debouncer: Option<Arc<Debouncer>>,
   on_change: Option<EventCallback>,
   handle: Option<SubscriptionHandle>,
   mirror: Option<JoinHandle<()>>,
   polling: Option<PollingFallback>,
   closed: bool,
}

impl TableWatcher {
   pub fn new(
      ctx: &RuntimeContext,
      table: impl Into<String>,
      reload: impl Reloader,
      options: WatchOptions,
   ) -> Self {
      let spec = SubscriptionSpec::new(table)
         .with_predicate(options.predicate.clone())
         .with_events(options.events);
      Self::with_spec(ctx, spec, Arc::new(reload), options)
   }

   /// Like [`new`](Self::new) with a complete spec. The predicate and event
   /// kinds in `options` are ignored.
   pub fn with_spec(
      ctx: &RuntimeContext,
      spec: SubscriptionSpec,
      reload: Arc<dyn Reloader>,
      options: WatchOptions,
   ) -> Self {
      let reconciler = Reconciler::spawn(spec.table(), reload);

      let debounce = options.debounce.unwrap_or_else(|| ctx.config().default_debounce());
      let debouncer = (!debounce.is_zero()).then(|| Arc::new(Debouncer::new(debounce)));

      let poll_interval = match options.poll_interval {
         Some(interval) => Some(interval).filter(|i| !i.is_zero()),
         None => ctx.config().default_poll_interval(),
      };
      let polling = poll_interval.map(|interval| PollingFallback::spawn(reconciler.clone(), interval));

      let mut watcher = Self {
         client: ctx.client().clone(),
         owner: OwnerId::new(),
         spec,
         enabled: options.enabled,
         reconciler,
         debouncer,
         on_change: options.on_change,
         handle: None,
         mirror: None,
         polling,
         closed: false,
      };
      debug!(
         table = %watcher.spec.table(),
         owner = %watcher.owner,
         ?debounce,
         ?poll_interval,
         enabled = watcher.enabled,
         "Watching table"
      );
      watcher.open();
      watcher
   }

   pub fn table(&self) -> &str {
      self.spec.table()
   }

   pub fn spec(&self) -> &SubscriptionSpec {
      &self.spec
   }

   pub fn owner(&self) -> OwnerId {
      self.owner
   }

   pub fn is_enabled(&self) -> bool {
      self.enabled
   }

   pub fn set_enabled(&mut self, enabled: bool) {
      if self.enabled == enabled {
         return;
      }
      self.enabled = enabled;
      self.reopen();
   }

   pub fn set_table(&mut self, table: impl Into<String>) {
      let spec = SubscriptionSpec::new(table)
         .with_schema(self.spec.schema())
         .with_predicate(self.spec.predicate().cloned())
         .with_events(self.spec.events());
      self.set_spec(spec);
   }

   pub fn set_predicate(&mut self, predicate: impl Into<Option<Predicate>>) {
      let spec = self.spec.clone().with_predicate(predicate);
      self.set_spec(spec);
   }

   pub fn set_events(&mut self, events: EventKinds) {
      let spec = self.spec.clone().with_events(events);
      self.set_spec(spec);
   }

   /// Replaces what is watched. An equal spec keeps the current subscription.
   pub fn set_spec(&mut self, spec: SubscriptionSpec) {
      if spec == self.spec {
         return;
      }
      self.reconciler.set_table(spec.table());
      self.spec = spec;
      self.reopen();
   }

   /// Reloads now, bypassing the debounce window. A pending debounced
   /// reload stays scheduled.
   pub async fn force_reconcile(&self) -> Result<()> {
      self.reconciler.reconcile_now().await
   }

   pub fn status(&self) -> WatchStatus {
      WatchStatus::from(&self.reconciler.state())
   }

   pub fn state(&self) -> ReconciliationState {
      self.reconciler.state()
   }

   pub fn watch_state(&self) -> watch::Receiver<ReconciliationState> {
      self.reconciler.watch()
   }

   /// The current state followed by every later change.
   pub fn state_stream(&self) -> WatchStream<ReconciliationState> {
      WatchStream::new(self.reconciler.watch())
   }

   pub fn subscription(&self) -> Option<&SubscriptionHandle> {
      self.handle.as_ref()
   }

   /// Open subscriptions registered to this watcher.
   pub fn active_subscriptions(&self) -> usize {
      self.client.registry().active_count(self.owner)
   }

   pub fn is_polling(&self) -> bool {
      self.polling.as_ref().is_some_and(PollingFallback::is_running)
   }

   pub fn is_closed(&self) -> bool {
      self.closed
   }

   /// Tears everything down. Idempotent; also run on drop.
   pub fn close(&mut self) {
      if self.closed {
         return;
      }
      self.closed = true;

      self.reconciler.shutdown();
      if let Some(polling) = self.polling.take() {
         polling.stop();
      }
      self.teardown();
      self.client.release_all(self.owner);
      debug!(table = %self.spec.table(), owner = %self.owner, "Stopped watching table");
   }

   fn reopen(&mut self) {
      if self.closed {
         return;
      }
      self.teardown();
      self.reconciler.set_connection(false, None);
      self.open();
   }

   fn open(&mut self) {
      if !self.enabled {
         return;
      }

      let reconciler = self.reconciler.clone();
      let debouncer = self.debouncer.clone();
      let on_change = self.on_change.clone();
      let subscribed = self.client.subscribe_for(self.owner, self.spec.clone(), move |change| {
         if !reconciler.is_live() {
            return;
         }
         reconciler.record_change();
         if let Some(on_change) = &on_change {
            if catch_unwind(AssertUnwindSafe(|| on_change(change))).is_err() {
               warn!(table = %reconciler.table(), "on_change callback panicked");
            }
         }
         match &debouncer {
            Some(debouncer) => {
               let reconciler = reconciler.clone();
               debouncer.schedule(move || {
                  reconciler.request();
               });
            }
            None => {
               reconciler.request();
            }
         }
      });

      match subscribed {
         Ok(handle) => {
            self.mirror = Some(tokio::spawn(mirror_status(
               handle.watch_status(),
               self.reconciler.clone(),
            )));
            self.handle = Some(handle);
         }
         Err(e) => {
            warn!(table = %self.spec.table(), error = %e, "Watching without realtime updates");
            self.reconciler.set_connection(false, Some(e.to_string()));
         }
      }
   }

   fn teardown(&mut self) {
      if let Some(mirror) = self.mirror.take() {
         mirror.abort();
      }
      if let Some(debouncer) = &self.debouncer {
         debouncer.cancel();
      }
      if let Some(handle) = self.handle.take() {
         self.client.registry().forget(self.owner, &handle);
         handle.dispose();
      }
   }
}

impl Drop for TableWatcher {
   fn drop(&mut self) {
      self.close();
   }
}

impl std::fmt::Debug for TableWatcher {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("TableWatcher")
         .field("spec", &self.spec)
         .field("owner", &self.owner)
         .field("enabled", &self.enabled)
         .field("status", &self.status())
         .field("closed", &self.closed)
         .finish()
   }
}

/// Copies subscription status transitions into the reconciliation state.
async fn mirror_status(mut status: watch::Receiver<SubscriptionStatus>, reconciler: Reconciler) {
   loop {
      let current = status.borrow_and_update().clone();
      reconciler.set_connection(current.is_open(), current.error_message());
      if current.is_closed() || status.changed().await.is_err() {
         break;
      }
   }
}
