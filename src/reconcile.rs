//! Serialized reload execution and the per-watcher reconciliation state.
//!
//! Every watcher owns one [`Reconciler`]. Change events, poll ticks and manual
//! refreshes all become triggers on the reconciler's queue; a single worker
//! task runs the reload function for each trigger in order, so two reloads
//! for the same state never overlap.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::error::{Error, ReloadError, Result};

/// The caller-supplied refetch action.
///
/// Implemented for every `Fn() -> impl Future<Output = Result<(), ReloadError>>`
/// closure, so most callers never name this trait.
pub trait Reloader: Send + Sync + 'static {
   fn reload(&self) -> BoxFuture<'static, std::result::Result<(), ReloadError>>;
}

impl<F, Fut> Reloader for F
where
   F: Fn() -> Fut + Send + Sync + 'static,
   Fut: Future<Output = std::result::Result<(), ReloadError>> + Send + 'static,
{
   fn reload(&self) -> BoxFuture<'static, std::result::Result<(), ReloadError>> {
      Box::pin((self)())
   }
}

/// Observable state of one watcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationState {
   /// Whether the push subscription is acknowledged.
   pub connected: bool,
   /// Whether a reload is executing.
   pub reconciling: bool,
   /// Completion time of the last successful reload.
   #[serde(with = "time::serde::rfc3339::option")]
   pub last_reconciled_at: Option<OffsetDateTime>,
   /// Raw change events received since the watcher was created.
   pub change_count: u64,
   /// Subscription failure, if any.
   pub error: Option<String>,
   /// Failure of the most recent reload. Cleared by the next successful one.
   pub last_reload_error: Option<String>,
}

/// What caused a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
   Event,
   Poll,
   Manual,
}

enum Command {
   Reload {
      source: TriggerSource,
      done: Option<oneshot::Sender<Result<()>>>,
   },
   Stop,
}

struct Shared {
   table: Mutex<String>,
   state_tx: watch::Sender<ReconciliationState>,
   live: AtomicBool,
   in_flight: AtomicBool,
   queued: AtomicUsize,
}

impl Shared {
   fn table(&self) -> String {
      self.table.lock().clone()
   }

   /// Applies `f` unless the owner has been torn down.
   fn update(&self, f: impl FnOnce(&mut ReconciliationState) -> bool) -> bool {
      self.state_tx.send_if_modified(|state| {
         if !self.live.load(Ordering::Acquire) {
            return false;
         }
         f(state)
      })
   }
}

/// Handle to a watcher's reload worker.
///
/// Cloning is cheap; clones feed the same queue and observe the same state.
/// Must be spawned inside a tokio runtime.
#[derive(Clone)]
pub struct Reconciler {
   shared: Arc<Shared>,
   commands: mpsc::UnboundedSender<Command>,
}

impl Reconciler {
   pub fn spawn(table: impl Into<String>, reloader: Arc<dyn Reloader>) -> Self {
      let (commands, queue) = mpsc::unbounded_channel();
      let (state_tx, _) = watch::channel(ReconciliationState::default());
      let shared = Arc::new(Shared {
         table: Mutex::new(table.into()),
         state_tx,
         live: AtomicBool::new(true),
         in_flight: AtomicBool::new(false),
         queued: AtomicUsize::new(0),
      });

      tokio::spawn(run_worker(Arc::clone(&shared), reloader, queue));
      Self { shared, commands }
   }

   pub fn table(&self) -> String {
      self.shared.table()
   }

   pub(crate) fn set_table(&self, table: &str) {
      *self.shared.table.lock() = table.to_string();
   }

   pub fn state(&self) -> ReconciliationState {
      self.shared.state_tx.borrow().clone()
   }

   pub fn watch(&self) -> watch::Receiver<ReconciliationState> {
      self.shared.state_tx.subscribe()
   }

   /// Queues a change-driven reload. Never coalesced with other triggers.
   ///
   /// Returns false once the reconciler is shut down.
   pub fn request(&self) -> bool {
      self.enqueue(TriggerSource::Event, None)
   }

   /// Queues a poll-driven reload unless one is already executing or queued.
   pub fn request_poll(&self) -> bool {
      if self.is_busy() {
         trace!(table = %self.shared.table(), "Poll tick skipped, reload already pending");
         return false;
      }
      self.enqueue(TriggerSource::Poll, None)
   }

   /// Runs a reload now, bypassing any debounce, and waits for its outcome.
   ///
   /// The reload still runs after the ones already queued.
   pub async fn reconcile_now(&self) -> Result<()> {
      let (done, outcome) = oneshot::channel();
      if !self.enqueue(TriggerSource::Manual, Some(done)) {
         return Err(Error::WatcherClosed);
      }
      outcome.await.unwrap_or(Err(Error::WatcherClosed))
   }

   /// Whether a reload is executing or queued.
   pub fn is_busy(&self) -> bool {
      self.shared.in_flight.load(Ordering::Acquire) || self.shared.queued.load(Ordering::Acquire) > 0
   }

   pub fn is_live(&self) -> bool {
      self.shared.live.load(Ordering::Acquire)
   }

   /// Stops the worker. Queued triggers are dropped; an executing reload
   /// finishes but no longer updates the state. Idempotent.
   pub fn shutdown(&self) {
      if self.shared.live.swap(false, Ordering::AcqRel) {
         let _ = self.commands.send(Command::Stop);
         debug!(table = %self.shared.table(), "Reconciler shut down");
      }
   }

   pub(crate) fn record_change(&self) {
      self.shared.update(|state| {
         state.change_count += 1;
         true
      });
   }

   pub(crate) fn set_connection(&self, connected: bool, error: Option<String>) {
      self.shared.update(|state| {
         if state.connected == connected && state.error == error {
            return false;
         }
         state.connected = connected;
         state.error = error;
         true
      });
   }

   fn enqueue(&self, source: TriggerSource, done: Option<oneshot::Sender<Result<()>>>) -> bool {
      if !self.is_live() {
         return false;
      }
      self.shared.queued.fetch_add(1, Ordering::AcqRel);
      if self.commands.send(Command::Reload { source, done }).is_err() {
         self.shared.queued.fetch_sub(1, Ordering::AcqRel);
         return false;
      }
      true
   }
}

impl std::fmt::Debug for Reconciler {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Reconciler")
         .field("table", &self.shared.table())
         .field("live", &self.is_live())
         .field("busy", &self.is_busy())
         .finish()
   }
}

async fn run_worker(
   shared: Arc<Shared>,
   reloader: Arc<dyn Reloader>,
   mut queue: mpsc::UnboundedReceiver<Command>,
) {
   while let Some(command) = queue.recv().await {
      let Command::Reload { source, done } = command else {
         break;
      };
      shared.queued.fetch_sub(1, Ordering::AcqRel);

      if !shared.live.load(Ordering::Acquire) {
         if let Some(done) = done {
            let _ = done.send(Err(Error::WatcherClosed));
         }
         continue;
      }

      let table = shared.table();
      shared.in_flight.store(true, Ordering::Release);
      shared.update(|state| {
         state.reconciling = true;
         true
      });
      debug!(table = %table, ?source, "Reloading");

      let outcome = AssertUnwindSafe(async { reloader.reload().await })
         .catch_unwind()
         .await;
      let result = match outcome {
         Ok(Ok(())) => Ok(()),
         Ok(Err(e)) => Err(Error::Reload(e.to_string())),
         Err(panic) => Err(Error::ReloadPanicked(panic_message(&*panic))),
      };

      match &result {
         Ok(()) => debug!(table = %table, ?source, "Reload completed"),
         Err(e) => warn!(table = %table, ?source, error = %e, "Reload failed"),
      }

      let applied = shared.update(|state| {
         state.reconciling = false;
         match &result {
            Ok(()) => {
               state.last_reconciled_at = Some(OffsetDateTime::now_utc());
               state.last_reload_error = None;
            }
            Err(e) => state.last_reload_error = Some(e.to_string()),
         }
         true
      });
      if !applied {
         trace!(table = %table, "Reload finished after teardown, state left untouched");
      }
      shared.in_flight.store(false, Ordering::Release);

      if let Some(done) = done {
         let _ = done.send(result);
      }
   }
   trace!(table = %shared.table(), "Reload worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
   if let Some(message) = panic.downcast_ref::<&str>() {
      message.to_string()
   } else if let Some(message) = panic.downcast_ref::<String>() {
      message.clone()
   } else {
      "unknown panic".to_string()
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::time::Duration;

   fn counting(delay: Duration) -> (Arc<AtomicUsize>, Arc<dyn Reloader>) {
      let calls = Arc::new(AtomicUsize::new(0));
      let counter = Arc::clone(&calls);
      let reload = move || {
         let counter = Arc::clone(&counter);
         async move {
            tokio::time::sleep(delay).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), ReloadError>(())
         }
      };
      (calls, Arc::new(reload))
   }

   #[tokio::test(start_paused = true)]
   async fn test_requests_run_one_at_a_time() {
      let (calls, reload) = counting(Duration::from_millis(100));
      let reconciler = Reconciler::spawn("registros", reload);

      for _ in 0..3 {
         assert!(reconciler.request());
      }
      tokio::time::sleep(Duration::from_millis(150)).await;
      assert_eq!(calls.load(Ordering::SeqCst), 1);
      assert!(reconciler.state().reconciling);

      tokio::time::sleep(Duration::from_millis(200)).await;
      assert_eq!(calls.load(Ordering::SeqCst), 3);
      assert!(!reconciler.is_busy());
      assert!(reconciler.state().last_reconciled_at.is_some());
   }

   #[tokio::test(start_paused = true)]
   async fn test_poll_is_skipped_while_busy() {
      let (calls, reload) = counting(Duration::from_millis(100));
      let reconciler = Reconciler::spawn("registros", reload);

      assert!(reconciler.request_poll());
      assert!(!reconciler.request_poll());
      assert!(reconciler.request());

      tokio::time::sleep(Duration::from_millis(500)).await;
      assert_eq!(calls.load(Ordering::SeqCst), 2);
   }

   #[tokio::test]
   async fn test_failed_reload_is_recorded() {
      let reload = || async { Err::<(), ReloadError>("database offline".into()) };
      let reconciler = Reconciler::spawn("registros", Arc::new(reload));

      let err = reconciler.reconcile_now().await.unwrap_err();
      assert!(matches!(err, Error::Reload(ref message) if message == "database offline"));

      let state = reconciler.state();
      assert!(!state.reconciling);
      assert!(state.last_reconciled_at.is_none());
      assert_eq!(state.last_reload_error.as_deref(), Some("reload failed: database offline"));
   }

   #[tokio::test]
   async fn test_panicking_reload_is_caught() {
      let reload = || async {
         if true {
            panic!("boom");
         }
         Ok::<(), ReloadError>(())
      };
      let reconciler = Reconciler::spawn("registros", Arc::new(reload));

      let err = reconciler.reconcile_now().await.unwrap_err();
      assert!(matches!(err, Error::ReloadPanicked(ref message) if message == "boom"));
      assert!(reconciler.is_live());
      assert!(!reconciler.state().reconciling);
   }

   #[tokio::test(start_paused = true)]
   async fn test_shutdown_freezes_state() {
      let (calls, reload) = counting(Duration::from_millis(100));
      let reconciler = Reconciler::spawn("registros", reload);

      reconciler.request();
      reconciler.request();
      tokio::time::sleep(Duration::from_millis(10)).await;
      let before = reconciler.state();
      assert!(before.reconciling);

      reconciler.shutdown();
      reconciler.shutdown();
      tokio::time::sleep(Duration::from_millis(500)).await;

      assert_eq!(calls.load(Ordering::SeqCst), 1);
      assert_eq!(reconciler.state(), before);
      assert!(!reconciler.request());
      assert!(matches!(reconciler.reconcile_now().await, Err(Error::WatcherClosed)));
   }

   #[test]
   fn test_state_serializes_camel_case() {
      let state = ReconciliationState {
         connected: true,
         change_count: 2,
         ..Default::default()
      };
      let value = serde_json::to_value(&state).unwrap();

      assert_eq!(value["connected"], true);
      assert_eq!(value["changeCount"], 2);
      assert!(value["lastReconciledAt"].is_null());
   }
}
