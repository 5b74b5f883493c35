//! Timer-driven reload path that runs regardless of push subscription health.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::reconcile::Reconciler;

/// Longest supported interval; larger ones are lowered to it.
const MAX_INTERVAL: Duration = Duration::from_secs(86_400 * 365);

/// Requests a reload immediately and then once per interval.
///
/// Ticks go through [`Reconciler::request_poll`], so a tick that finds a
/// reload executing or queued is dropped instead of stacking a second one.
/// Dropping the fallback stops it.
pub struct PollingFallback {
   interval: Duration,
   task: JoinHandle<()>,
}

impl PollingFallback {
   /// Starts polling. `interval` is clamped to between one millisecond and
   /// one year.
   pub fn spawn(reconciler: Reconciler, interval: Duration) -> Self {
      let interval = interval.clamp(Duration::from_millis(1), MAX_INTERVAL);
      let table = reconciler.table();
      debug!(table = %table, ?interval, "Polling fallback started");

      let task = tokio::spawn(async move {
         let mut ticker = tokio::time::interval(interval);
         ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

         loop {
            ticker.tick().await;
            if !reconciler.is_live() {
               break;
            }
            reconciler.request_poll();
         }
         debug!(table = %table, "Polling stopped with its watcher");
      });

      Self { interval, task }
   }

   pub fn interval(&self) -> Duration {
      self.interval
   }

   pub fn is_running(&self) -> bool {
      !self.task.is_finished()
   }

   pub fn stop(&self) {
      self.task.abort();
   }
}

impl Drop for PollingFallback {
   fn drop(&mut self) {
      self.task.abort();
   }
}

impl std::fmt::Debug for PollingFallback {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("PollingFallback")
         .field("interval", &self.interval)
         .field("running", &self.is_running())
         .finish()
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::sync::Arc;
   use std::sync::atomic::{AtomicUsize, Ordering};

   use crate::error::ReloadError;

   #[tokio::test(start_paused = true)]
   async fn test_polls_immediately_then_per_interval() {
      let calls = Arc::new(AtomicUsize::new(0));
      let counter = Arc::clone(&calls);
      let reload = move || {
         counter.fetch_add(1, Ordering::SeqCst);
         async { Ok::<(), ReloadError>(()) }
      };
      let reconciler = Reconciler::spawn("registros", Arc::new(reload));
      let polling = PollingFallback::spawn(reconciler, Duration::from_millis(1000));

      tokio::time::sleep(Duration::from_millis(10)).await;
      assert_eq!(calls.load(Ordering::SeqCst), 1);

      tokio::time::sleep(Duration::from_millis(2500)).await;
      assert_eq!(calls.load(Ordering::SeqCst), 3);
      assert!(polling.is_running());

      polling.stop();
      tokio::time::sleep(Duration::from_millis(3000)).await;
      assert_eq!(calls.load(Ordering::SeqCst), 3);
      assert!(!polling.is_running());
   }

   #[tokio::test(start_paused = true)]
   async fn test_unbounded_interval_polls_once() {
      let calls = Arc::new(AtomicUsize::new(0));
      let counter = Arc::clone(&calls);
      let reload = move || {
         counter.fetch_add(1, Ordering::SeqCst);
         async { Ok::<(), ReloadError>(()) }
      };
      let reconciler = Reconciler::spawn("registros", Arc::new(reload));
      let polling = PollingFallback::spawn(reconciler, Duration::MAX);

      tokio::time::sleep(Duration::from_secs(86_400)).await;
      assert_eq!(calls.load(Ordering::SeqCst), 1);
      assert_eq!(polling.interval(), MAX_INTERVAL);
      assert!(polling.is_running());
   }

   #[tokio::test(start_paused = true)]
   async fn test_stops_when_reconciler_shuts_down() {
      let reload = || async { Ok::<(), ReloadError>(()) };
      let reconciler = Reconciler::spawn("registros", Arc::new(reload));
      let polling = PollingFallback::spawn(reconciler.clone(), Duration::from_millis(100));

      reconciler.shutdown();
      tokio::time::sleep(Duration::from_millis(250)).await;
      assert!(!polling.is_running());
   }
}
