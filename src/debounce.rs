//! Cancel-and-reschedule timer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Stand-in deadline for delays that overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Default)]
struct Slot {
   generation: u64,
   timer: Option<AbortHandle>,
}

/// Runs an action once a quiet period has elapsed.
///
/// At most one action is pending at any time: scheduling cancels and
/// replaces the previous one. An action that has started is never
/// interrupted by a later [`schedule`](Self::schedule) or
/// [`cancel`](Self::cancel).
///
/// Dropping the debouncer cancels the pending action.
pub struct Debouncer {
   delay: Duration,
   slot: Arc<Mutex<Slot>>,
}

impl Debouncer {
   pub fn new(delay: Duration) -> Self {
      Self {
         delay,
         slot: Arc::new(Mutex::new(Slot::default())),
      }
   }

   pub fn delay(&self) -> Duration {
      self.delay
   }

   /// Schedules `action` to run `delay` from now, replacing any pending
   /// action. Must be called inside a tokio runtime.
   pub fn schedule<F>(&self, action: F)
   where
      F: FnOnce() + Send + 'static,
   {
      let now = Instant::now();
      let deadline = now.checked_add(self.delay).unwrap_or(now + FAR_FUTURE);
      let mut slot = self.slot.lock();
      if let Some(timer) = slot.timer.take() {
         timer.abort();
      }
      slot.generation += 1;

      let generation = slot.generation;
      let shared = Arc::clone(&self.slot);
      let timer = tokio::spawn(async move {
         tokio::time::sleep_until(deadline).await;
         {
            let mut slot = shared.lock();
            // Superseded while the abort was in flight.
            if slot.generation != generation {
               return;
            }
            slot.timer = None;
         }
         action();
      });
      slot.timer = Some(timer.abort_handle());
   }

   /// Cancels the pending action. Returns true if one was pending.
   pub fn cancel(&self) -> bool {
      let mut slot = self.slot.lock();
      slot.generation += 1;
      match slot.timer.take() {
         Some(timer) => {
            timer.abort();
            true
         }
         None => false,
      }
   }

   pub fn is_pending(&self) -> bool {
      self.slot.lock().timer.is_some()
   }
}

impl Drop for Debouncer {
   fn drop(&mut self) {
      self.cancel();
   }
}

impl std::fmt::Debug for Debouncer {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Debouncer")
         .field("delay", &self.delay)
         .field("pending", &self.is_pending())
         .finish()
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::sync::atomic::{AtomicUsize, Ordering};

   fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
      let count = Arc::new(AtomicUsize::new(0));
      let shared = Arc::clone(&count);
      (count, move || {
         let shared = Arc::clone(&shared);
         Box::new(move || {
            shared.fetch_add(1, Ordering::SeqCst);
         })
      })
   }

   #[tokio::test(start_paused = true)]
   async fn test_burst_runs_action_once() {
      let debouncer = Debouncer::new(Duration::from_millis(500));
      let (count, action) = counter();

      for _ in 0..3 {
         debouncer.schedule(action());
         tokio::time::sleep(Duration::from_millis(100)).await;
      }
      assert!(debouncer.is_pending());

      tokio::time::sleep(Duration::from_millis(399)).await;
      assert_eq!(count.load(Ordering::SeqCst), 0);

      tokio::time::sleep(Duration::from_millis(2)).await;
      assert_eq!(count.load(Ordering::SeqCst), 1);
      assert!(!debouncer.is_pending());
   }

   #[tokio::test(start_paused = true)]
   async fn test_cancel_prevents_action() {
      let debouncer = Debouncer::new(Duration::from_millis(100));
      let (count, action) = counter();

      debouncer.schedule(action());
      assert!(debouncer.cancel());
      assert!(!debouncer.cancel());

      tokio::time::sleep(Duration::from_millis(200)).await;
      assert_eq!(count.load(Ordering::SeqCst), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_drop_cancels_pending_action() {
      let (count, action) = counter();
      {
         let debouncer = Debouncer::new(Duration::from_millis(100));
         debouncer.schedule(action());
      }

      tokio::time::sleep(Duration::from_millis(200)).await;
      assert_eq!(count.load(Ordering::SeqCst), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_unbounded_delay_stays_pending() {
      let debouncer = Debouncer::new(Duration::MAX);
      let (count, action) = counter();

      debouncer.schedule(action());
      debouncer.schedule(action());
      tokio::time::sleep(Duration::from_secs(86_400)).await;

      assert_eq!(count.load(Ordering::SeqCst), 0);
      assert!(debouncer.is_pending());
      assert!(debouncer.cancel());
   }

   #[tokio::test(start_paused = true)]
   async fn test_separate_quiet_windows_each_fire() {
      let debouncer = Debouncer::new(Duration::from_millis(50));
      let (count, action) = counter();

      debouncer.schedule(action());
      tokio::time::sleep(Duration::from_millis(100)).await;
      debouncer.schedule(action());
      tokio::time::sleep(Duration::from_millis(100)).await;

      assert_eq!(count.load(Ordering::SeqCst), 2);
   }
}
