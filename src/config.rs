//! Configuration for the sync layer.

use std::time::Duration;

use realtime_change_stream::ClientConfig;
use serde::{Deserialize, Serialize};

/// Defaults applied to watchers created from a
/// [`RuntimeContext`](crate::RuntimeContext).
///
/// # Examples
///
/// ```
/// use realtime_sync::SyncConfig;
///
/// let config = SyncConfig {
///     default_debounce_ms: 500,
///     ..Default::default()
/// };
/// assert_eq!(config.default_debounce().as_millis(), 500);
/// assert!(config.default_poll_interval().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
   /// Coalescing window for change-driven reloads (in milliseconds). Zero
   /// reloads once per event.
   ///
   /// Default: 0
   pub default_debounce_ms: u64,

   /// Interval of the polling fallback (in milliseconds). `None` or zero
   /// disables polling.
   ///
   /// Default: None
   pub default_poll_interval_ms: Option<u64>,

   /// Change stream client settings used by
   /// [`RuntimeContext::from_env`](crate::RuntimeContext::from_env).
   pub client: ClientConfig,
}

impl Default for SyncConfig {
   fn default() -> Self {
      Self {
         default_debounce_ms: 0,
         default_poll_interval_ms: None,
         client: ClientConfig::default(),
      }
   }
}

impl SyncConfig {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn with_default_debounce(mut self, debounce: Duration) -> Self {
      self.default_debounce_ms = debounce.as_millis() as u64;
      self
   }

   pub fn with_default_poll_interval(mut self, interval: Option<Duration>) -> Self {
      self.default_poll_interval_ms = interval.map(|i| i.as_millis() as u64);
      self
   }

   pub fn with_client(mut self, client: ClientConfig) -> Self {
      self.client = client;
      self
   }

   pub fn default_debounce(&self) -> Duration {
      Duration::from_millis(self.default_debounce_ms)
   }

   pub fn default_poll_interval(&self) -> Option<Duration> {
      self
         .default_poll_interval_ms
         .filter(|ms| *ms > 0)
         .map(Duration::from_millis)
   }
}
