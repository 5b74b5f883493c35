//! Configuration for the change stream client.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for [`ChangeStreamClient`](crate::ChangeStreamClient).
///
/// # Examples
///
/// ```
/// use realtime_change_stream::ClientConfig;
///
/// // Use defaults
/// let config = ClientConfig::default();
/// assert_eq!(config.subscribe_timeout_ms, 10_000);
///
/// // Override just one field
/// let config = ClientConfig {
///     subscribe_timeout_ms: 3_000,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
   /// How long a subscription may stay `Connecting` before it is reported
   /// as `TimedOut` (in milliseconds).
   ///
   /// A late acknowledgement still opens the subscription.
   ///
   /// Default: 10000
   pub subscribe_timeout_ms: u64,

   /// Upper bound on waiting for the transport to release a channel during
   /// [`SubscriptionHandle::close`](crate::SubscriptionHandle::close)
   /// (in milliseconds).
   ///
   /// Default: 5000
   pub release_timeout_ms: u64,
}

impl Default for ClientConfig {
   fn default() -> Self {
      Self {
         subscribe_timeout_ms: 10_000,
         release_timeout_ms: 5_000,
      }
   }
}

impl ClientConfig {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
      self.subscribe_timeout_ms = timeout.as_millis() as u64;
      self
   }

   pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
      self.release_timeout_ms = timeout.as_millis() as u64;
      self
   }

   pub fn subscribe_timeout(&self) -> Duration {
      Duration::from_millis(self.subscribe_timeout_ms)
   }

   pub fn release_timeout(&self) -> Duration {
      Duration::from_millis(self.release_timeout_ms)
   }
}
