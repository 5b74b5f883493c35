//! Configuration for the realtime socket.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::error::Error;

/// Environment variable holding the project URL.
pub const URL_ENV: &str = "SUPABASE_URL";

/// Environment variable holding the anonymous API key.
pub const API_KEY_ENV: &str = "SUPABASE_ANON_KEY";

/// Channel protocol version sent on connect.
pub const PROTOCOL_VERSION: &str = "1.0.0";

const WEBSOCKET_PATH: &str = "realtime/v1/websocket";

/// Configuration for [`RealtimeSocket`](crate::RealtimeSocket).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use realtime_socket::SocketConfig;
///
/// let config = SocketConfig::new("https://project.example.co", "anon-key")
///     .with_heartbeat_interval(Duration::from_secs(15));
///
/// let url = config.websocket_url().unwrap();
/// assert_eq!(url.scheme(), "wss");
/// assert_eq!(url.path(), "/realtime/v1/websocket");
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SocketConfig {
   /// Project URL (`https://...`) or a full websocket URL.
   pub endpoint: String,

   pub api_key: String,

   /// User access token sent with every channel join. Falls back to the API
   /// key when unset.
   pub access_token: Option<String>,

   /// Interval between heartbeats (in milliseconds). A heartbeat that is
   /// still unanswered when the next one is due drops the connection.
   ///
   /// Default: 25000
   pub heartbeat_interval_ms: u64,

   /// Upper bound on establishing the websocket (in milliseconds).
   ///
   /// Default: 10000
   pub connect_timeout_ms: u64,

   /// Delays between reconnect attempts (in milliseconds). Attempts past the
   /// end of the list reuse the last delay.
   ///
   /// Default: [1000, 2000, 5000, 10000]
   pub reconnect_backoff_ms: Vec<u64>,

   /// Server-side rate limit on delivered events.
   ///
   /// Default: 10
   pub events_per_second: u32,
}

impl Default for SocketConfig {
   fn default() -> Self {
      Self {
         endpoint: String::new(),
         api_key: String::new(),
         access_token: None,
         heartbeat_interval_ms: 25_000,
         connect_timeout_ms: 10_000,
         reconnect_backoff_ms: vec![1_000, 2_000, 5_000, 10_000],
         events_per_second: 10,
      }
   }
}

impl SocketConfig {
   pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
      Self {
         endpoint: endpoint.into(),
         api_key: api_key.into(),
         ..Self::default()
      }
   }

   /// Reads credentials from `SUPABASE_URL` and `SUPABASE_ANON_KEY`.
   pub fn from_env() -> crate::Result<Self> {
      Self::from_lookup(|name| std::env::var(name).ok())
   }

   /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
   ///
   /// Values are trimmed; blank values count as missing.
   pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
      let read = |name: &'static str| {
         lookup(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(Error::MissingCredentials(name))
      };

      let credentials = read(URL_ENV).and_then(|url| Ok((url, read(API_KEY_ENV)?)));
      match credentials {
         Ok((endpoint, api_key)) => Ok(Self::new(endpoint, api_key)),
         Err(e) => {
            warn!(error = %e, "Realtime is disabled; set {URL_ENV} and {API_KEY_ENV}");
            Err(e)
         }
      }
   }

   pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
      self.access_token = Some(token.into());
      self
   }

   pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
      self.heartbeat_interval_ms = interval.as_millis() as u64;
      self
   }

   pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
      self.connect_timeout_ms = timeout.as_millis() as u64;
      self
   }

   pub fn with_reconnect_backoff(mut self, delays: impl IntoIterator<Item = Duration>) -> Self {
      self.reconnect_backoff_ms = delays.into_iter().map(|d| d.as_millis() as u64).collect();
      self
   }

   pub fn with_events_per_second(mut self, rate: u32) -> Self {
      self.events_per_second = rate;
      self
   }

   pub fn heartbeat_interval(&self) -> Duration {
      Duration::from_millis(self.heartbeat_interval_ms.max(1))
   }

   pub fn connect_timeout(&self) -> Duration {
      Duration::from_millis(self.connect_timeout_ms)
   }

   /// Delay before reconnect attempt number `attempt` (zero-based).
   pub fn backoff_for(&self, attempt: usize) -> Duration {
      let delays = &self.reconnect_backoff_ms;
      let ms = delays
         .get(attempt)
         .or_else(|| delays.last())
         .copied()
         .unwrap_or(10_000);
      Duration::from_millis(ms)
   }

   /// Token sent with channel joins.
   pub fn join_token(&self) -> &str {
      self.access_token.as_deref().unwrap_or(&self.api_key)
   }

   /// Builds the websocket URL: scheme mapped to `ws`/`wss`, the realtime
   /// path appended unless already present, and the `apikey`,
   /// `eventsPerSecond` and `vsn` query parameters.
   pub fn websocket_url(&self) -> crate::Result<Url> {
      if self.api_key.is_empty() {
         return Err(Error::MissingCredentials(API_KEY_ENV));
      }
      let invalid = |reason: &str| Error::InvalidEndpoint {
         endpoint: self.endpoint.clone(),
         reason: reason.to_string(),
      };

      let mut url = Url::parse(self.endpoint.trim()).map_err(|e| invalid(&e.to_string()))?;
      let scheme = match url.scheme() {
         "http" | "ws" => "ws",
         "https" | "wss" => "wss",
         _ => return Err(invalid("scheme must be http, https, ws or wss")),
      };
      url.set_scheme(scheme)
         .map_err(|()| invalid("scheme cannot be changed"))?;

      let base = url.path().trim_end_matches('/').to_string();
      if !base.ends_with("/websocket") {
         url.set_path(&format!("{base}/{WEBSOCKET_PATH}"));
      }

      url.set_query(None);
      url.query_pairs_mut()
         .append_pair("apikey", &self.api_key)
         .append_pair("eventsPerSecond", &self.events_per_second.to_string())
         .append_pair("vsn", PROTOCOL_VERSION);
      Ok(url)
   }
}

impl fmt::Debug for SocketConfig {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("SocketConfig")
         .field("endpoint", &self.endpoint)
         .field("api_key", &"<redacted>")
         .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
         .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
         .field("connect_timeout_ms", &self.connect_timeout_ms)
         .field("reconnect_backoff_ms", &self.reconnect_backoff_ms)
         .field("events_per_second", &self.events_per_second)
         .finish()
   }
}
