//! Error types for the realtime-socket crate.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// A required credential is absent from the configuration or environment.
   #[error("realtime credentials are not configured: {0} is missing")]
   MissingCredentials(&'static str),

   #[error("invalid realtime endpoint '{endpoint}': {reason}")]
   InvalidEndpoint { endpoint: String, reason: String },

   #[error("websocket error: {0}")]
   WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

   #[error("connection timed out after {0:?}")]
   ConnectTimeout(Duration),

   /// A frame that is valid JSON but not a channel protocol message.
   #[error("protocol error: {0}")]
   Protocol(String),

   #[error(transparent)]
   Json(#[from] serde_json::Error),

   /// The connection task has stopped; the socket must be recreated.
   #[error("realtime socket is shut down")]
   Shutdown,
}

impl From<Error> for realtime_change_stream::Error {
   fn from(err: Error) -> Self {
      realtime_change_stream::Error::Transport(err.to_string())
   }
}
