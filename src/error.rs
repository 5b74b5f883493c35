use serde::{Serialize, Serializer};

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by reload functions.
pub type ReloadError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error response for UI consumers.
#[derive(Serialize)]
struct ErrorResponse {
   code: String,
   message: String,
}

/// Error types for the sync layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the change stream client.
   #[error(transparent)]
   ChangeStream(#[from] realtime_change_stream::Error),

   /// Error from the websocket transport.
   #[cfg(feature = "socket")]
   #[error(transparent)]
   Socket(#[from] realtime_socket::Error),

   /// The reload function returned an error.
   #[error("reload failed: {0}")]
   Reload(String),

   /// The reload function panicked.
   #[error("reload panicked: {0}")]
   ReloadPanicked(String),

   /// The watcher was torn down before the operation completed.
   #[error("watcher is closed")]
   WatcherClosed,

   /// No table preset is registered under this name.
   #[error("unknown table preset: {0}")]
   UnknownPreset(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for UI error handling.
   fn error_code(&self) -> String {
      match self {
         Error::ChangeStream(e) => match e {
            realtime_change_stream::Error::TransportUnavailable => "REALTIME_UNAVAILABLE",
            realtime_change_stream::Error::EmptyTable => "EMPTY_TABLE",
            realtime_change_stream::Error::InvalidPredicate(_) => "INVALID_PREDICATE",
            realtime_change_stream::Error::UnknownEventType(_)
            | realtime_change_stream::Error::MalformedEvent { .. }
            | realtime_change_stream::Error::Decode(_) => "INVALID_EVENT",
            realtime_change_stream::Error::Transport(_) => "TRANSPORT_ERROR",
         }
         .to_string(),
         #[cfg(feature = "socket")]
         Error::Socket(e) => match e {
            realtime_socket::Error::MissingCredentials(_) => "MISSING_CREDENTIALS",
            realtime_socket::Error::InvalidEndpoint { .. } => "INVALID_ENDPOINT",
            _ => "SOCKET_ERROR",
         }
         .to_string(),
         Error::Reload(_) => "RELOAD_FAILED".to_string(),
         Error::ReloadPanicked(_) => "RELOAD_PANICKED".to_string(),
         Error::WatcherClosed => "WATCHER_CLOSED".to_string(),
         Error::UnknownPreset(_) => "UNKNOWN_PRESET".to_string(),
      }
   }
}

impl Serialize for Error {
   fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
   where
      S: Serializer,
   {
      let response = ErrorResponse {
         code: self.error_code(),
         message: self.to_string(),
      };
      response.serialize(serializer)
   }
}
