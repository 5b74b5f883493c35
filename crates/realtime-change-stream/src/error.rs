//! Error types for the realtime-change-stream crate.

/// Errors that can occur while opening subscriptions or normalizing events.
///
/// Failures of an already-open subscription are not reported through this
/// type; they surface as [`SubscriptionStatus`](crate::SubscriptionStatus)
/// transitions on the handle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// The client was built without a transport (for example, credentials
   /// were not configured). Recoverable: callers degrade to manual refresh
   /// or polling.
   #[error("realtime transport is not initialized")]
   TransportUnavailable,

   #[error("table name must not be empty")]
   EmptyTable,

   #[error("invalid predicate '{0}': expected column=op.value")]
   InvalidPredicate(String),

   /// The provider reported an event type other than INSERT/UPDATE/DELETE.
   #[error("unknown change event type: {0}")]
   UnknownEventType(String),

   /// Row images do not match what the event kind requires.
   #[error("malformed {kind} event for table {table}: {reason}")]
   MalformedEvent {
      table: String,
      kind: String,
      reason: String,
   },

   #[error("failed to decode row image: {0}")]
   Decode(#[from] serde_json::Error),

   /// The transport refused or failed an operation.
   #[error("transport error: {0}")]
   Transport(String),
}
