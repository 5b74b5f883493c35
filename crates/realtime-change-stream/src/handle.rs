//! Subscription handles and their status lifecycle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::filter::Predicate;
use crate::subscription::SubscriptionSpec;
use crate::transport::ChangeTransport;

/// Opaque identifier of one open subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
   pub(crate) fn new() -> Self {
      Self(Uuid::new_v4())
   }

   pub fn as_uuid(&self) -> &Uuid {
      &self.0
   }
}

impl fmt::Display for ConnectionId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}", self.0.simple())
   }
}

/// Lifecycle of a subscription.
///
/// `Connecting` until the server acknowledges the join, then `Open`.
/// `Error` and `TimedOut` are not terminal: a transport that reconnects moves
/// the subscription back through `Connecting` to `Open`. `Closed` is terminal
/// and only reached through explicit teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "camelCase")]
pub enum SubscriptionStatus {
   Connecting,
   Open,
   Error(String),
   TimedOut,
   Closed,
}

impl SubscriptionStatus {
   pub fn is_open(&self) -> bool {
      matches!(self, SubscriptionStatus::Open)
   }

   pub fn is_closed(&self) -> bool {
      matches!(self, SubscriptionStatus::Closed)
   }

   /// Human-readable failure description, if this status is a failure.
   pub fn error_message(&self) -> Option<String> {
      match self {
         SubscriptionStatus::Error(reason) => Some(reason.clone()),
         SubscriptionStatus::TimedOut => Some("subscription timed out".to_string()),
         _ => None,
      }
   }
}

impl fmt::Display for SubscriptionStatus {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         SubscriptionStatus::Connecting => f.write_str("connecting"),
         SubscriptionStatus::Open => f.write_str("open"),
         SubscriptionStatus::Error(reason) => write!(f, "error: {reason}"),
         SubscriptionStatus::TimedOut => f.write_str("timed out"),
         SubscriptionStatus::Closed => f.write_str("closed"),
      }
   }
}

/// Status cell shared between a handle and its delivery task.
///
/// Once closed, no later transition is accepted, so a delivery task that is
/// still winding down cannot resurrect a torn-down subscription.
pub(crate) struct ChannelState {
   closed: AtomicBool,
   status_tx: watch::Sender<SubscriptionStatus>,
}

impl ChannelState {
   pub(crate) fn new(initial: SubscriptionStatus) -> Arc<Self> {
      let (status_tx, _) = watch::channel(initial);
      Arc::new(Self {
         closed: AtomicBool::new(false),
         status_tx,
      })
   }

   /// Applies `next` unless the channel is closed or already in that status.
   pub(crate) fn transition(&self, next: SubscriptionStatus) -> bool {
      self.status_tx.send_if_modified(|current| {
         if self.closed.load(Ordering::Acquire) || *current == next {
            return false;
         }
         *current = next;
         true
      })
   }

   pub(crate) fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }

   pub(crate) fn current(&self) -> SubscriptionStatus {
      self.status_tx.borrow().clone()
   }

   pub(crate) fn watch(&self) -> watch::Receiver<SubscriptionStatus> {
      self.status_tx.subscribe()
   }

   /// Returns false if the channel was already closed.
   fn mark_closed(&self) -> bool {
      if self.closed.swap(true, Ordering::AcqRel) {
         return false;
      }
      self.status_tx.send_modify(|status| *status = SubscriptionStatus::Closed);
      true
   }
}

pub(crate) struct HandleInner {
   pub(crate) connection_id: ConnectionId,
   pub(crate) channel: String,
   pub(crate) spec: SubscriptionSpec,
   pub(crate) state: Arc<ChannelState>,
   pub(crate) pump: Mutex<Option<AbortHandle>>,
   pub(crate) transport: Arc<dyn ChangeTransport>,
   pub(crate) release_timeout: Duration,
}

impl HandleInner {
   pub(crate) fn is_closed(&self) -> bool {
      self.state.is_closed()
   }

   /// Marks the handle closed and stops event delivery.
   ///
   /// Returns true for the call that actually performed the close.
   fn begin_close(&self) -> bool {
      if !self.state.mark_closed() {
         return false;
      }
      if let Some(pump) = self.pump.lock().take() {
         pump.abort();
      }
      debug!(channel = %self.channel, table = %self.spec.table(), "Closed subscription");
      true
   }

   fn release(&self) -> impl Future<Output = ()> + Send + 'static {
      let close = self.transport.close(&self.channel);
      let channel = self.channel.clone();
      let timeout = self.release_timeout;

      async move {
         match tokio::time::timeout(timeout, close).await {
            Ok(Ok(())) => debug!(channel = %channel, "Released channel"),
            Ok(Err(e)) => warn!(channel = %channel, error = %e, "Failed to release channel"),
            Err(_) => warn!(channel = %channel, ?timeout, "Timed out releasing channel"),
         }
      }
   }

   pub(crate) async fn close(&self) {
      if self.begin_close() {
         self.release().await;
      }
   }

   pub(crate) fn dispose(&self) {
      if !self.begin_close() {
         return;
      }
      match tokio::runtime::Handle::try_current() {
         Ok(runtime) => {
            runtime.spawn(self.release());
         }
         Err(_) => {
            warn!(channel = %self.channel, "No async runtime; channel release abandoned");
         }
      }
   }
}

/// Exclusive owner of one open table subscription.
///
/// Dropping the handle tears the subscription down, like calling
/// [`dispose`](Self::dispose). Both [`close`](Self::close) and `dispose` are
/// idempotent.
pub struct SubscriptionHandle {
   inner: Arc<HandleInner>,
}

impl SubscriptionHandle {
   pub(crate) fn new(inner: Arc<HandleInner>) -> Self {
      Self { inner }
   }

   pub(crate) fn downgrade(&self) -> Weak<HandleInner> {
      Arc::downgrade(&self.inner)
   }

   pub fn connection_id(&self) -> ConnectionId {
      self.inner.connection_id
   }

   pub fn channel_name(&self) -> &str {
      &self.inner.channel
   }

   pub fn spec(&self) -> &SubscriptionSpec {
      &self.inner.spec
   }

   pub fn table(&self) -> &str {
      self.inner.spec.table()
   }

   pub fn predicate(&self) -> Option<&Predicate> {
      self.inner.spec.predicate()
   }

   pub fn status(&self) -> SubscriptionStatus {
      self.inner.state.current()
   }

   /// Receiver notified on every status transition.
   pub fn watch_status(&self) -> watch::Receiver<SubscriptionStatus> {
      self.inner.state.watch()
   }

   /// Waits until the subscription leaves `Connecting` and returns the status
   /// it settled on.
   pub async fn settled(&self) -> SubscriptionStatus {
      let mut rx = self.watch_status();
      match rx.wait_for(|status| *status != SubscriptionStatus::Connecting).await {
         Ok(status) => status.clone(),
         Err(_) => SubscriptionStatus::Closed,
      }
   }

   pub fn is_closed(&self) -> bool {
      self.inner.is_closed()
   }

   /// Closes the subscription and waits (bounded by the client's release
   /// timeout) for the transport to release the channel. Release failures
   /// are logged, never returned.
   pub async fn close(&self) {
      self.inner.close().await;
   }

   /// Closes the subscription without waiting; the channel release runs in
   /// the background.
   pub fn dispose(&self) {
      self.inner.dispose();
   }
}

impl Drop for SubscriptionHandle {
   fn drop(&mut self) {
      self.inner.dispose();
   }
}

impl fmt::Debug for SubscriptionHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("SubscriptionHandle")
         .field("connection_id", &self.inner.connection_id)
         .field("channel", &self.inner.channel)
         .field("status", &self.status())
         .finish()
   }
}
