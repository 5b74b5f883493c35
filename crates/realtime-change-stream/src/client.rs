//! The change stream client: one subscription per (table, predicate) pair,
//! multiplexed over a shared transport.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::change::ChangeEvent;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::handle::{ChannelState, ConnectionId, HandleInner, SubscriptionHandle, SubscriptionStatus};
use crate::registry::{OwnerId, SubscriptionRegistry};
use crate::stream::ChangeEventStream;
use crate::subscription::SubscriptionSpec;
use crate::transport::{ChangeTransport, ChannelRequest, TransportEvent};

/// Callback invoked once per delivered change, in emission order.
pub type EventCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

struct ClientInner {
   transport: Option<Arc<dyn ChangeTransport>>,
   config: ClientConfig,
   registry: SubscriptionRegistry,
}

/// Opens and closes table subscriptions and delivers normalized change events.
///
/// Cloning is cheap; clones share the transport and the registry. Opening a
/// subscription spawns its delivery task, so it must happen inside a tokio
/// runtime.
///
/// ```no_run
/// use realtime_change_stream::{ChangeStreamClient, ClientConfig, LocalBroker, SubscriptionSpec};
///
/// # async fn example() -> realtime_change_stream::Result<()> {
/// let broker = LocalBroker::new();
/// let client = ChangeStreamClient::new(broker.clone(), ClientConfig::default());
///
/// let handle = client.subscribe(SubscriptionSpec::new("registros"), |change| {
///     println!("{} on {}", change.kind(), change.table());
/// })?;
///
/// client.unsubscribe(Some(&handle)).await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ChangeStreamClient {
   inner: Arc<ClientInner>,
}

impl ChangeStreamClient {
   pub fn new(transport: Arc<dyn ChangeTransport>, config: ClientConfig) -> Self {
      Self::build(Some(transport), config)
   }

   /// A client with no transport: every subscribe fails with
   /// [`Error::TransportUnavailable`].
   pub fn unavailable(config: ClientConfig) -> Self {
      Self::build(None, config)
   }

   fn build(transport: Option<Arc<dyn ChangeTransport>>, config: ClientConfig) -> Self {
      Self {
         inner: Arc::new(ClientInner {
            transport,
            config,
            registry: SubscriptionRegistry::new(),
         }),
      }
   }

   /// Whether a transport is configured.
   pub fn is_available(&self) -> bool {
      self.inner.transport.is_some()
   }

   pub fn config(&self) -> &ClientConfig {
      &self.inner.config
   }

   pub fn registry(&self) -> &SubscriptionRegistry {
      &self.inner.registry
   }

   /// Opens a subscription and invokes `on_event` for every change it
   /// receives.
   ///
   /// Fails only when no transport is configured or the `SubscriptionSpec` is invalid.
   /// Connection problems after this point are reported through the
   /// handle's status.
   pub fn subscribe<F>(&self, spec: SubscriptionSpec, on_event: F) -> crate::Result<SubscriptionHandle>
   where
      F: Fn(ChangeEvent) + Send + Sync + 'static,
   {
      self.open_channel(spec, Arc::new(on_event))
   }

   /// Like [`subscribe`](Self::subscribe), and records the handle in the
   /// registry under `owner` for bulk release.
   pub fn subscribe_for<F>(
      &self,
      owner: OwnerId,
      spec: SubscriptionSpec,
      on_event: F,
   ) -> crate::Result<SubscriptionHandle>
   where
      F: Fn(ChangeEvent) + Send + Sync + 'static,
   {
      let handle = self.open_channel(spec, Arc::new(on_event))?;
      self.inner.registry.register(owner, &handle);
      Ok(handle)
   }

   /// Opens a subscription whose changes are delivered as a stream.
   ///
   /// The stream ends once the handle is closed.
   pub fn subscribe_stream(
      &self,
      spec: SubscriptionSpec,
   ) -> crate::Result<(SubscriptionHandle, ChangeEventStream)> {
      let (tx, rx) = mpsc::unbounded_channel();
      let handle = self.subscribe(spec, move |change| {
         let _ = tx.send(change);
      })?;
      Ok((handle, ChangeEventStream::new(rx)))
   }

   /// Closes `handle`. Closing `None` or an already-closed handle does nothing.
   pub async fn unsubscribe(&self, handle: Option<&SubscriptionHandle>) {
      if let Some(handle) = handle {
         handle.close().await;
      }
   }

   /// Closes every subscription registered to `owner`.
   pub fn release_all(&self, owner: OwnerId) -> usize {
      self.inner.registry.release_all(owner)
   }

   fn open_channel(
      &self,
      spec: SubscriptionSpec,
      on_event: EventCallback,
   ) -> crate::Result<SubscriptionHandle> {
      let Some(transport) = self.inner.transport.clone() else {
         warn!(table = %spec.table(), "Cannot subscribe: realtime transport is not initialized");
         return Err(Error::TransportUnavailable);
      };
      spec.validate()?;

      let connection_id = ConnectionId::new();
      let channel = format!("{}:{}", spec.table(), connection_id);
      let state = ChannelState::new(SubscriptionStatus::Connecting);
      let (sink, events) = mpsc::unbounded_channel();

      let inner = Arc::new(HandleInner {
         connection_id,
         channel: channel.clone(),
         spec: spec.clone(),
         state: Arc::clone(&state),
         pump: Mutex::new(None),
         transport: Arc::clone(&transport),
         release_timeout: self.inner.config.release_timeout(),
      });

      let request = ChannelRequest {
         channel: channel.clone(),
         spec: spec.clone(),
         sink,
      };
      if let Err(e) = transport.open(request) {
         warn!(channel = %channel, error = %e, "Transport refused channel");
         state.transition(SubscriptionStatus::Error(e.to_string()));
         return Ok(SubscriptionHandle::new(inner));
      }

      let pump = tokio::spawn(pump_events(
         state,
         spec,
         events,
         on_event,
         self.inner.config.subscribe_timeout(),
         channel.clone(),
      ));
      *inner.pump.lock() = Some(pump.abort_handle());

      debug!(channel = %channel, "Subscription requested");
      Ok(SubscriptionHandle::new(inner))
   }
}

impl std::fmt::Debug for ChangeStreamClient {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ChangeStreamClient")
         .field("available", &self.is_available())
         .field("config", &self.inner.config)
         .finish()
   }
}

/// Delivery task of one subscription: applies status transitions, enforces
/// the acknowledgement timeout and hands changes to the callback in the
/// order the transport emitted them.
async fn pump_events(
   state: Arc<ChannelState>,
   spec: SubscriptionSpec,
   mut events: mpsc::UnboundedReceiver<TransportEvent>,
   on_event: EventCallback,
   ack_timeout: Duration,
   channel: String,
) {
   let ack_deadline = tokio::time::sleep(ack_timeout);
   tokio::pin!(ack_deadline);
   let mut awaiting_ack = true;

   loop {
      tokio::select! {
         biased;

         event = events.recv() => {
            let Some(event) = event else {
               // A rejected join keeps its rejection reason.
               let failed = matches!(state.current(), SubscriptionStatus::Error(_));
               if !failed && state.transition(SubscriptionStatus::Error("transport dropped the channel".into())) {
                  warn!(channel = %channel, "Transport dropped the channel");
               }
               break;
            };
            if state.is_closed() {
               break;
            }

            match event {
               TransportEvent::Status(status) => {
                  let status = match status {
                     // Only teardown may close a handle.
                     SubscriptionStatus::Closed => {
                        SubscriptionStatus::Error("channel closed by server".into())
                     }
                     other => other,
                  };
                  match status {
                     SubscriptionStatus::Open | SubscriptionStatus::Error(_) => awaiting_ack = false,
                     SubscriptionStatus::Connecting => {
                        // A timeout past the clock's range never fires.
                        match tokio::time::Instant::now().checked_add(ack_timeout) {
                           Some(deadline) => {
                              awaiting_ack = true;
                              ack_deadline.as_mut().reset(deadline);
                           }
                           None => awaiting_ack = false,
                        }
                     }
                     _ => {}
                  }
                  if state.transition(status.clone()) {
                     match status.error_message() {
                        Some(reason) => warn!(channel = %channel, reason = %reason, "Subscription failed"),
                        None => debug!(channel = %channel, status = %status, "Subscription status changed"),
                     }
                  }
               }
               TransportEvent::Change(change) => {
                  if !spec.events().contains(change.kind()) {
                     continue;
                  }
                  trace!(channel = %channel, kind = %change.kind(), "Delivering change");
                  // A panicking callback loses this change only.
                  if catch_unwind(AssertUnwindSafe(|| on_event(change))).is_err() {
                     error!(channel = %channel, "Change callback panicked, change dropped");
                  }
               }
            }
         }

         () = &mut ack_deadline, if awaiting_ack => {
            awaiting_ack = false;
            if state.transition(SubscriptionStatus::TimedOut) {
               warn!(channel = %channel, ?ack_timeout, "Subscription was not acknowledged in time");
            }
         }
      }
   }
}
