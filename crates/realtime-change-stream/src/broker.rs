//! In-process change transport.
//!
//! [`LocalBroker`] stands in for the hosted provider when changes originate
//! in the same process (embedded use, demos, tests). It keeps one entry per
//! open channel and fans each published change out to every channel whose
//! subscription accepts it, applying table, event-kind and predicate filters
//! the same way the provider does server-side.
//!
//! ```text
//!  publish(change) ──► for each open channel ──► spec.accepts(change)? ──► sink.send()
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::change::ChangeEvent;
use crate::handle::SubscriptionStatus;
use crate::subscription::SubscriptionSpec;
use crate::transport::{ChangeTransport, ChannelRequest, EventSink, TransportEvent};

struct LocalChannel {
   spec: SubscriptionSpec,
   sink: EventSink,
}

pub struct LocalBroker {
   channels: RwLock<HashMap<String, LocalChannel>>,
   rejected: RwLock<HashMap<String, String>>,
   auto_ack: AtomicBool,
   released: AtomicUsize,
}

impl LocalBroker {
   /// Creates a broker that acknowledges every channel as soon as it opens.
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         channels: RwLock::new(HashMap::new()),
         rejected: RwLock::new(HashMap::new()),
         auto_ack: AtomicBool::new(true),
         released: AtomicUsize::new(0),
      })
   }

   /// Controls whether new channels are acknowledged immediately. With
   /// acknowledgement off, channels stay `Connecting` until
   /// [`acknowledge`](Self::acknowledge) is called.
   pub fn set_auto_ack(&self, auto_ack: bool) {
      self.auto_ack.store(auto_ack, Ordering::Release);
   }

   /// Makes future joins on `table` fail with `reason`.
   pub fn reject_table(&self, table: impl Into<String>, reason: impl Into<String>) {
      self.rejected.write().insert(table.into(), reason.into());
   }

   pub fn allow_table(&self, table: &str) {
      self.rejected.write().remove(table);
   }

   /// Acknowledges a pending channel. Returns false if it is not open.
   pub fn acknowledge(&self, channel: &str) -> bool {
      self
         .channels
         .read()
         .get(channel)
         .is_some_and(|c| c.sink.send(TransportEvent::Status(SubscriptionStatus::Open)).is_ok())
   }

   pub fn acknowledge_all(&self) -> usize {
      self
         .channels
         .read()
         .values()
         .filter(|c| c.sink.send(TransportEvent::Status(SubscriptionStatus::Open)).is_ok())
         .count()
   }

   /// Delivers `change` to every channel that accepts it and returns how many
   /// channels received it.
   pub fn publish(&self, change: ChangeEvent) -> usize {
      let mut delivered = 0;
      let mut dead = Vec::new();

      {
         let channels = self.channels.read();
         for (name, channel) in channels.iter() {
            if !channel.spec.accepts(&change) {
               continue;
            }
            if channel.sink.send(TransportEvent::Change(change.clone())).is_ok() {
               delivered += 1;
            } else {
               dead.push(name.clone());
            }
         }
      }

      if !dead.is_empty() {
         let mut channels = self.channels.write();
         for name in dead {
            channels.remove(&name);
         }
      }

      trace!(
         table = %change.table(),
         kind = %change.kind(),
         delivered,
         "Published change"
      );
      delivered
   }

   /// Reports a failure on every open channel, as a dropped connection would.
   pub fn fail_all(&self, reason: &str) {
      for channel in self.channels.read().values() {
         let _ = channel
            .sink
            .send(TransportEvent::Status(SubscriptionStatus::Error(reason.to_string())));
      }
   }

   pub fn open_channels(&self) -> usize {
      self.channels.read().len()
   }

   pub fn channels_for(&self, table: &str) -> usize {
      self
         .channels
         .read()
         .values()
         .filter(|c| c.spec.table() == table)
         .count()
   }

   pub fn channel_names(&self) -> Vec<String> {
      self.channels.read().keys().cloned().collect()
   }

   /// Total number of channels released through [`ChangeTransport::close`].
   pub fn released_count(&self) -> usize {
      self.released.load(Ordering::Acquire)
   }
}

impl ChangeTransport for LocalBroker {
   fn open(&self, request: ChannelRequest) -> crate::Result<()> {
      let ChannelRequest {
         channel,
         spec,
         sink,
      } = request;

      if let Some(reason) = self.rejected.read().get(spec.table()) {
         debug!(channel = %channel, reason = %reason, "Rejecting channel join");
         let _ = sink.send(TransportEvent::Status(SubscriptionStatus::Error(reason.clone())));
         return Ok(());
      }

      if self.auto_ack.load(Ordering::Acquire) {
         let _ = sink.send(TransportEvent::Status(SubscriptionStatus::Open));
      }

      debug!(channel = %channel, table = %spec.table(), "Opened local channel");
      self
         .channels
         .write()
         .insert(channel, LocalChannel { spec, sink });
      Ok(())
   }

   fn close(&self, channel: &str) -> BoxFuture<'static, crate::Result<()>> {
      if self.channels.write().remove(channel).is_some() {
         self.released.fetch_add(1, Ordering::AcqRel);
         debug!(channel = %channel, "Closed local channel");
      }
      futures::future::ready(Ok(())).boxed()
   }
}

impl std::fmt::Debug for LocalBroker {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("LocalBroker")
         .field("open_channels", &self.channels.read().len())
         .field("released", &self.released.load(Ordering::Relaxed))
         .finish()
   }
}
