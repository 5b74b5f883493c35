//! The seam between the change stream client and a backend connection.
//!
//! A transport multiplexes any number of logical channels over whatever
//! connection it owns. Opening a channel never blocks: the transport starts
//! the join and reports acknowledgement, failure and delivered changes
//! through the channel's [`EventSink`].

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::change::ChangeEvent;
use crate::handle::SubscriptionStatus;
use crate::subscription::SubscriptionSpec;

/// Messages a transport delivers for one channel, in emission order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
   Status(SubscriptionStatus),
   Change(ChangeEvent),
}

pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// A request to open one channel.
#[derive(Debug)]
pub struct ChannelRequest {
   /// Unique channel name chosen by the client.
   pub channel: String,
   pub spec: SubscriptionSpec,
   pub sink: EventSink,
}

pub trait ChangeTransport: Send + Sync + 'static {
   /// Starts joining a channel.
   ///
   /// Returns an error only when the request cannot even be queued (for
   /// example, the connection task has stopped). Server-side rejection is
   /// reported later as a [`SubscriptionStatus::Error`] on the sink.
   fn open(&self, request: ChannelRequest) -> crate::Result<()>;

   /// Leaves a channel and releases its server-side resources.
   ///
   /// Closing an unknown channel succeeds.
   fn close(&self, channel: &str) -> BoxFuture<'static, crate::Result<()>>;
}
