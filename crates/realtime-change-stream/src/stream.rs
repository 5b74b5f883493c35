use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::change::ChangeEvent;
use crate::subscription::EventKinds;

/// A stream of change events for one subscription.
///
/// Ends when the owning [`SubscriptionHandle`](crate::SubscriptionHandle) is
/// closed. Supports narrowing to a subset of change kinds on the consumer
/// side.
pub struct ChangeEventStream {
   inner: UnboundedReceiverStream<ChangeEvent>,
   filter_kinds: Option<EventKinds>,
}

impl ChangeEventStream {
   pub fn new(rx: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
      Self {
         inner: UnboundedReceiverStream::new(rx),
         filter_kinds: None,
      }
   }

   pub fn filter_kinds(mut self, kinds: EventKinds) -> Self {
      self.filter_kinds = Some(kinds);
      self
   }
}

impl Stream for ChangeEventStream {
   type Item = ChangeEvent;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      loop {
         // UnboundedReceiverStream is Unpin, so we can safely create a pinned reference
         let inner = Pin::new(&mut self.inner);

         match inner.poll_next(cx) {
            Poll::Ready(Some(change)) => {
               if let Some(kinds) = self.filter_kinds
                  && !kinds.contains(change.kind())
               {
                  continue;
               }
               return Poll::Ready(Some(change));
            }
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => return Poll::Pending,
         }
      }
   }
}
