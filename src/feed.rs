//! A file session's filtered view of the shared event channel.

use std::fmt;
use std::pin::Pin;
use std::task;

use futures_util::ready;
use futures_util::stream::Stream as FuturesStream;
use pin_project_lite::pin_project;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::events::{EventMask, RawEvent};
use crate::watch::WatchId;

/// Item yielded by a [`WatchFeed`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FeedItem {
    /// An event for the feed's current watch, or a queue overflow notice.
    Event(RawEvent),
    /// The session fell behind and this many events were dropped for it.
    Missed(u64),
}

pin_project! {
/// Yields only the events addressed to one watch id.
///
/// Every session observes every published event; anything carrying another
/// watch id is dropped here and never queued. Kernel queue overflows carry no
/// watch id and are passed to all feeds, since any of them may have lost
/// events. The stream ends once the producer is gone.
pub struct WatchFeed {
    #[pin]
    inner: BroadcastStream<RawEvent>,
    watch: WatchId,
}
}

impl WatchFeed {
    pub fn new(receiver: broadcast::Receiver<RawEvent>, watch: WatchId) -> Self {
        WatchFeed {
            inner: BroadcastStream::new(receiver),
            watch,
        }
    }

    pub fn watch(&self) -> WatchId {
        self.watch
    }

    /// Switches to a newly registered watch. Events for the previous one,
    /// including its removal, are ignored from here on.
    pub fn retarget(&mut self, watch: WatchId) {
        self.watch = watch;
    }
}

impl fmt::Debug for WatchFeed {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("WatchFeed")
            .field("watch", &self.watch)
            .finish()
    }
}

impl FuturesStream for WatchFeed {
    type Item = FeedItem;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            let item = match ready!(this.inner.as_mut().poll_next(cx)) {
                None => return task::Poll::Ready(None),
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => FeedItem::Missed(missed),
                Some(Ok(event)) => {
                    if event.watch != *this.watch && !event.mask.contains(EventMask::OVERFLOW) {
                        trace!(watch = %event.watch, "ignoring event for another watch");
                        continue;
                    }
                    FeedItem::Event(event)
                }
            };

            return task::Poll::Ready(Some(item));
        }
    }
}
