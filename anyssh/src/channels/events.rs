use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::error;
use parking_lot::RwLock;

use super::ChannelId;

/// Which of the channel's byte streams an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    /// Extended data of type 1 (`SSH_EXTENDED_DATA_STDERR`).
    Stderr,
    Stdin,
}

/// Something that happened on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    /// Bytes handed to the reader of `stream` (or to the extended data
    /// handler), in arrival order.
    DataReceived { stream: StreamKind, data: Bytes },
    /// Bytes accepted by the stdin writer, in write order.
    DataSent { data: Bytes },
    /// The peer ended `Stdout`/`Stderr`, or we ended `Stdin`.
    EndOfStream { stream: StreamKind },
    Closing,
    Closed,
}

/// Observer of [`ChannelEvent`]s.
///
/// Called synchronously from whichever task produced the event, so it
/// should not block.
pub trait ChannelListener: Send + Sync {
    fn on_event(&self, channel: ChannelId, event: &ChannelEvent);
}

impl<F> ChannelListener for F
where
    F: Fn(ChannelId, &ChannelEvent) + Send + Sync,
{
    fn on_event(&self, channel: ChannelId, event: &ChannelEvent) {
        self(channel, event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub(crate) struct Listeners {
    next: AtomicU64,
    list: RwLock<Vec<(ListenerId, Arc<dyn ChannelListener>)>>,
}

impl Listeners {
    pub fn add(&self, listener: Arc<dyn ChannelListener>) -> ListenerId {
        let id = ListenerId(self.next.fetch_add(1, Ordering::Relaxed));
        self.list.write().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut list = self.list.write();
        let before = list.len();
        list.retain(|(i, _)| *i != id);
        list.len() != before
    }

    /// Deliver `event` to every listener registered when the call
    /// started, in registration order. Listeners may add or remove
    /// listeners from within the callback.
    pub fn fire(&self, channel: ChannelId, event: ChannelEvent) {
        let snapshot = self.list.read().clone();
        for (id, listener) in snapshot {
            let delivered = catch_unwind(AssertUnwindSafe(|| listener.on_event(channel, &event)));
            if delivered.is_err() {
                error!("channel {channel}: listener {id:?} panicked on {event:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;
    use parking_lot::Mutex;

    fn id() -> ChannelId {
        ChannelId(7)
    }

    #[test]
    fn registration_order_and_removal() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listeners = Listeners::default();
        let s = seen.clone();
        let a = listeners.add(Arc::new(move |_: ChannelId, _: &ChannelEvent| s.lock().push("a")));
        let s = seen.clone();
        listeners.add(Arc::new(move |_: ChannelId, _: &ChannelEvent| s.lock().push("b")));

        listeners.fire(id(), ChannelEvent::Opened);
        assert!(listeners.remove(a));
        assert!(!listeners.remove(a));
        listeners.fire(id(), ChannelEvent::Closed);
        assert_eq!(*seen.lock(), vec!["a", "b", "b"]);
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let count = Arc::new(AtomicU64::new(0));
        let listeners = Listeners::default();
        listeners.add(Arc::new(|_: ChannelId, _: &ChannelEvent| panic!("listener bug")));
        let c = count.clone();
        listeners.add(Arc::new(move |_: ChannelId, _: &ChannelEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        listeners.fire(id(), ChannelEvent::Opened);
        listeners.fire(id(), ChannelEvent::Closing);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listeners_can_register_during_delivery() {
        let listeners = Arc::new(Listeners::default());
        let count = Arc::new(AtomicU64::new(0));
        let (l, c) = (listeners.clone(), count.clone());
        listeners.add(Arc::new(move |_: ChannelId, _: &ChannelEvent| {
            let c = c.clone();
            l.add(Arc::new(move |_: ChannelId, _: &ChannelEvent| {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }));
        listeners.fire(id(), ChannelEvent::Opened);
        // The listener added during the first delivery only sees later events.
        assert_eq!(count.load(Ordering::SeqCst), 0);
        listeners.fire(id(), ChannelEvent::Closed);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
