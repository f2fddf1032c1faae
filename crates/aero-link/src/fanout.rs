use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

/// Explicit subscriber list. Every live subscriber receives every published item, in
/// publish order. Publishing never waits on a subscriber: each one has its own unbounded
/// queue, so a slow consumer only grows its own backlog.
pub struct Fanout<T> {
    inner: Arc<Mutex<Subscribers<T>>>,
}

struct Subscribers<T> {
    next_id: u64,
    list: Vec<(u64, mpsc::UnboundedSender<T>)>,
}

impl<T> Clone for Fanout<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Clone> Default for Fanout<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Fanout<T> {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Subscribers { next_id: 0, list: Vec::new() })) }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.inner.lock().unwrap();
        let id = subs.next_id;
        subs.next_id += 1;
        subs.list.push((id, tx));
        Subscription { id, rx, owner: Arc::downgrade(&self.inner) }
    }

    /// Returns how many subscribers the item was queued for.
    pub fn publish(&self, item: T) -> usize {
        let mut subs = self.inner.lock().unwrap();
        subs.list.retain(|(_, tx)| tx.send(item.clone()).is_ok());
        subs.list.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().list.len()
    }
}

/// Receiving end of a [`Fanout`]. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    owner: Weak<Mutex<Subscribers<T>>>,
}

impl<T> Subscription<T> {
    /// `None` once the publisher is gone and the backlog is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            if let Ok(mut subs) = owner.lock() {
                subs.list.retain(|(id, _)| *id != self.id);
            }
        }
    }
}
