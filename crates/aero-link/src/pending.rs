use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{ConcurrencyError, LinkError};

type Accept<V> = Box<dyn Fn(&V) -> bool + Send>;

/// Single-slot, correlation-keyed replies (parameter name, command id, calibration kind).
///
/// At most one waiter per key. Registering a key that is already pending fails with
/// [`ConcurrencyError::AlreadyPending`] instead of replacing the first waiter.
pub struct PendingMap<K, V> {
    inner: Arc<Mutex<Slots<K, V>>>,
}

struct Slots<K, V> {
    next_gen: u64,
    map: HashMap<K, Slot<V>>,
}

struct Slot<V> {
    gen: u64,
    accept: Option<Accept<V>>,
    tx: oneshot::Sender<Result<V, LinkError>>,
}

impl<K, V> Clone for PendingMap<K, V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<K: Eq + Hash + Clone + Debug, V> Default for PendingMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone + Debug, V> PendingMap<K, V> {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Slots { next_gen: 0, map: HashMap::new() })) }
    }

    pub fn register(&self, key: K) -> Result<Pending<K, V>, ConcurrencyError> {
        self.insert(key, None)
    }

    /// Like [`register`](Self::register), but only values passing `accept` resolve the slot.
    pub fn register_matching<F>(&self, key: K, accept: F) -> Result<Pending<K, V>, ConcurrencyError>
    where
        F: Fn(&V) -> bool + Send + 'static,
    {
        self.insert(key, Some(Box::new(accept)))
    }

    fn insert(&self, key: K, accept: Option<Accept<V>>) -> Result<Pending<K, V>, ConcurrencyError> {
        let mut slots = self.inner.lock().unwrap();
        if slots.map.contains_key(&key) {
            return Err(ConcurrencyError::AlreadyPending(format!("{:?}", key)));
        }
        let gen = slots.next_gen;
        slots.next_gen += 1;
        let (tx, rx) = oneshot::channel();
        slots.map.insert(key.clone(), Slot { gen, accept, tx });
        Ok(Pending { key, gen, rx, owner: Arc::downgrade(&self.inner) })
    }

    /// Hand `value` to the waiter under `key`. Returns false if nobody is waiting or the
    /// waiter's filter rejected it.
    pub fn resolve(&self, key: &K, value: V) -> bool {
        let mut slots = self.inner.lock().unwrap();
        let accepted = match slots.map.get(key) {
            Some(slot) => slot.accept.as_ref().map_or(true, |f| f(&value)),
            None => false,
        };
        if !accepted {
            return false;
        }
        match slots.map.remove(key) {
            Some(slot) => slot.tx.send(Ok(value)).is_ok(),
            None => false,
        }
    }

    /// Fail one waiter.
    pub fn fail(&self, key: &K, err: LinkError) -> bool {
        match self.inner.lock().unwrap().map.remove(key) {
            Some(slot) => slot.tx.send(Err(err)).is_ok(),
            None => false,
        }
    }

    /// Fail every waiter and empty the map. Returns how many were failed.
    pub fn fail_all(&self, err: LinkError) -> usize {
        let drained: Vec<Slot<V>> = self.inner.lock().unwrap().map.drain().map(|(_, s)| s).collect();
        let n = drained.len();
        for slot in drained {
            let _ = slot.tx.send(Err(err.clone()));
        }
        n
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.inner.lock().unwrap().map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Link(LinkError),
}

/// A registered slot. Dropping it releases the key.
pub struct Pending<K: Eq + Hash, V> {
    key: K,
    gen: u64,
    rx: oneshot::Receiver<Result<V, LinkError>>,
    owner: Weak<Mutex<Slots<K, V>>>,
}

impl<K: Eq + Hash, V> Pending<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Wait up to `timeout`. On [`WaitError::Timeout`] the slot stays registered, so the
    /// caller may resend and wait again under the same key. Do not wait again after any
    /// other outcome.
    pub async fn wait(&mut self, timeout: Duration) -> Result<V, WaitError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Err(_) => Err(WaitError::Timeout),
            Ok(Ok(Ok(v))) => Ok(v),
            Ok(Ok(Err(e))) => Err(WaitError::Link(e)),
            Ok(Err(_)) => Err(WaitError::Link(LinkError::Disconnected)),
        }
    }
}

impl<K: Eq + Hash, V> Drop for Pending<K, V> {
    fn drop(&mut self) {
        let Some(owner) = self.owner.upgrade() else { return };
        let Ok(mut slots) = owner.lock() else { return };
        // The key may already belong to a newer registration.
        if slots.map.get(&self.key).map(|s| s.gen) == Some(self.gen) {
            slots.map.remove(&self.key);
        }
    }
}
