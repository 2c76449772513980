use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use informa_core::{Delta, DeltaKind, ObjectKey};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;

/// Returned by writes to a closed queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("delta queue closed")]
pub struct QueueClosed;

pub(crate) struct QueueState<K> {
    map: FxHashMap<ObjectKey, (u64, Delta<K>)>,
    order: VecDeque<(ObjectKey, u64)>,
    seq: u64,
    closed: bool,
}

impl<K> QueueState<K> {
    fn new() -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), seq: 0, closed: false }
    }

    /// Kind of the delta currently pending for `key`, with its payload.
    pub(crate) fn pending(&self, key: &ObjectKey) -> Option<&Delta<K>> {
        self.map.get(key).map(|(_, d)| d)
    }

    pub(crate) fn pending_iter(&self) -> impl Iterator<Item = &Delta<K>> {
        self.map.values().map(|(_, d)| d)
    }

    /// Coalesce `d` into the pending entry for its key, or append it.
    pub(crate) fn push(&mut self, d: Delta<K>) -> Result<(), QueueClosed> {
        if self.closed {
            return Err(QueueClosed);
        }
        match self.map.remove(&d.key) {
            Some((seq, prev)) => match merge(prev.kind, d.kind) {
                Some(kind) => {
                    self.map.insert(d.key.clone(), (seq, Delta { kind, ..d }));
                }
                // Added then Deleted before anyone saw it: nothing happened.
                None => {}
            },
            None => {
                self.seq = self.seq.wrapping_add(1);
                self.order.push_back((d.key.clone(), self.seq));
                self.map.insert(d.key.clone(), (self.seq, d));
            }
        }
        Ok(())
    }

    fn take_front(&mut self) -> Option<Delta<K>> {
        while let Some((key, seq)) = self.order.pop_front() {
            // Stale order slots belong to entries that were dropped by coalescing.
            if matches!(self.map.get(&key), Some((s, _)) if *s == seq) {
                if let Some((_, d)) = self.map.remove(&key) {
                    return Some(d);
                }
            }
        }
        None
    }

    fn len(&self) -> usize { self.map.len() }
    pub(crate) fn is_closed(&self) -> bool { self.closed }
}

/// Resulting kind when `next` arrives while `prev` is still queued for the
/// same key. `None` drops the entry.
fn merge(prev: DeltaKind, next: DeltaKind) -> Option<DeltaKind> {
    use DeltaKind::*;
    match (prev, next) {
        (Added, Deleted) => None,
        (_, Deleted) => Some(Deleted),
        (Deleted, _) => Some(Updated),
        (Added, _) => Some(Added),
        (Updated, _) => Some(Updated),
    }
}

/// Coalescing queue keyed by object key with FIFO order across keys.
///
/// Only the first pending position of a key is kept; its payload is replaced
/// by the newest delta for that key.
pub struct DeltaQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K> Default for DeltaQueue<K> {
    fn default() -> Self { Self::new() }
}

impl<K> DeltaQueue<K> {
    pub fn new() -> Self {
        Self { state: Mutex::new(QueueState::new()), notify: Notify::new() }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize { self.lock().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn is_closed(&self) -> bool { self.lock().closed }

    /// Raw push without normalization. Only valid when `d.kind` already
    /// reflects the known state of the key: an `Added` for a stored key
    /// followed by a `Deleted` would cancel out and lose the delete.
    /// Producers go through [`Store::enqueue`](crate::Store::enqueue) and
    /// [`Store::replace_all`](crate::Store::replace_all).
    #[cfg(test)]
    pub(crate) fn push(&self, d: Delta<K>) -> Result<(), QueueClosed> {
        let depth = {
            let mut st = self.lock();
            st.push(d)?;
            st.len()
        };
        metrics::gauge!("informer_queue_depth", depth as f64);
        self.notify.notify_one();
        Ok(())
    }

    /// Push a batch under one lock acquisition.
    pub(crate) fn push_locked(st: &mut QueueState<K>, batch: Vec<Delta<K>>) -> Result<(), QueueClosed> {
        for d in batch {
            st.push(d)?;
        }
        Ok(())
    }

    pub(crate) fn wake(&self) {
        metrics::gauge!("informer_queue_depth", self.len() as f64);
        self.notify.notify_one();
    }

    /// Wait for the next delta. Returns `None` once the queue is closed and
    /// fully drained.
    pub async fn pop(&self) -> Option<Delta<K>> {
        self.pop_with(|d| d).await
    }

    /// Like [`pop`](Self::pop), but runs `f` on the delta before the queue
    /// lock is released, so nobody observes the key as neither queued nor
    /// applied.
    pub async fn pop_with<R>(&self, f: impl FnOnce(Delta<K>) -> R) -> Option<R> {
        let mut f = Some(f);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if let Some(d) = st.take_front() {
                    let depth = st.len();
                    let out = f.take().map(|f| f(d));
                    drop(st);
                    metrics::gauge!("informer_queue_depth", depth as f64);
                    return out;
                }
                if st.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Reject further pushes and wake every waiting `pop`. Already queued
    /// deltas can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Reopen after [`close`](Self::close).
    pub fn reset(&self) {
        self.lock().closed = false;
    }
}
