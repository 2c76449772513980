//! Informa store: keyed object cache and the coalescing delta queue that
//! feeds it.

#![forbid(unsafe_code)]

mod queue;

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use informa_core::{Delta, DeltaKind, Object, ObjectKey};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::{debug, trace};

pub use queue::{DeltaQueue, QueueClosed};

/// Counts produced by one [`Store::replace_all`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceStats {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl ReplaceStats {
    pub fn changes(&self) -> usize { self.added + self.updated + self.deleted }
}

struct Shared<K> {
    items: RwLock<FxHashMap<ObjectKey, K>>,
    epoch_tx: watch::Sender<u64>,
}

/// Last-known state of every object in the mirrored collection.
///
/// Lock order is queue before store: every path that touches both takes the
/// queue lock first.
pub struct Store<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<K: Object> Default for Store<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Object> Store<K> {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { shared: Arc::new(Shared { items: RwLock::new(FxHashMap::default()), epoch_tx }) }
    }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<ObjectKey, K>> {
        self.shared.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<ObjectKey, K>> {
        self.shared.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<K> { self.read().get(key).cloned() }
    pub fn contains_key(&self, key: &ObjectKey) -> bool { self.read().contains_key(key) }
    pub fn list(&self) -> Vec<K> { self.read().values().cloned().collect() }
    pub fn keys(&self) -> Vec<ObjectKey> { self.read().keys().cloned().collect() }
    pub fn len(&self) -> usize { self.read().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Read-only handle for consumers.
    pub fn reader(&self) -> StoreReader<K> { StoreReader { store: self.clone() } }

    /// Apply one delta and return the event handlers should see, or `None`
    /// when the delta is a no-op for this store. A `Deleted` delta removes the
    /// entry and reports the last stored object when there was one.
    pub fn apply(&self, d: Delta<K>) -> Option<Delta<K>> {
        let out = {
            let mut items = self.write();
            match d.kind {
                DeltaKind::Deleted => items.remove(&d.key).map(|last| Delta { key: d.key, kind: DeltaKind::Deleted, object: last }),
                DeltaKind::Added | DeltaKind::Updated => {
                    let prev = items.insert(d.key.clone(), d.object.clone());
                    let kind = if prev.is_some() { DeltaKind::Updated } else { DeltaKind::Added };
                    Some(Delta { key: d.key, kind, object: d.object })
                }
            }
        };
        if out.is_some() {
            self.shared.epoch_tx.send_modify(|e| *e = e.wrapping_add(1));
        }
        out
    }

    /// Queue an observed change after normalizing it against what is already
    /// known (queued or stored): `Added` for a known key becomes `Updated`,
    /// `Updated` for an unknown key becomes `Added`, `Deleted` for an unknown
    /// key is dropped, and a non-delete carrying the known version is skipped.
    ///
    /// Returns whether anything was queued.
    pub fn enqueue(&self, d: Delta<K>, queue: &DeltaQueue<K>) -> Result<bool, QueueClosed> {
        let queued = {
            let mut q = queue.lock();
            if q.is_closed() {
                return Err(QueueClosed);
            }
            let known = known_version(&q, &self.read(), &d.key);
            let kind = match (d.kind, known) {
                (DeltaKind::Deleted, None) => None,
                (DeltaKind::Deleted, Some(_)) => Some(DeltaKind::Deleted),
                (_, None) => Some(DeltaKind::Added),
                (_, Some(Known(Some(v)))) if Some(&v) == d.object.resource_version().as_ref() => None,
                (_, Some(_)) => Some(DeltaKind::Updated),
            };
            match kind {
                Some(kind) => {
                    q.push(Delta { kind, ..d })?;
                    true
                }
                None => {
                    trace!(key = %d.key, kind = %d.kind, "store: observed delta is a no-op");
                    false
                }
            }
        };
        if queued {
            queue.wake();
        }
        Ok(queued)
    }

    /// Reconcile a fresh snapshot against everything known and queue the
    /// deltas that converge the store to it: `Added` for new keys, `Updated`
    /// for keys whose version changed, `Deleted` for keys missing from the
    /// snapshot. Unchanged objects produce nothing, so replaying a snapshot
    /// the store already reflects is silent.
    pub fn replace_all(&self, items: Vec<K>, queue: &DeltaQueue<K>) -> Result<ReplaceStats, QueueClosed> {
        let mut stats = ReplaceStats::default();
        {
            let mut q = queue.lock();
            if q.is_closed() {
                return Err(QueueClosed);
            }
            let stored = self.read();
            let mut batch = Vec::new();
            let mut seen: FxHashSet<ObjectKey> = FxHashSet::default();
            for obj in items {
                let key = obj.key();
                seen.insert(key.clone());
                match known_version(&q, &stored, &key) {
                    None => {
                        stats.added += 1;
                        batch.push(Delta { key, kind: DeltaKind::Added, object: obj });
                    }
                    Some(Known(Some(v))) if obj.resource_version().as_ref() == Some(&v) => stats.unchanged += 1,
                    Some(_) => {
                        stats.updated += 1;
                        batch.push(Delta { key, kind: DeltaKind::Updated, object: obj });
                    }
                }
            }
            let mut gone: Vec<Delta<K>> = Vec::new();
            for (key, obj) in stored.iter() {
                if !seen.contains(key) && !matches!(q.pending(key), Some(p) if p.kind == DeltaKind::Deleted) {
                    let last = q.pending(key).map(|p| p.object.clone()).unwrap_or_else(|| obj.clone());
                    gone.push(Delta { key: key.clone(), kind: DeltaKind::Deleted, object: last });
                }
            }
            for p in q.pending_iter() {
                if !seen.contains(&p.key) && !stored.contains_key(&p.key) && p.kind != DeltaKind::Deleted {
                    gone.push(Delta { key: p.key.clone(), kind: DeltaKind::Deleted, object: p.object.clone() });
                }
            }
            gone.sort_by(|a, b| a.key.cmp(&b.key));
            stats.deleted = gone.len();
            batch.extend(gone);
            drop(stored);
            DeltaQueue::push_locked(&mut q, batch)?;
        }
        queue.wake();
        debug!(added = stats.added, updated = stats.updated, deleted = stats.deleted, unchanged = stats.unchanged, "store: replace_all reconciled");
        Ok(stats)
    }

    /// Bumped on every effective [`apply`](Self::apply).
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.shared.epoch_tx.subscribe() }
    pub fn epoch(&self) -> u64 { *self.shared.epoch_tx.borrow() }
}

/// Known state for a key: `Known(version)`. Absent means not known to exist.
struct Known(Option<informa_core::ResourceVersion>);

fn known_version<K: Object>(
    q: &queue::QueueState<K>,
    stored: &FxHashMap<ObjectKey, K>,
    key: &ObjectKey,
) -> Option<Known> {
    match q.pending(key) {
        Some(p) if p.kind == DeltaKind::Deleted => None,
        Some(p) => Some(Known(p.object.resource_version())),
        None => stored.get(key).map(|o| Known(o.resource_version())),
    }
}

/// Read-only view over a [`Store`] for synchronous lookups.
pub struct StoreReader<K> {
    store: Store<K>,
}

impl<K> Clone for StoreReader<K> {
    fn clone(&self) -> Self { Self { store: self.store.clone() } }
}

impl<K: Object> StoreReader<K> {
    pub fn get(&self, key: &ObjectKey) -> Option<K> { self.store.get(key) }
    pub fn contains_key(&self, key: &ObjectKey) -> bool { self.store.contains_key(key) }
    pub fn list(&self) -> Vec<K> { self.store.list() }
    pub fn keys(&self) -> Vec<ObjectKey> { self.store.keys() }
    pub fn len(&self) -> usize { self.store.len() }
    pub fn is_empty(&self) -> bool { self.store.is_empty() }
    pub fn epoch(&self) -> u64 { self.store.epoch() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.store.subscribe_epoch() }
}
