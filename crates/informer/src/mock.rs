//! In-memory remote collection for tests and demos.
//!
//! Behaves like a tiny API server: every write bumps a global resource
//! version, watches replay history after the requested version and then
//! follow live writes, and [`MockCluster::compact`] makes older versions
//! expire. Faults can be queued for the next list or watch call.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use informa_core::{Error, Lister, Object, ObjectKey, ObjectList, ResourceVersion, Result, WatchEvent, WatchStream, Watcher};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Clone)]
enum Msg<K> {
    Event(WatchEvent<K>),
    Disconnect(Option<Error>),
}

struct State<K> {
    objects: BTreeMap<ObjectKey, K>,
    rv: u64,
    history: Vec<(u64, WatchEvent<K>)>,
    compacted: u64,
    list_faults: VecDeque<Error>,
    watch_faults: VecDeque<Error>,
}

pub struct MockCluster<K: Clone> {
    state: Mutex<State<K>>,
    tx: broadcast::Sender<Msg<K>>,
    lists: AtomicUsize,
    watches: AtomicUsize,
}

impl<K> Default for MockCluster<K>
where
    K: kube::Resource + Object,
{
    fn default() -> Self { Self::new() }
}

impl<K> MockCluster<K>
where
    K: kube::Resource + Object,
{
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                rv: 1,
                history: Vec::new(),
                compacted: 0,
                list_faults: VecDeque::new(),
                watch_faults: VecDeque::new(),
            }),
            tx,
            lists: AtomicUsize::new(0),
            watches: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record and broadcast under the state lock so a watch that subscribes
    /// concurrently sees each event exactly once.
    fn record(&self, st: &mut State<K>, ev: WatchEvent<K>) {
        st.history.push((st.rv, ev.clone()));
        let _ = self.tx.send(Msg::Event(ev));
    }

    fn stamp(st: &mut State<K>, mut obj: K) -> K {
        st.rv += 1;
        obj.meta_mut().resource_version = Some(st.rv.to_string());
        obj
    }

    pub fn create(&self, obj: K) -> AnyResult<K> {
        let mut st = self.lock();
        let key = obj.key();
        if st.objects.contains_key(&key) {
            return Err(anyhow!("{} already exists", key));
        }
        let obj = Self::stamp(&mut st, obj);
        st.objects.insert(key, obj.clone());
        self.record(&mut st, WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    pub fn update(&self, obj: K) -> AnyResult<K> {
        let mut st = self.lock();
        let key = obj.key();
        if !st.objects.contains_key(&key) {
            return Err(anyhow!("{} not found", key));
        }
        let obj = Self::stamp(&mut st, obj);
        st.objects.insert(key, obj.clone());
        self.record(&mut st, WatchEvent::Modified(obj.clone()));
        Ok(obj)
    }

    pub fn delete(&self, key: &ObjectKey) -> AnyResult<K> {
        let mut st = self.lock();
        let obj = st.objects.remove(key).ok_or_else(|| anyhow!("{} not found", key))?;
        let obj = Self::stamp(&mut st, obj);
        self.record(&mut st, WatchEvent::Deleted(obj.clone()));
        Ok(obj)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<K> { self.lock().objects.get(key).cloned() }
    pub fn len(&self) -> usize { self.lock().objects.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn current_version(&self) -> ResourceVersion { ResourceVersion::new(self.lock().rv.to_string()) }

    /// Forget history: watches from any version older than the current one
    /// now fail with [`Error::ExpiredToken`].
    pub fn compact(&self) {
        let mut st = self.lock();
        st.compacted = st.rv;
        st.history.clear();
    }

    /// Emit a bookmark at the current version to every live watch.
    pub fn bookmark(&self) {
        let st = self.lock();
        let _ = self.tx.send(Msg::Event(WatchEvent::Bookmark(ResourceVersion::new(st.rv.to_string()))));
    }

    pub fn fail_next_list(&self, err: Error) { self.lock().list_faults.push_back(err); }
    pub fn fail_next_watch(&self, err: Error) { self.lock().watch_faults.push_back(err); }

    /// End every live watch stream, with `err` as its last item if given.
    pub fn disconnect_watchers(&self, err: Option<Error>) {
        let _st = self.lock();
        let _ = self.tx.send(Msg::Disconnect(err));
    }

    pub fn list_calls(&self) -> usize { self.lists.load(Ordering::SeqCst) }
    pub fn watch_calls(&self) -> usize { self.watches.load(Ordering::SeqCst) }
    pub fn live_watchers(&self) -> usize { self.tx.receiver_count() }
}

#[async_trait]
impl<K> Lister<K> for MockCluster<K>
where
    K: kube::Resource + Object,
{
    async fn list(&self) -> Result<ObjectList<K>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let mut st = self.lock();
        if let Some(err) = st.list_faults.pop_front() {
            return Err(err);
        }
        Ok(ObjectList { items: st.objects.values().cloned().collect(), resource_version: ResourceVersion::new(st.rv.to_string()) })
    }
}

#[async_trait]
impl<K> Watcher<K> for MockCluster<K>
where
    K: kube::Resource + Object,
{
    async fn watch(&self, from: &ResourceVersion) -> Result<WatchStream<K>> {
        self.watches.fetch_add(1, Ordering::SeqCst);
        let mut st = self.lock();
        if let Some(err) = st.watch_faults.pop_front() {
            return Err(err);
        }
        let from_rv: u64 = from
            .as_str()
            .parse()
            .map_err(|_| Error::Connection(format!("invalid resource version {:?}", from.as_str())))?;
        if from_rv < st.compacted {
            return Err(Error::ExpiredToken(format!("too old resource version: {} ({})", from_rv, st.compacted)));
        }
        let replay: Vec<Result<WatchEvent<K>>> =
            st.history.iter().filter(|(rv, _)| *rv > from_rv).map(|(_, ev)| Ok(ev.clone())).collect();
        let rx = self.tx.subscribe();
        debug!(from = from_rv, replay = replay.len(), "mock: watch opened");
        let live = stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            match rx.recv().await {
                Ok(Msg::Event(ev)) => Some((Ok(ev), Some(rx))),
                Ok(Msg::Disconnect(Some(err))) => Some((Err(err), None)),
                Ok(Msg::Disconnect(None)) => None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    Some((Err(Error::Connection(format!("watch fell behind by {} events", n))), None))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(stream::iter(replay).chain(live).boxed())
    }
}
