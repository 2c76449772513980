//! Informa: a list-watch informer.
//!
//! An [`Informer`] keeps a local [`Store`](informa_store::Store) in step with
//! a remote collection reachable through a [`Lister`] and a [`Watcher`], and
//! calls registered handlers once per add, update and delete. Stopping keeps
//! the store, so a later start only reports what changed in between.

#![forbid(unsafe_code)]

mod backoff;
mod config;
mod handlers;
pub mod mock;
mod processor;
mod reflector;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use backoff::Backoff;
pub use config::{BackoffConfig, InformerConfig};
pub use handlers::{ConnectHook, ErrorHook, EventHandler, Handlers};
pub use informa_core::{
    Delta, DeltaKind, Error, Lister, Object, ObjectKey, ObjectList, ResourceVersion, Result, WatchEvent,
    WatchStream, Watcher,
};
pub use informa_store::{DeltaQueue, ReplaceStats, Store, StoreReader};

use reflector::{Reflector, SyncState};

/// Externally visible lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InformerState {
    Idle,
    Running,
    Stopping,
}

/// One start..stop cycle. `task` owns the reflector and the processor and
/// resolves once both have exited.
struct Run {
    id: u64,
    cancel: CancellationToken,
    synced: watch::Receiver<SyncState>,
    task: JoinHandle<Result<()>>,
}

impl Run {
    /// Ended on its own (fatal error) rather than through `stop`.
    fn failed(&self) -> bool { matches!(*self.synced.borrow(), SyncState::Failed(_)) }
}

enum Lifecycle {
    Idle,
    Running(Run),
}

pub struct Informer<K: Object> {
    lister: Arc<dyn Lister<K>>,
    watcher: Arc<dyn Watcher<K>>,
    config: InformerConfig,
    store: Store<K>,
    queue: Arc<DeltaQueue<K>>,
    handlers: Arc<Handlers<K>>,
    last_version: Arc<ArcSwapOption<ResourceVersion>>,
    lifecycle: Mutex<Lifecycle>,
    runs: AtomicU64,
    state_tx: Arc<watch::Sender<InformerState>>,
}

impl<K: Object> Informer<K> {
    pub fn new(lister: Arc<dyn Lister<K>>, watcher: Arc<dyn Watcher<K>>, config: InformerConfig) -> Self {
        let (state_tx, _) = watch::channel(InformerState::Idle);
        Self {
            lister,
            watcher,
            config,
            store: Store::new(),
            queue: Arc::new(DeltaQueue::new()),
            handlers: Arc::new(Handlers::default()),
            last_version: Arc::new(ArcSwapOption::empty()),
            lifecycle: Mutex::new(Lifecycle::Idle),
            runs: AtomicU64::new(0),
            state_tx: Arc::new(state_tx),
        }
    }

    /// Build from one value that can both list and watch.
    pub fn from_list_watch<LW>(lw: Arc<LW>, config: InformerConfig) -> Self
    where
        LW: Lister<K> + Watcher<K> + 'static,
    {
        let lister: Arc<dyn Lister<K>> = lw.clone();
        let watcher: Arc<dyn Watcher<K>> = lw;
        Self::new(lister, watcher, config)
    }

    /// Register a handler for one event kind.
    pub fn on<F>(&self, kind: DeltaKind, f: F)
    where
        F: Fn(&K) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.register(kind, Arc::new(f));
    }

    pub fn on_add<F>(&self, f: F)
    where
        F: Fn(&K) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(DeltaKind::Added, f);
    }

    pub fn on_update<F>(&self, f: F)
    where
        F: Fn(&K) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(DeltaKind::Updated, f);
    }

    /// Handlers receive the last state the store held for the object.
    pub fn on_delete<F>(&self, f: F)
    where
        F: Fn(&K) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(DeltaKind::Deleted, f);
    }

    /// List/watch failures, handler failures, and the fatal error that ends a run.
    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.handlers.on_error(Arc::new(f));
    }

    /// Fired with `None` whenever a watch is (re)established and with the
    /// error when one fails.
    pub fn on_connect<F>(&self, f: F)
    where
        F: Fn(Option<&Error>) + Send + Sync + 'static,
    {
        self.handlers.on_connect(Arc::new(f));
    }

    pub fn store(&self) -> StoreReader<K> { self.store.reader() }

    pub fn state(&self) -> InformerState { *self.state_tx.borrow() }

    pub fn subscribe_state(&self) -> watch::Receiver<InformerState> { self.state_tx.subscribe() }

    /// Collection version of the last list or watch event observed. Kept
    /// across stop/start.
    pub fn last_sync_version(&self) -> Option<ResourceVersion> {
        self.last_version.load_full().map(|rv| (*rv).clone())
    }

    pub fn config(&self) -> &InformerConfig { &self.config }

    fn spawn_run(&self) -> Run {
        let id = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        self.queue.reset();
        let cancel = CancellationToken::new();
        let (synced_tx, synced) = watch::channel(SyncState::Pending);
        let reflector = Reflector {
            lister: Arc::clone(&self.lister),
            watcher: Arc::clone(&self.watcher),
            store: self.store.clone(),
            queue: Arc::clone(&self.queue),
            handlers: Arc::clone(&self.handlers),
            backoff: Backoff::new(self.config.backoff.clone()),
            healthy_after: self.config.backoff.max(),
            last_version: Arc::clone(&self.last_version),
            cancel: cancel.clone(),
            synced: synced_tx,
        };
        let processor = processor::run(Arc::clone(&self.queue), self.store.clone(), Arc::clone(&self.handlers));
        let state_tx = Arc::clone(&self.state_tx);
        let task = tokio::spawn(async move {
            let processor = tokio::spawn(processor);
            let res = reflector.run().await;
            // The reflector closed the queue; wait for the backlog to drain.
            if let Err(e) = processor.await {
                warn!(run = id, error = %e, "informer: processor task failed");
            }
            if let Err(e) = &res {
                state_tx.send_replace(InformerState::Idle);
                warn!(run = id, error = %e, "informer: run ended by fatal error; now idle");
            }
            res
        });
        self.state_tx.send_replace(InformerState::Running);
        info!(run = id, known = self.store.len(), "informer: started");
        Run { id, cancel, synced, task }
    }

    /// Begin (or resume) mirroring. Resolves once the first list has been
    /// reconciled into the queue; fails with the lister's fatal error, or
    /// with [`Error::Stopped`] when [`stop`](Self::stop) wins the race.
    /// Calling it while running only waits for that first pass.
    pub async fn start(&self) -> Result<()> {
        let (mut synced, id) = {
            let mut lc = self.lifecycle.lock().await;
            if matches!(&*lc, Lifecycle::Running(run) if run.failed()) {
                if let Lifecycle::Running(dead) = std::mem::replace(&mut *lc, Lifecycle::Idle) {
                    self.reap(dead).await;
                }
            }
            if let Lifecycle::Idle = &*lc {
                *lc = Lifecycle::Running(self.spawn_run());
            }
            match &*lc {
                Lifecycle::Running(run) => (run.synced.clone(), run.id),
                Lifecycle::Idle => return Err(Error::Stopped),
            }
        };
        // Waited on outside the lifecycle lock so a concurrent stop can cancel it.
        let state = match synced.wait_for(|s| *s != SyncState::Pending).await {
            Ok(s) => s.clone(),
            Err(_) => SyncState::Stopped,
        };
        match state {
            SyncState::Synced => Ok(()),
            SyncState::Failed(e) => {
                self.shutdown(Some(id)).await;
                Err(e)
            }
            SyncState::Pending | SyncState::Stopped => Err(Error::Stopped),
        }
    }

    /// Halt the reflector and processor and wait for both to exit. Deltas
    /// already queued are still delivered. The store is kept.
    pub async fn stop(&self) { self.shutdown(None).await; }

    async fn shutdown(&self, only: Option<u64>) {
        let mut lc = self.lifecycle.lock().await;
        let run = match std::mem::replace(&mut *lc, Lifecycle::Idle) {
            Lifecycle::Running(run) if only.map_or(true, |id| id == run.id) => run,
            other => {
                *lc = other;
                return;
            }
        };
        self.state_tx.send_replace(InformerState::Stopping);
        self.reap(run).await;
    }

    /// Cancel a run and wait for its reflector and processor. Caller holds
    /// the lifecycle lock.
    async fn reap(&self, run: Run) {
        run.cancel.cancel();
        match run.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(run = run.id, error = %e, "informer: run ended with error"),
            Err(e) => warn!(run = run.id, error = %e, "informer: run task failed"),
        }
        // The reflector closes it on exit; a panicked one could not.
        self.queue.close();
        self.state_tx.send_replace(InformerState::Idle);
        info!(run = run.id, known = self.store.len(), rv = ?self.last_sync_version(), "informer: stopped");
    }
}

impl<K: Object> Drop for Informer<K> {
    fn drop(&mut self) {
        if let Lifecycle::Running(run) = self.lifecycle.get_mut() {
            run.cancel.cancel();
        }
    }
}
