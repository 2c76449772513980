//! List, reconcile, watch, repeat.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use informa_core::{Error, Lister, Object, ResourceVersion, Result, Watcher};
use informa_store::{DeltaQueue, Store};
use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::handlers::Handlers;

/// Progress of the first list-and-reconcile pass of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SyncState {
    Pending,
    Synced,
    Failed(Error),
    Stopped,
}

enum WatchOutcome {
    Cancelled,
    /// Resume point too old. The first relist is immediate.
    Expired { healthy: bool },
    /// Connection failed or the server closed the stream.
    Interrupted { healthy: bool },
}

pub(crate) struct Reflector<K> {
    pub(crate) lister: Arc<dyn Lister<K>>,
    pub(crate) watcher: Arc<dyn Watcher<K>>,
    pub(crate) store: Store<K>,
    pub(crate) queue: Arc<DeltaQueue<K>>,
    pub(crate) handlers: Arc<Handlers<K>>,
    pub(crate) backoff: Backoff,
    /// A session at least this long counts as healthy and resets the backoff.
    pub(crate) healthy_after: Duration,
    pub(crate) last_version: Arc<ArcSwapOption<ResourceVersion>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) synced: watch::Sender<SyncState>,
}

impl<K: Object> Reflector<K> {
    pub(crate) async fn run(mut self) -> Result<()> {
        info!("reflector: started");
        let res = self.run_loop().await;
        // Nothing else will be produced for this run.
        self.queue.close();
        match &res {
            Ok(()) => {
                self.synced.send_if_modified(|s| {
                    if *s == SyncState::Pending {
                        *s = SyncState::Stopped;
                        true
                    } else {
                        false
                    }
                });
                info!("reflector: stopped");
            }
            Err(e) => {
                self.synced.send_replace(SyncState::Failed(e.clone()));
                error!(error = %e, "reflector: giving up");
            }
        }
        res
    }

    async fn run_loop(&mut self) -> Result<()> {
        // Consecutive expiries of watches that never got going.
        let mut expired_streak = 0u32;
        loop {
            let Some(rv) = self.list_and_reconcile().await? else { return Ok(()) };
            match self.watch_from(rv).await {
                WatchOutcome::Cancelled => return Ok(()),
                WatchOutcome::Expired { healthy } => {
                    counter!("informer_watch_restarts_total", 1u64, "reason" => "expired");
                    if healthy {
                        self.backoff.reset();
                        expired_streak = 0;
                    }
                    expired_streak += 1;
                    // Back off once freshly listed versions keep expiring.
                    if expired_streak > 1 && !self.sleep_backoff().await {
                        return Ok(());
                    }
                }
                WatchOutcome::Interrupted { healthy } => {
                    expired_streak = 0;
                    counter!("informer_watch_restarts_total", 1u64, "reason" => "interrupted");
                    if healthy {
                        self.backoff.reset();
                    }
                    if !self.sleep_backoff().await {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn set_version(&self, rv: ResourceVersion) {
        self.last_version.store(Some(Arc::new(rv)));
    }

    /// Sleep for the next backoff delay. `false` when stopped meanwhile.
    async fn sleep_backoff(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        debug!(attempt = self.backoff.attempt(), delay_ms = delay.as_millis() as u64, "reflector: backing off");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// List until it succeeds, then queue the reconciliation deltas.
    /// `Ok(None)` when stopped first.
    async fn list_and_reconcile(&mut self) -> Result<Option<ResourceVersion>> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            let t0 = Instant::now();
            let res = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(None),
                res = self.lister.list() => res,
            };
            counter!("informer_relists_total", 1u64);
            histogram!("informer_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
            match res {
                Ok(list) => {
                    let listed = list.items.len();
                    let rv = list.resource_version;
                    let stats = match self.store.replace_all(list.items, &self.queue) {
                        Ok(stats) => stats,
                        Err(_) => return Ok(None),
                    };
                    info!(
                        rv = %rv,
                        listed,
                        added = stats.added,
                        updated = stats.updated,
                        deleted = stats.deleted,
                        took_ms = %t0.elapsed().as_millis(),
                        "reflector: list reconciled"
                    );
                    self.set_version(rv.clone());
                    self.synced.send_if_modified(|s| {
                        if *s == SyncState::Pending {
                            *s = SyncState::Synced;
                            true
                        } else {
                            false
                        }
                    });
                    return Ok(Some(rv));
                }
                Err(e @ Error::FatalFetch(_)) => {
                    self.handlers.report_error(&e);
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, attempt = self.backoff.attempt(), "reflector: list failed; retrying");
                    self.handlers.report_error(&e);
                    if !self.sleep_backoff().await {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn watch_from(&mut self, mut rv: ResourceVersion) -> WatchOutcome {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return WatchOutcome::Cancelled,
            res = self.watcher.watch(&rv) => res,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(Error::ExpiredToken(msg)) => {
                info!(rv = %rv, reason = %msg, "reflector: resume point expired; relisting");
                return WatchOutcome::Expired { healthy: false };
            }
            Err(e) => {
                warn!(rv = %rv, error = %e, attempt = self.backoff.attempt(), "reflector: watch failed to open");
                self.handlers.report_connect(Some(&e));
                self.handlers.report_error(&e);
                return WatchOutcome::Interrupted { healthy: false };
            }
        };
        info!(rv = %rv, "reflector: watch established");
        self.handlers.report_connect(None);

        let started = Instant::now();
        let mut events = 0u64;
        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break WatchOutcome::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(ev)) => {
                    events += 1;
                    if let Some(v) = ev.resource_version() {
                        rv = v.clone();
                        self.set_version(v);
                    }
                    if let Some(d) = ev.into_delta() {
                        if self.store.enqueue(d, &self.queue).is_err() {
                            break WatchOutcome::Cancelled;
                        }
                    }
                }
                Some(Err(Error::ExpiredToken(msg))) => {
                    info!(rv = %rv, events, reason = %msg, "reflector: watch expired; relisting");
                    break WatchOutcome::Expired { healthy: events > 0 || started.elapsed() >= self.healthy_after };
                }
                Some(Err(e)) => {
                    warn!(rv = %rv, events, error = %e, "reflector: watch broke");
                    self.handlers.report_connect(Some(&e));
                    self.handlers.report_error(&e);
                    break WatchOutcome::Interrupted { healthy: events > 0 || started.elapsed() >= self.healthy_after };
                }
                None => {
                    debug!(rv = %rv, events, "reflector: watch stream ended");
                    break WatchOutcome::Interrupted { healthy: events > 0 || started.elapsed() >= self.healthy_after };
                }
            }
        };
        // Release the connection before relisting.
        drop(stream);
        outcome
    }
}
