use std::sync::Arc;

use informa_core::Object;
use informa_store::{DeltaQueue, Store};
use metrics::counter;
use tracing::{info, trace};

use crate::handlers::Handlers;

/// Drain the queue into the store and hand every effective change to the
/// handlers. Returns once the queue is closed and empty.
pub(crate) async fn run<K: Object>(queue: Arc<DeltaQueue<K>>, store: Store<K>, handlers: Arc<Handlers<K>>) {
    info!("processor: started");
    let mut delivered = 0u64;
    let mut failures = 0u64;
    while let Some(applied) = queue.pop_with(|d| store.apply(d)).await {
        let Some(ev) = applied else { continue };
        counter!("informer_deltas_total", 1u64, "kind" => ev.kind.as_str());
        trace!(key = %ev.key, kind = %ev.kind, "processor: dispatch");
        failures += handlers.dispatch(&ev) as u64;
        delivered += 1;
    }
    info!(delivered, failures, "processor: queue closed; stopped");
}
