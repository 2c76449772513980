use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use informa_core::{Delta, DeltaKind, Error};
use metrics::counter;
use tracing::warn;

/// Callback for one event kind. Errors are reported through the error hooks.
pub type EventHandler<K> = Arc<dyn Fn(&K) -> anyhow::Result<()> + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;
/// `None` when a watch connection is established, `Some(err)` when opening or
/// keeping it failed.
pub type ConnectHook = Arc<dyn Fn(Option<&Error>) + Send + Sync>;

/// Per-informer callback registry. Handlers run in registration order.
pub struct Handlers<K> {
    events: RwLock<Vec<(DeltaKind, EventHandler<K>)>>,
    errors: RwLock<Vec<ErrorHook>>,
    connects: RwLock<Vec<ConnectHook>>,
}

impl<K> Default for Handlers<K> {
    fn default() -> Self {
        Self { events: RwLock::new(Vec::new()), errors: RwLock::new(Vec::new()), connects: RwLock::new(Vec::new()) }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl<K> Handlers<K> {
    pub fn register(&self, kind: DeltaKind, f: EventHandler<K>) {
        self.events.write().unwrap_or_else(PoisonError::into_inner).push((kind, f));
    }

    pub fn on_error(&self, f: ErrorHook) {
        self.errors.write().unwrap_or_else(PoisonError::into_inner).push(f);
    }

    pub fn on_connect(&self, f: ConnectHook) {
        self.connects.write().unwrap_or_else(PoisonError::into_inner).push(f);
    }

    fn handlers_for(&self, kind: DeltaKind) -> Vec<EventHandler<K>> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, f)| Arc::clone(f))
            .collect()
    }

    /// Invoke every handler registered for `ev.kind`. A failing or panicking
    /// handler is reported and the rest still run. Returns the number of
    /// failures.
    pub fn dispatch(&self, ev: &Delta<K>) -> usize {
        let mut failed = 0;
        for h in self.handlers_for(ev.kind) {
            let res = match catch_unwind(AssertUnwindSafe(|| h(&ev.object))) {
                Ok(res) => res,
                Err(payload) => Err(anyhow::anyhow!("panic: {}", panic_message(payload.as_ref()))),
            };
            if let Err(e) = res {
                failed += 1;
                counter!("informer_handler_errors_total", 1u64, "kind" => ev.kind.as_str());
                let err = Error::handler(ev.kind, &ev.key, &e);
                warn!(key = %ev.key, kind = %ev.kind, error = %err, "handlers: event handler failed");
                self.report_error(&err);
            }
        }
        failed
    }

    pub fn report_error(&self, err: &Error) {
        let hooks: Vec<ErrorHook> = self.errors.read().unwrap_or_else(PoisonError::into_inner).clone();
        for hook in hooks {
            if catch_unwind(AssertUnwindSafe(|| hook(err))).is_err() {
                warn!(error = %err, "handlers: error hook panicked");
            }
        }
    }

    pub fn report_connect(&self, err: Option<&Error>) {
        let hooks: Vec<ConnectHook> = self.connects.read().unwrap_or_else(PoisonError::into_inner).clone();
        for hook in hooks {
            if catch_unwind(AssertUnwindSafe(|| hook(err))).is_err() {
                warn!("handlers: connect hook panicked");
            }
        }
    }
}
