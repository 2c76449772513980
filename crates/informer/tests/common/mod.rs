#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use informa::{BackoffConfig, DeltaKind, Error, Informer, InformerConfig, ObjectKey};
use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::mpsc;

pub type Events = mpsc::UnboundedReceiver<(DeltaKind, String, String)>;

pub fn svc(ns: &str, name: &str) -> Service {
    Service {
        metadata: ObjectMeta { name: Some(name.to_string()), namespace: Some(ns.to_string()), ..Default::default() },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn key(ns: &str, name: &str) -> ObjectKey { ObjectKey::new(Some(ns), name) }

pub fn fast() -> InformerConfig {
    InformerConfig { backoff: BackoffConfig { initial_ms: 10, max_ms: 100, jitter: 0.0 } }
}

fn describe(o: &Service) -> (String, String) {
    (
        o.metadata.name.clone().unwrap_or_default(),
        o.metadata.resource_version.clone().unwrap_or_default(),
    )
}

/// Record every add/update/delete as `(kind, name, resourceVersion)`.
pub fn record(inf: &Informer<Service>) -> Events {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in [DeltaKind::Added, DeltaKind::Updated, DeltaKind::Deleted] {
        let tx = tx.clone();
        inf.on(kind, move |o: &Service| {
            let (name, rv) = describe(o);
            let _ = tx.send((kind, name, rv));
            Ok(())
        });
    }
    rx
}

pub fn record_errors(inf: &Informer<Service>) -> Arc<Mutex<Vec<Error>>> {
    let errs = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errs);
    inf.on_error(move |e| sink.lock().unwrap().push(e.clone()));
    errs
}

pub fn record_connects(inf: &Informer<Service>) -> Arc<Mutex<Vec<Option<Error>>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    inf.on_connect(move |e| sink.lock().unwrap().push(e.cloned()));
    seen
}

/// Everything already delivered, without waiting.
pub fn drained(rx: &mut Events) -> Vec<(DeltaKind, String)> {
    let mut out = Vec::new();
    while let Ok((kind, name, _)) = rx.try_recv() {
        out.push((kind, name));
    }
    out
}

/// Wait for exactly `n` events (fails the test on timeout).
pub async fn next_n(rx: &mut Events, n: usize) -> Vec<(DeltaKind, String, String)> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(ev)) => out.push(ev),
            Ok(None) => panic!("event channel closed after {:?}", out),
            Err(_) => panic!("timed out waiting for {} events, got {:?}", n, out),
        }
    }
    out
}

/// Whatever arrives within `dur`.
pub async fn quiet_for(rx: &mut Events, dur: Duration) -> Vec<(DeltaKind, String, String)> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + dur;
    while let Ok(Some(ev)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        out.push(ev);
    }
    out
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
