mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use informa::mock::MockCluster;
use informa::{BackoffConfig, DeltaKind, Error, Informer, InformerConfig};
use k8s_openapi::api::core::v1::Service;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_watch_is_resumed_without_spurious_events() {
    let cluster: Arc<MockCluster<Service>> = Arc::new(MockCluster::new());
    cluster.create(svc("ns1", "a")).unwrap();
    cluster.create(svc("ns1", "b")).unwrap();
    let inf = Informer::from_list_watch(Arc::clone(&cluster), fast());
    let connects = record_connects(&inf);
    let errors = record_errors(&inf);
    let mut rx = record(&inf);

    inf.start().await.unwrap();
    next_n(&mut rx, 2).await;
    eventually(|| connects.lock().unwrap().len() == 1).await;

    let reset = Error::Connection("connection reset by peer".into());
    cluster.disconnect_watchers(Some(reset.clone()));
    eventually(|| connects.lock().unwrap().len() == 3).await;
    assert_eq!(*connects.lock().unwrap(), vec![None, Some(reset.clone()), None]);
    assert_eq!(cluster.list_calls(), 2);
    assert!(errors.lock().unwrap().contains(&reset));
    assert!(quiet_for(&mut rx, Duration::from_millis(100)).await.is_empty());

    cluster.create(svc("ns1", "c")).unwrap();
    let got = next_n(&mut rx, 1).await;
    assert_eq!((got[0].0, got[0].1.as_str()), (DeltaKind::Added, "c"));
    inf.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changes_during_an_outage_arrive_exactly_once() {
    let cluster: Arc<MockCluster<Service>> = Arc::new(MockCluster::new());
    cluster.create(svc("ns1", "a")).unwrap();
    cluster.create(svc("ns1", "b")).unwrap();
    let inf = Informer::from_list_watch(Arc::clone(&cluster), fast());
    let connects = record_connects(&inf);
    let mut rx = record(&inf);

    inf.start().await.unwrap();
    next_n(&mut rx, 2).await;
    eventually(|| connects.lock().unwrap().len() == 1).await;

    cluster.fail_next_watch(Error::Connection("connection refused".into()));
    cluster.disconnect_watchers(None);
    cluster.update(svc("ns1", "a")).unwrap();
    cluster.delete(&key("ns1", "b")).unwrap();
    cluster.create(svc("ns1", "c")).unwrap();

    let mut got: Vec<_> = next_n(&mut rx, 3).await.into_iter().map(|(k, n, _)| (k, n)).collect();
    got.sort();
    assert_eq!(
        got,
        vec![
            (DeltaKind::Added, "c".to_string()),
            (DeltaKind::Updated, "a".to_string()),
            (DeltaKind::Deleted, "b".to_string()),
        ]
    );
    eventually(|| cluster.live_watchers() == 1 && connects.lock().unwrap().last() == Some(&None)).await;
    assert!(quiet_for(&mut rx, Duration::from_millis(100)).await.is_empty());
    let mut keys = inf.store().keys();
    keys.sort();
    assert_eq!(keys, vec![key("ns1", "a"), key("ns1", "c")]);
    inf.stop().await;
    assert_eq!(cluster.live_watchers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_resume_point_relists_without_reporting_an_error() {
    let cluster: Arc<MockCluster<Service>> = Arc::new(MockCluster::new());
    cluster.create(svc("ns1", "a")).unwrap();
    let inf = Informer::from_list_watch(Arc::clone(&cluster), fast());
    let connects = record_connects(&inf);
    let errors = record_errors(&inf);
    let mut rx = record(&inf);

    inf.start().await.unwrap();
    next_n(&mut rx, 1).await;
    eventually(|| connects.lock().unwrap().len() == 1).await;

    cluster.compact();
    cluster.disconnect_watchers(Some(Error::ExpiredToken("too old resource version".into())));
    eventually(|| cluster.list_calls() == 2 && connects.lock().unwrap().len() == 2).await;
    assert_eq!(*connects.lock().unwrap(), vec![None, None]);
    assert!(errors.lock().unwrap().is_empty());
    assert!(quiet_for(&mut rx, Duration::from_millis(100)).await.is_empty());

    cluster.update(svc("ns1", "a")).unwrap();
    let got = next_n(&mut rx, 1).await;
    assert_eq!((got[0].0, got[0].1.as_str()), (DeltaKind::Updated, "a"));
    inf.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bookmarks_produce_no_events() {
    let cluster: Arc<MockCluster<Service>> = Arc::new(MockCluster::new());
    cluster.create(svc("ns1", "a")).unwrap();
    let inf = Informer::from_list_watch(Arc::clone(&cluster), fast());
    let connects = record_connects(&inf);
    let mut rx = record(&inf);

    inf.start().await.unwrap();
    next_n(&mut rx, 1).await;
    eventually(|| connects.lock().unwrap().len() == 1).await;

    cluster.bookmark();
    assert!(quiet_for(&mut rx, Duration::from_millis(100)).await.is_empty());
    assert_eq!(inf.last_sync_version(), Some(cluster.current_version()));
    inf.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_expiry_backs_off_between_relists() {
    let cluster: Arc<MockCluster<Service>> = Arc::new(MockCluster::new());
    cluster.create(svc("ns1", "a")).unwrap();
    for _ in 0..4 {
        cluster.fail_next_watch(Error::ExpiredToken("too old resource version".into()));
    }
    let cfg = InformerConfig { backoff: BackoffConfig { initial_ms: 20, max_ms: 1_000, jitter: 0.0 } };
    let inf = Informer::from_list_watch(Arc::clone(&cluster), cfg);
    let connects = record_connects(&inf);
    let errors = record_errors(&inf);

    let t0 = Instant::now();
    inf.start().await.unwrap();
    eventually(|| connects.lock().unwrap().len() == 1).await;
    let took = t0.elapsed();

    // First expiry relists at once, then 20 + 40 + 80 ms between the rest.
    assert_eq!(cluster.list_calls(), 5);
    assert_eq!(cluster.watch_calls(), 5);
    assert!(took >= Duration::from_millis(140), "relists were not spaced: {:?}", took);
    assert!(errors.lock().unwrap().is_empty());
    inf.stop().await;
}
