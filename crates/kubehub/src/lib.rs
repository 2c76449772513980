//! Informa kubehub: `Lister`/`Watcher` over a typed `kube::Api`, plus the
//! service helpers the CLI scenario drives.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::time::Instant;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use informa_core::{Error, Lister, ObjectList, ResourceVersion, Result, WatchEvent, WatchStream, Watcher};
use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams, WatchParams};
use kube::core::{ErrorResponse, WatchEvent as KubeWatchEvent};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Request shaping for list and watch calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListWatchParams {
    /// `limit` per list page; 0 lists in one request.
    pub page_size: u32,
    /// Server-side watch timeout. The API server rejects values of 295 or more.
    pub watch_timeout_secs: u32,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl Default for ListWatchParams {
    fn default() -> Self {
        Self { page_size: 500, watch_timeout_secs: 290, label_selector: None, field_selector: None }
    }
}

impl ListWatchParams {
    /// Read `INFORMA_PAGE_SIZE` and `INFORMA_WATCH_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            page_size: env_parse("INFORMA_PAGE_SIZE").unwrap_or(d.page_size),
            watch_timeout_secs: env_parse::<u32>("INFORMA_WATCH_TIMEOUT_SECS")
                .map(|s| s.clamp(1, 294))
                .unwrap_or(d.watch_timeout_secs),
            ..d
        }
    }

    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }

    fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        if self.page_size > 0 {
            lp = lp.limit(self.page_size);
        }
        if let Some(l) = &self.label_selector {
            lp = lp.labels(l);
        }
        if let Some(f) = &self.field_selector {
            lp = lp.fields(f);
        }
        lp
    }

    fn watch_params(&self) -> WatchParams {
        let mut wp = WatchParams::default().timeout(self.watch_timeout_secs);
        if let Some(l) = &self.label_selector {
            wp = wp.labels(l);
        }
        if let Some(f) = &self.field_selector {
            wp = wp.fields(f);
        }
        wp
    }
}

fn describe(resp: &ErrorResponse) -> String {
    if resp.reason.is_empty() {
        format!("{} ({})", resp.message, resp.code)
    } else {
        format!("{}: {} ({})", resp.reason, resp.message, resp.code)
    }
}

/// Map a failed list request. 410 here means the continue token expired
/// mid-pagination, which a fresh list recovers from.
pub fn list_error(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(resp) => match resp.code {
            401 | 403 | 404 => Error::FatalFetch(describe(&resp)),
            _ => Error::TransientFetch(describe(&resp)),
        },
        kube::Error::Auth(e) => Error::FatalFetch(e.to_string()),
        kube::Error::SerdeError(e) => Error::TransientFetch(format!("decoding list: {}", e)),
        other => Error::TransientFetch(other.to_string()),
    }
}

/// Map a failed watch request or stream item.
pub fn watch_error(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(resp) => status_error(&resp),
        kube::Error::Auth(e) => Error::FatalFetch(e.to_string()),
        other => Error::Connection(other.to_string()),
    }
}

/// Map an `ERROR` event delivered inside a watch stream.
pub fn status_error(resp: &ErrorResponse) -> Error {
    match resp.code {
        410 => Error::ExpiredToken(describe(resp)),
        _ => Error::Connection(describe(resp)),
    }
}

fn convert<K>(ev: KubeWatchEvent<K>) -> Result<WatchEvent<K>> {
    match ev {
        KubeWatchEvent::Added(o) => Ok(WatchEvent::Added(o)),
        KubeWatchEvent::Modified(o) => Ok(WatchEvent::Modified(o)),
        KubeWatchEvent::Deleted(o) => Ok(WatchEvent::Deleted(o)),
        KubeWatchEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(ResourceVersion::new(b.metadata.resource_version))),
        KubeWatchEvent::Error(resp) => Err(status_error(&resp)),
    }
}

/// List and watch one typed collection through the API server.
#[derive(Clone)]
pub struct KubeListerWatcher<K> {
    api: Api<K>,
    params: ListWatchParams,
}

impl<K> KubeListerWatcher<K> {
    pub fn new(api: Api<K>, params: ListWatchParams) -> Self { Self { api, params } }

    pub fn params(&self) -> &ListWatchParams { &self.params }
}

#[async_trait]
impl<K> Lister<K> for KubeListerWatcher<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn list(&self) -> Result<ObjectList<K>> {
        let t0 = Instant::now();
        let mut lp = self.params.list_params();
        let mut items = Vec::new();
        let mut pages = 0u32;
        loop {
            let page = self.api.list(&lp).await.map_err(list_error)?;
            pages += 1;
            metrics::counter!("informer_list_pages_total", 1u64);
            items.extend(page.items);
            match page.metadata.continue_.filter(|c| !c.is_empty()) {
                Some(token) => {
                    debug!(page = pages, so_far = items.len(), "kubehub: list continues");
                    lp = lp.continue_token(&token);
                }
                None => {
                    let rv = page.metadata.resource_version.unwrap_or_default();
                    info!(items = items.len(), pages, rv = %rv, took_ms = %t0.elapsed().as_millis(), "kubehub: list complete");
                    return Ok(ObjectList { items, resource_version: ResourceVersion::new(rv) });
                }
            }
        }
    }
}

#[async_trait]
impl<K> Watcher<K> for KubeListerWatcher<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn watch(&self, from: &ResourceVersion) -> Result<WatchStream<K>> {
        let wp = self.params.watch_params();
        let stream = self.api.watch(&wp, from.as_str()).await.map_err(watch_error)?;
        debug!(rv = %from, timeout_secs = self.params.watch_timeout_secs, "kubehub: watch opened");
        Ok(stream.map_err(watch_error).and_then(|ev| async move { convert(ev) }).boxed())
    }
}

/// Create a headless (`clusterIP: None`) service with no ports.
pub async fn create_headless_service(api: &Api<Service>, name: &str) -> AnyResult<Service> {
    let svc = Service {
        metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let created = api.create(&PostParams::default(), &svc).await.with_context(|| format!("creating service {}", name))?;
    info!(name, rv = ?created.metadata.resource_version, "kubehub: service created");
    Ok(created)
}

pub async fn delete_service(api: &Api<Service>, name: &str) -> AnyResult<()> {
    api.delete(name, &DeleteParams::default()).await.with_context(|| format!("deleting service {}", name))?;
    info!(name, "kubehub: service deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("request failed with {}", code),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn list_errors_split_fatal_from_retryable() {
        assert!(matches!(list_error(api_error(403, "Forbidden")), Error::FatalFetch(_)));
        assert!(matches!(list_error(api_error(401, "Unauthorized")), Error::FatalFetch(_)));
        assert!(matches!(list_error(api_error(404, "NotFound")), Error::FatalFetch(_)));
        // An expired continue token only restarts the list.
        assert!(matches!(list_error(api_error(410, "Expired")), Error::TransientFetch(_)));
        assert!(matches!(list_error(api_error(503, "ServiceUnavailable")), Error::TransientFetch(_)));
    }

    #[test]
    fn list_transport_failures_are_transient() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        let err = list_error(kube::Error::Service(Box::new(refused)));
        assert!(matches!(&err, Error::TransientFetch(m) if m.contains("connection refused")), "got {:?}", err);
        let bad = serde_json::from_str::<u8>("x").unwrap_err();
        assert!(matches!(list_error(kube::Error::SerdeError(bad)), Error::TransientFetch(_)));
    }

    #[test]
    fn watch_gone_means_expired_token() {
        assert!(matches!(watch_error(api_error(410, "Gone")), Error::ExpiredToken(_)));
        assert!(matches!(watch_error(api_error(500, "InternalError")), Error::Connection(_)));
    }

    #[test]
    fn error_events_in_stream_are_mapped() {
        let gone: KubeWatchEvent<Service> = serde_json::from_value(serde_json::json!({
            "type": "ERROR",
            "object": {"status": "Failure", "message": "too old resource version: 1 (5)", "reason": "Expired", "code": 410}
        }))
        .unwrap();
        assert!(matches!(convert(gone), Err(Error::ExpiredToken(m)) if m.contains("too old")));
    }

    #[test]
    fn bookmarks_carry_the_version() {
        let bm: KubeWatchEvent<Service> = serde_json::from_value(serde_json::json!({
            "type": "BOOKMARK",
            "object": {"kind": "Service", "apiVersion": "v1", "metadata": {"resourceVersion": "12345"}}
        }))
        .unwrap();
        match convert(bm).unwrap() {
            WatchEvent::Bookmark(rv) => assert_eq!(rv.as_str(), "12345"),
            _ => panic!("expected bookmark"),
        }
    }

    #[test]
    fn params_shape_requests() {
        let p = ListWatchParams::default().labels("app=web").fields("metadata.name=svc1");
        let lp = p.list_params();
        assert_eq!(lp.limit, Some(500));
        assert_eq!(lp.label_selector.as_deref(), Some("app=web"));
        let wp = p.watch_params();
        assert_eq!(wp.timeout, Some(290));
        assert_eq!(wp.field_selector.as_deref(), Some("metadata.name=svc1"));
    }
}
