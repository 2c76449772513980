//! Informa core types: object identity, deltas, and the list/watch contracts
//! the reflector is driven by.

#![forbid(unsafe_code)]

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Stable identity of an object inside one collection: `namespace/name`, or
/// just `name` for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Split back into `(namespace, name)`.
    pub fn parts(&self) -> (Option<&str>, &str) {
        match self.0.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, self.0.as_str()),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// Opaque version token (`resourceVersion`). Only equality is meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(v: impl Into<String>) -> Self { Self(v.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ResourceVersion {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// Anything the informer can mirror: a key plus a version token.
pub trait Object: Clone + Send + Sync + 'static {
    fn key(&self) -> ObjectKey;
    fn resource_version(&self) -> Option<ResourceVersion>;
}

impl<K> Object for K
where
    K: kube::Resource + Clone + Send + Sync + 'static,
{
    fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey::new(meta.namespace.as_deref(), meta.name.as_deref().unwrap_or_default())
    }

    fn resource_version(&self) -> Option<ResourceVersion> {
        self.meta().resource_version.as_deref().map(ResourceVersion::new)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Added => "added",
            DeltaKind::Updated => "updated",
            DeltaKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One observed change for one key. For `Deleted` the object is the last
/// state seen by whoever produced the delta (the tombstone).
#[derive(Debug, Clone)]
pub struct Delta<K> {
    pub key: ObjectKey,
    pub kind: DeltaKind,
    pub object: K,
}

impl<K: Object> Delta<K> {
    pub fn new(kind: DeltaKind, object: K) -> Self {
        Self { key: object.key(), kind, object }
    }

    pub fn added(object: K) -> Self { Self::new(DeltaKind::Added, object) }
    pub fn updated(object: K) -> Self { Self::new(DeltaKind::Updated, object) }
    pub fn deleted(object: K) -> Self { Self::new(DeltaKind::Deleted, object) }
}

/// A full snapshot of the collection and the version it was taken at.
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: ResourceVersion,
}

/// One entry of a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker: advances the resume point without a change.
    Bookmark(ResourceVersion),
}

impl<K: Object> WatchEvent<K> {
    /// Version the collection is at once this event has been observed.
    pub fn resource_version(&self) -> Option<ResourceVersion> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o.resource_version(),
            WatchEvent::Bookmark(rv) => Some(rv.clone()),
        }
    }

    /// Map to a delta; bookmarks carry none.
    pub fn into_delta(self) -> Option<Delta<K>> {
        match self {
            WatchEvent::Added(o) => Some(Delta::added(o)),
            WatchEvent::Modified(o) => Some(Delta::updated(o)),
            WatchEvent::Deleted(o) => Some(Delta::deleted(o)),
            WatchEvent::Bookmark(_) => None,
        }
    }
}

/// Informer error taxonomy.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("transient fetch error: {0}")]
    TransientFetch(String),
    #[error("fatal fetch error: {0}")]
    FatalFetch(String),
    #[error("watch connection error: {0}")]
    Connection(String),
    #[error("resource version expired: {0}")]
    ExpiredToken(String),
    #[error("handler error ({kind} {key}): {message}")]
    Handler { kind: DeltaKind, key: ObjectKey, message: String },
    #[error("informer stopped")]
    Stopped,
}

impl Error {
    /// Whether the reflector retries this internally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientFetch(_) | Error::Connection(_) | Error::ExpiredToken(_))
    }

    pub fn handler(kind: DeltaKind, key: &ObjectKey, err: &anyhow::Error) -> Self {
        Error::Handler { kind, key: key.clone(), message: format!("{:#}", err) }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Boxed watch stream. Dropping it releases the underlying connection.
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// Full snapshot fetch of the remote collection.
#[async_trait]
pub trait Lister<K>: Send + Sync {
    /// Fails with [`Error::TransientFetch`] or [`Error::FatalFetch`].
    async fn list(&self) -> Result<ObjectList<K>>;
}

/// Incremental change feed starting after a version token.
#[async_trait]
pub trait Watcher<K>: Send + Sync {
    /// Opening fails with [`Error::Connection`] or [`Error::ExpiredToken`];
    /// the stream may yield the same errors later.
    async fn watch(&self, from: &ResourceVersion) -> Result<WatchStream<K>>;
}

pub mod prelude {
    pub use super::{
        Delta, DeltaKind, Error, Lister, Object, ObjectKey, ObjectList, ResourceVersion, Result, WatchEvent,
        WatchStream, Watcher,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn svc(ns: Option<&str>, name: &str, rv: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: ns.map(|s| s.to_string()),
                resource_version: rv.map(|s| s.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn key_includes_namespace_when_present() {
        assert_eq!(svc(Some("ns1"), "svc1", None).key().as_str(), "ns1/svc1");
        assert_eq!(svc(None, "node-a", None).key().as_str(), "node-a");
        assert_eq!(ObjectKey::new(Some(""), "x").as_str(), "x");
    }

    #[test]
    fn key_parts_round_trip() {
        let k = ObjectKey::new(Some("ns1"), "svc1");
        assert_eq!(k.parts(), (Some("ns1"), "svc1"));
        assert_eq!(ObjectKey::from("solo").parts(), (None, "solo"));
    }

    #[test]
    fn resource_version_comes_from_metadata() {
        assert_eq!(svc(Some("a"), "b", Some("42")).resource_version(), Some(ResourceVersion::from("42")));
        assert_eq!(svc(Some("a"), "b", None).resource_version(), None);
    }

    #[test]
    fn bookmark_has_no_delta_but_advances_version() {
        let ev: WatchEvent<Service> = WatchEvent::Bookmark("7".into());
        assert_eq!(ev.resource_version(), Some(ResourceVersion::from("7")));
        assert!(ev.into_delta().is_none());
    }

    #[test]
    fn modified_maps_to_updated() {
        let d = WatchEvent::Modified(svc(Some("ns"), "a", Some("3"))).into_delta().expect("delta");
        assert_eq!(d.kind, DeltaKind::Updated);
        assert_eq!(d.key.as_str(), "ns/a");
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::TransientFetch("x".into()).is_retryable());
        assert!(Error::Connection("x".into()).is_retryable());
        assert!(Error::ExpiredToken("x".into()).is_retryable());
        assert!(!Error::FatalFetch("x".into()).is_retryable());
        assert!(!Error::Stopped.is_retryable());
    }

    #[test]
    fn object_key_serializes_as_plain_string() {
        let k = ObjectKey::new(Some("ns1"), "svc1");
        assert_eq!(serde_json::to_string(&k).expect("json"), "\"ns1/svc1\"");
    }
}
