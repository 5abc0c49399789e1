//! Request/response and streaming seam between clients and the API server.

use std::fmt;

use futures::{stream::BoxStream, StreamExt};
use http::Request;
use kube::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{ApiError, ApiResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A single change observed on a watch stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Bookmark { resource_version: String },
    Error { code: u16, message: String },
}

impl WatchEvent {
    pub fn object(&self) -> Option<&Value> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
            _ => None,
        }
    }

    /// Version to resume from after this event, if it carries one.
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Bookmark { resource_version } => Some(resource_version),
            _ => self.object()?.get("metadata")?.get("resourceVersion")?.as_str(),
        }
    }
}

impl From<kube::core::WatchEvent<Value>> for WatchEvent {
    fn from(ev: kube::core::WatchEvent<Value>) -> Self {
        use kube::core::WatchEvent as Kev;
        match ev {
            Kev::Added(o) => WatchEvent::Added(o),
            Kev::Modified(o) => WatchEvent::Modified(o),
            Kev::Deleted(o) => WatchEvent::Deleted(o),
            Kev::Bookmark(b) => WatchEvent::Bookmark { resource_version: b.metadata.resource_version },
            Kev::Error(e) => WatchEvent::Error { code: e.code, message: e.message },
        }
    }
}

pub type EventStream = BoxStream<'static, ApiResult<WatchEvent>>;

/// What a client needs from the wire: plain JSON requests and an event stream.
///
/// URLs are server-relative (`/api/v1/pods?watch=1`) with the query already encoded.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, method: Method, url: &str, body: Option<Value>) -> ApiResult<Value>;

    async fn watch(&self, url: &str) -> ApiResult<EventStream>;
}

/// Transport backed by a kube-rs client (kubeconfig or in-cluster credentials).
#[derive(Clone)]
pub struct KubeTransport {
    client: Client,
}

impl KubeTransport {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> ApiResult<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn http_request(method: Method, url: &str, body: Option<&Value>) -> ApiResult<Request<Vec<u8>>> {
        let mut builder = Request::builder().method(method.as_str()).uri(url);
        let bytes = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                serde_json::to_vec(v)?
            }
            None => Vec::new(),
        };
        builder.body(bytes).map_err(|e| ApiError::Request(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Transport for KubeTransport {
    async fn request(&self, method: Method, url: &str, body: Option<Value>) -> ApiResult<Value> {
        let req = Self::http_request(method, url, body.as_ref())?;
        debug!(%method, url, "kube: request");
        Ok(self.client.request::<Value>(req).await?)
    }

    async fn watch(&self, url: &str) -> ApiResult<EventStream> {
        let req = Self::http_request(Method::Get, url, None)?;
        debug!(url, "kube: watch");
        let events = self.client.request_events::<Value>(req).await?;
        Ok(events.map(|r| r.map(WatchEvent::from).map_err(ApiError::from)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resource_version_comes_from_object_or_bookmark() {
        let ev = WatchEvent::Modified(json!({ "metadata": { "name": "a", "resourceVersion": "77" } }));
        assert_eq!(ev.resource_version(), Some("77"));
        let bm = WatchEvent::Bookmark { resource_version: "80".into() };
        assert_eq!(bm.resource_version(), Some("80"));
        let err = WatchEvent::Error { code: 410, message: "too old".into() };
        assert_eq!(err.resource_version(), None);
        assert!(err.object().is_none());
    }

    #[test]
    fn converts_kube_events() {
        let kev: kube::core::WatchEvent<Value> = serde_json::from_value(json!({
            "type": "BOOKMARK",
            "object": { "kind": "Pod", "apiVersion": "v1", "metadata": { "resourceVersion": "12" } }
        }))
        .expect("bookmark");
        assert_eq!(WatchEvent::from(kev), WatchEvent::Bookmark { resource_version: "12".into() });

        let kev: kube::core::WatchEvent<Value> = serde_json::from_value(json!({
            "type": "ADDED",
            "object": { "metadata": { "name": "x" } }
        }))
        .expect("added");
        assert_eq!(WatchEvent::from(kev), WatchEvent::Added(json!({ "metadata": { "name": "x" } })));
    }

    #[test]
    fn builds_json_requests() {
        let req = KubeTransport::http_request(Method::Post, "/api/v1/namespaces/ns/configmaps", Some(&json!({"a": 1}))).expect("req");
        assert_eq!(req.method().as_str(), "POST");
        assert_eq!(req.uri().path(), "/api/v1/namespaces/ns/configmaps");
        assert_eq!(req.headers().get("content-type").map(|v| v.as_bytes()), Some(&b"application/json"[..]));
        assert_eq!(req.body(), &br#"{"a":1}"#.to_vec());
    }
}
