//! Per-kind API client.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use kubelink_core::{merge_json, parse, ApiPathComponents, Query};
use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::endpoint::{ApiEndpoint, ObjectTarget};
use crate::registry::ApiRegistry;
use crate::transport::{Method, Transport};
use crate::versions::ResourceVersionTracker;
use crate::watch::{Disposer, WatchCoordinator};
use crate::{ApiError, ApiResult};

/// Static identity of one kind as known to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub kind: String,
    /// Any path of the kind's collection; namespace and name segments are ignored.
    pub api_base: String,
    pub namespaced: bool,
}

impl ResourceDescriptor {
    pub fn new(kind: impl Into<String>, api_base: impl Into<String>, namespaced: bool) -> Self {
        Self { kind: kind.into(), api_base: api_base.into(), namespaced }
    }
}

/// The three body shapes an API path can answer with.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// Object with `metadata` and no `items`.
    Single(Value),
    /// `{kind, apiVersion, items, metadata}` envelope, items already stamped.
    List { items: Vec<Value>, resource_version: Option<String> },
    /// Bare JSON array from a non-standard endpoint.
    Array(Vec<Value>),
}

/// Classify a response body and stamp `kind`/`apiVersion` where the wire leaves them out.
///
/// List items carry neither field, so each gets `kind` and the envelope's
/// `apiVersion`; fields an item already has are kept.
pub fn normalize_response(body: Value, kind: &str, api_version: &str) -> ApiResult<Normalized> {
    fn stamp(obj: &mut Map<String, Value>, kind: &str, api_version: &str) {
        obj.entry("kind").or_insert_with(|| Value::String(kind.to_string()));
        obj.entry("apiVersion").or_insert_with(|| Value::String(api_version.to_string()));
    }

    match body {
        Value::Object(mut obj) if obj.get("items").is_some_and(|i| !i.is_null()) && obj.contains_key("metadata") => {
            let list_version = obj.get("apiVersion").and_then(Value::as_str).unwrap_or(api_version).to_string();
            let resource_version = obj
                .get("metadata")
                .and_then(|m| m.get("resourceVersion"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let items = match obj.remove("items") {
                Some(Value::Array(items)) => items,
                Some(other) => return Err(ApiError::UnexpectedResponse(format!("items is not an array: {other}"))),
                None => Vec::new(),
            };
            let items = items
                .into_iter()
                .map(|mut item| {
                    if let Some(o) = item.as_object_mut() { stamp(o, kind, &list_version); }
                    item
                })
                .collect();
            Ok(Normalized::List { items, resource_version })
        }
        Value::Object(mut obj) if obj.contains_key("metadata") => {
            stamp(&mut obj, kind, api_version);
            Ok(Normalized::Single(Value::Object(obj)))
        }
        Value::Array(items) => Ok(Normalized::Array(items)),
        other => Err(ApiError::UnexpectedResponse(truncate(&other.to_string()))),
    }
}

fn truncate(s: &str) -> String {
    if s.len() <= 200 { return s.to_string(); }
    let mut end = 200;
    while !s.is_char_boundary(end) { end -= 1; }
    format!("{}…", &s[..end])
}

/// CRUD and URL building for one kind; `K` is the domain type items decode into.
///
/// Construction parses the descriptor's path once and registers the client, so
/// the registry can resolve it before the constructor returns.
pub struct ResourceApiClient<K> {
    kind: String,
    namespaced: bool,
    components: ApiPathComponents,
    transport: Arc<dyn Transport>,
    versions: ResourceVersionTracker,
    _object: PhantomData<fn() -> K>,
}

impl<K> ResourceApiClient<K>
where
    K: DeserializeOwned + 'static,
{
    pub fn new(descriptor: ResourceDescriptor, transport: Arc<dyn Transport>, registry: &ApiRegistry) -> ApiResult<Arc<Self>> {
        let mut components = parse(&descriptor.api_base)?;
        components.namespace = None;
        components.name = None;
        let api = Arc::new(Self {
            kind: descriptor.kind,
            namespaced: descriptor.namespaced,
            components,
            transport,
            versions: ResourceVersionTracker::new(),
            _object: PhantomData,
        });
        registry.register(api.components.api_base.clone(), api.clone());
        Ok(api)
    }

    async fn send(&self, method: Method, url: &str, body: Option<Value>) -> ApiResult<Value> {
        let t0 = Instant::now();
        let res = self.transport.request(method, url, body).await;
        let took_ms = t0.elapsed().as_secs_f64() * 1000.0;
        histogram!("kubelink_request_ms", took_ms, "method" => method.as_str());
        counter!("kubelink_requests_total", 1u64, "method" => method.as_str());
        match &res {
            Ok(_) => debug!(%method, url, took_ms, "api: request ok"),
            Err(e) => warn!(%method, url, error = %e, took_ms, "api: request failed"),
        }
        res
    }

    fn normalize(&self, body: Value) -> ApiResult<Normalized> {
        normalize_response(body, &self.kind, &self.components.api_version_with_group)
    }

    fn decode(raw: Value) -> ApiResult<K> { Ok(serde_json::from_value(raw)?) }

    fn expect_single(&self, body: Value) -> ApiResult<K> {
        match self.normalize(body)? {
            Normalized::Single(obj) => Self::decode(obj),
            Normalized::List { .. } | Normalized::Array(_) => {
                Err(ApiError::UnexpectedResponse(format!("expected a single {} object, got a list", self.kind)))
            }
        }
    }

    /// List the collection, across all namespaces when `namespace` is `None`.
    ///
    /// A list envelope moves both the requested namespace's cursor and the
    /// cluster-wide one, even for a namespaced list.
    pub async fn list(&self, namespace: Option<&str>, query: Option<&Query>) -> ApiResult<Vec<K>> {
        let url = self.get_url(&ObjectTarget::collection(namespace), query);
        let body = self.send(Method::Get, &url, None).await?;
        match self.normalize(body)? {
            Normalized::List { items, resource_version } => {
                if let Some(rv) = resource_version {
                    self.versions.set(namespace.unwrap_or(""), rv.clone());
                    self.versions.set("", rv);
                }
                items.into_iter().map(Self::decode).collect()
            }
            Normalized::Array(items) => items.into_iter().map(Self::decode).collect(),
            Normalized::Single(obj) => Ok(vec![Self::decode(obj)?]),
        }
    }

    pub async fn get(&self, target: &ObjectTarget<'_>, query: Option<&Query>) -> ApiResult<K> {
        let url = self.get_url(target, query);
        let body = self.send(Method::Get, &url, None).await?;
        self.expect_single(body)
    }

    /// POST to the collection. `data` is merged over `{kind, apiVersion, metadata: {name, namespace}}`.
    pub async fn create(&self, target: &ObjectTarget<'_>, data: Option<Value>) -> ApiResult<K> {
        let url = self.get_url(&ObjectTarget::collection(target.namespace), None);
        let mut metadata = Map::new();
        if let Some(name) = target.name { metadata.insert("name".into(), Value::String(name.to_string())); }
        if let Some(ns) = target.namespace { metadata.insert("namespace".into(), Value::String(ns.to_string())); }
        let mut body = json!({
            "kind": self.kind,
            "apiVersion": self.components.api_version_with_group,
            "metadata": metadata,
        });
        if let Some(data) = data {
            merge_json(&mut body, data);
        }
        let res = self.send(Method::Post, &url, Some(body)).await?;
        self.expect_single(res)
    }

    pub async fn update(&self, target: &ObjectTarget<'_>, data: Option<Value>) -> ApiResult<K> {
        let url = self.get_url(target, None);
        let res = self.send(Method::Put, &url, Some(data.unwrap_or_else(|| json!({})))).await?;
        self.expect_single(res)
    }

    /// DELETE the object; `params` go into the query (e.g. `propagationPolicy`).
    pub async fn delete(&self, target: &ObjectTarget<'_>, params: Option<&Query>) -> ApiResult<()> {
        let url = self.get_url(target, params);
        self.send(Method::Delete, &url, None).await?;
        Ok(())
    }

    /// Hand this client to `coordinator`; the returned disposer ends the stream.
    pub fn watch(self: &Arc<Self>, coordinator: &dyn WatchCoordinator, namespace: Option<&str>) -> Disposer {
        coordinator.subscribe(self.clone(), namespace.map(str::to_string))
    }
}

impl<K: 'static> ApiEndpoint for ResourceApiClient<K> {
    fn kind(&self) -> &str { &self.kind }

    fn components(&self) -> &ApiPathComponents { &self.components }

    fn is_namespaced(&self) -> bool { self.namespaced }

    fn versions(&self) -> &ResourceVersionTracker { &self.versions }

    fn transport(&self) -> Arc<dyn Transport> { Arc::clone(&self.transport) }
}

impl<K> std::fmt::Debug for ResourceApiClient<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceApiClient")
            .field("kind", &self.kind)
            .field("api_base", &self.components.api_base)
            .field("namespaced", &self.namespaced)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_object_gets_declared_kind() {
        let n = normalize_response(json!({ "metadata": { "name": "a" } }), "Pod", "v1").expect("ok");
        assert_eq!(n, Normalized::Single(json!({ "kind": "Pod", "apiVersion": "v1", "metadata": { "name": "a" } })));
    }

    #[test]
    fn null_items_is_a_single_object() {
        let n = normalize_response(json!({ "metadata": { "name": "a" }, "items": null }), "Pod", "v1").expect("ok");
        assert_eq!(
            n,
            Normalized::Single(json!({ "kind": "Pod", "apiVersion": "v1", "metadata": { "name": "a" }, "items": null }))
        );
    }

    #[test]
    fn list_items_inherit_envelope_version_but_keep_their_own() {
        let body = json!({
            "kind": "DeploymentList",
            "apiVersion": "apps/v1",
            "metadata": { "resourceVersion": "991" },
            "items": [
                { "metadata": { "name": "a" } },
                { "kind": "Deployment", "apiVersion": "apps/v1beta1", "metadata": { "name": "b" } }
            ]
        });
        match normalize_response(body, "Deployment", "apps/v1").expect("ok") {
            Normalized::List { items, resource_version } => {
                assert_eq!(resource_version.as_deref(), Some("991"));
                assert_eq!(items[0]["kind"], "Deployment");
                assert_eq!(items[0]["apiVersion"], "apps/v1");
                assert_eq!(items[1]["apiVersion"], "apps/v1beta1");
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn bare_arrays_pass_through() {
        let n = normalize_response(json!([{ "name": "x" }]), "Metric", "metrics/v1").expect("ok");
        assert_eq!(n, Normalized::Array(vec![json!({ "name": "x" })]));
    }

    #[test]
    fn other_shapes_are_rejected() {
        assert!(matches!(normalize_response(json!({ "status": "ok" }), "Pod", "v1"), Err(ApiError::UnexpectedResponse(_))));
        assert!(matches!(normalize_response(json!("text"), "Pod", "v1"), Err(ApiError::UnexpectedResponse(_))));
    }

    #[test]
    fn truncates_on_char_boundary() {
        let long = "é".repeat(150);
        let t = truncate(&long);
        assert!(t.ends_with('…'));
        assert!(t.len() <= 200 + '…'.len_utf8());
    }
}
