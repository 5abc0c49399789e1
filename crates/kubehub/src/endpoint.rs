use std::sync::Arc;

use kubelink_core::{build, with_query, ApiPathComponents, PathRef, Query};

use crate::{transport::Transport, versions::ResourceVersionTracker};

/// Name and namespace addressing one object, or a collection when `name` is `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectTarget<'a> {
    pub name: Option<&'a str>,
    pub namespace: Option<&'a str>,
}

impl<'a> ObjectTarget<'a> {
    pub fn collection(namespace: Option<&'a str>) -> Self { Self { name: None, namespace } }

    pub fn named(name: &'a str) -> Self { Self { name: Some(name), namespace: None } }

    pub fn in_namespace(mut self, namespace: &'a str) -> Self {
        self.namespace = Some(namespace);
        self
    }
}

/// Kind-independent view of a registered client.
///
/// This is what the registry stores and what link resolution and watch
/// coordination work with; URL building lives here so every endpoint agrees on it.
pub trait ApiEndpoint: Send + Sync {
    fn kind(&self) -> &str;

    /// Components parsed once at construction, without namespace or name.
    fn components(&self) -> &ApiPathComponents;

    fn is_namespaced(&self) -> bool;

    fn versions(&self) -> &ResourceVersionTracker;

    fn transport(&self) -> Arc<dyn Transport>;

    fn api_base(&self) -> &str { &self.components().api_base }

    fn api_version_with_group(&self) -> &str { &self.components().api_version_with_group }

    /// Object or collection URL. The namespace is dropped for cluster-scoped kinds.
    fn get_url(&self, target: &ObjectTarget<'_>, query: Option<&Query>) -> String {
        let c = self.components();
        let namespace = if self.is_namespaced() { target.namespace } else { None };
        let url = build(&PathRef {
            api_prefix: Some(c.api_prefix.as_str()),
            api_version: &c.api_version_with_group,
            resource: &c.resource,
            namespace,
            name: target.name,
        });
        with_query(url, query)
    }

    /// Collection URL with `watch=1`, resuming from the namespace's cursor when one is known.
    ///
    /// Caller query entries override the cursor; `watch` is always forced on and
    /// pagination parameters are dropped since the server rejects them on watches.
    fn get_watch_url(&self, namespace: Option<&str>, query: Option<&Query>) -> String {
        let mut q = Query::new().watch();
        if let Some(rv) = self.versions().get(namespace.unwrap_or("")) {
            q.set("resourceVersion", rv);
        }
        if let Some(extra) = query {
            q.extend(extra);
        }
        q.set("watch", 1);
        q.remove("limit");
        q.remove("continue");
        self.get_url(&ObjectTarget::collection(namespace), Some(&q))
    }
}
