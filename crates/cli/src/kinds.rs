//! Built-in kinds and resolution of a command-line target to a client.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use kubelink_core::parse;
use kubelink_kubehub::{ApiEndpoint, ApiRegistry, ResourceApiClient, ResourceDescriptor, Transport};
use serde_json::Value;
use tracing::debug;

/// `(kind, api_base, namespaced)` registered at startup.
const BUILTIN: &[(&str, &str, bool)] = &[
    ("Namespace", "/api/v1/namespaces", false),
    ("Node", "/api/v1/nodes", false),
    ("PersistentVolume", "/api/v1/persistentvolumes", false),
    ("Pod", "/api/v1/pods", true),
    ("Service", "/api/v1/services", true),
    ("Endpoints", "/api/v1/endpoints", true),
    ("ConfigMap", "/api/v1/configmaps", true),
    ("Secret", "/api/v1/secrets", true),
    ("ServiceAccount", "/api/v1/serviceaccounts", true),
    ("PersistentVolumeClaim", "/api/v1/persistentvolumeclaims", true),
    ("Event", "/api/v1/events", true),
    ("Deployment", "/apis/apps/v1/deployments", true),
    ("StatefulSet", "/apis/apps/v1/statefulsets", true),
    ("DaemonSet", "/apis/apps/v1/daemonsets", true),
    ("ReplicaSet", "/apis/apps/v1/replicasets", true),
    ("Job", "/apis/batch/v1/jobs", true),
    ("CronJob", "/apis/batch/v1/cronjobs", true),
    ("Ingress", "/apis/networking.k8s.io/v1/ingresses", true),
    ("NetworkPolicy", "/apis/networking.k8s.io/v1/networkpolicies", true),
    ("HorizontalPodAutoscaler", "/apis/autoscaling/v2/horizontalpodautoscalers", true),
    ("CustomResourceDefinition", "/apis/apiextensions.k8s.io/v1/customresourcedefinitions", false),
];

/// Registry plus the typed clients behind it.
pub struct Catalog {
    pub registry: ApiRegistry,
    transport: Arc<dyn Transport>,
    clients: Vec<Arc<ResourceApiClient<Value>>>,
}

impl Catalog {
    pub fn builtin(transport: Arc<dyn Transport>) -> Result<Self> {
        let mut catalog = Self { registry: ApiRegistry::new(), transport, clients: Vec::new() };
        for (kind, base, namespaced) in BUILTIN {
            catalog.add(ResourceDescriptor::new(*kind, *base, *namespaced))?;
        }
        debug!(kinds = catalog.clients.len(), "catalog: builtin kinds registered");
        Ok(catalog)
    }

    pub fn add(&mut self, descriptor: ResourceDescriptor) -> Result<Arc<ResourceApiClient<Value>>> {
        let api = ResourceApiClient::new(descriptor, Arc::clone(&self.transport), &self.registry)?;
        self.clients.retain(|c| c.api_base() != api.api_base());
        self.clients.push(Arc::clone(&api));
        Ok(api)
    }

    /// Resolve a kind (`Deployment`), a resource (`deployments`) or an API path.
    ///
    /// An unknown path is registered on the fly; its kind is taken from `kind`
    /// or else from the resource segment.
    pub fn resolve(&mut self, target: &str, kind: Option<&str>, cluster_scoped: bool) -> Result<Arc<ResourceApiClient<Value>>> {
        if target.starts_with('/') {
            let components = parse(target)?;
            if let Some(api) = self.clients.iter().find(|c| c.api_base() == components.api_base) {
                return Ok(Arc::clone(api));
            }
            let kind = kind.map(str::to_string).unwrap_or_else(|| components.resource.clone());
            return self.add(ResourceDescriptor::new(kind, components.api_base, !cluster_scoped));
        }
        self.clients
            .iter()
            .find(|c| c.kind().eq_ignore_ascii_case(target) || c.components().resource == target)
            .cloned()
            .ok_or_else(|| anyhow!("unknown kind {target:?}; pass an API path such as /apis/<group>/<version>/<resource>"))
    }
}
