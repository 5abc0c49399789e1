//! Resolve bare object references to navigable API URLs.

use kubelink_core::{build, parse, ObjectReference, PathRef};
use tracing::debug;

use crate::endpoint::{ApiEndpoint, ObjectTarget};
use crate::registry::ApiRegistry;

/// Resource name guessed from a kind: lowercase plus `"s"`.
///
/// Kinds already ending in `s` still only get `"s"` (`Ingress` -> `ingresss`).
pub fn guess_resource(kind: &str) -> String {
    format!("{}s", kind.to_lowercase())
}

/// Best-effort URL for `reference`; never fails.
///
/// Resolution order: registered kind + apiVersion, a registered base matching the
/// guessed resource under `/apis` then `/api`, any registered endpoint of the same
/// kind, and finally an unconfirmed link built from the raw fields.
/// `referencing_namespace` fills in when the reference has no namespace.
pub fn lookup_api_link(registry: &ApiRegistry, reference: &ObjectReference, referencing_namespace: Option<&str>) -> String {
    let ObjectReference { kind, api_version, name, .. } = reference;
    let namespace = reference.namespace.as_deref().or(referencing_namespace);
    let target = ObjectTarget { name: Some(name.as_str()), namespace };

    if let Some(api) = registry.find_by_kind_and_version(kind, api_version) {
        return api.get_url(&target, None);
    }

    let resource = guess_resource(kind);
    for prefix in ["/apis", "/api"] {
        let link = build(&PathRef {
            api_prefix: Some(prefix),
            api_version,
            resource: &resource,
            namespace,
            name: Some(name.as_str()),
        });
        let registered = parse(&link).map(|c| registry.get_by_base(&c.api_base).is_some()).unwrap_or(false);
        if registered {
            return link;
        }
    }

    if let Some(api) = registry.find_by_kind(kind) {
        debug!(kind = %kind, api_version = %api_version, resolved = %api.api_version_with_group(), "link: matched by kind only");
        return api.get_url(&target, None);
    }

    debug!(kind = %kind, api_version = %api_version, "link: no registered endpoint, guessing");
    build(&PathRef { api_prefix: None, api_version, resource: &resource, namespace, name: Some(name.as_str()) })
}

/// [`lookup_api_link`] with the namespace taken from a raw referencing object.
pub fn lookup_api_link_from(registry: &ApiRegistry, reference: &ObjectReference, referencing: &serde_json::Value) -> String {
    let ns = referencing.get("metadata").and_then(|m| m.get("namespace")).and_then(|v| v.as_str());
    lookup_api_link(registry, reference, ns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pluralization_always_appends_s() {
        assert_eq!(guess_resource("Pod"), "pods");
        assert_eq!(guess_resource("NetworkPolicy"), "networkpolicys");
        assert_eq!(guess_resource("Ingress"), "ingresss");
    }

    #[test]
    fn empty_registry_yields_generic_link() {
        let registry = ApiRegistry::new();
        let r = ObjectReference::new("Widget", "toys.example.com/v1", "w1");
        assert_eq!(lookup_api_link(&registry, &r, Some("play")), "/apis/toys.example.com/v1/namespaces/play/widgets/w1");
        assert_eq!(lookup_api_link(&registry, &ObjectReference::default(), None), "/apis/s");
    }
}
