use k8s_openapi::api::core::v1::ObjectReference as CoreObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};

/// Bare pointer to a resource that may or may not have a registered client:
/// an owner reference, an event's `involvedObject`, a scale target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ObjectReference {
    pub fn new(kind: impl Into<String>, api_version: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), api_version: api_version.into(), name: name.into(), namespace: None }
    }

    pub fn in_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    /// Owner references never carry a namespace; owners live next to their dependents.
    pub fn from_owner(owner: &OwnerReference) -> Self {
        Self::new(owner.kind.clone(), owner.api_version.clone(), owner.name.clone())
    }

    /// `metadata.ownerReferences` of a raw object.
    pub fn owners_of(obj: &serde_json::Value) -> Vec<Self> {
        obj.get("metadata")
            .and_then(|m| m.get("ownerReferences"))
            .and_then(|v| v.as_array())
            .map(|refs| refs.iter().filter_map(|r| serde_json::from_value(r.clone()).ok()).collect())
            .unwrap_or_default()
    }

    /// `involvedObject` of a raw core/v1 Event.
    pub fn involved_object(event: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(event.get("involvedObject")?.clone()).ok()
    }
}

impl From<&CoreObjectReference> for ObjectReference {
    fn from(r: &CoreObjectReference) -> Self {
        Self {
            kind: r.kind.clone().unwrap_or_default(),
            api_version: r.api_version.clone().unwrap_or_default(),
            name: r.name.clone().unwrap_or_default(),
            namespace: r.namespace.clone(),
        }
    }
}
