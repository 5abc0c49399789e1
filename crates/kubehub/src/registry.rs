use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::endpoint::ApiEndpoint;

/// Table of known endpoints keyed by `api_base`.
///
/// One registry is shared by every client and resolver of an application; it is
/// passed around explicitly rather than living in a global. Lookups by predicate
/// scan in first-registration order.
#[derive(Default)]
pub struct ApiRegistry {
    entries: RwLock<Vec<(String, Arc<dyn ApiEndpoint>)>>,
}

impl ApiRegistry {
    pub fn new() -> Self { Self::default() }

    /// Store `api` under `api_base`, silently replacing an earlier entry (which keeps its slot).
    pub fn register(&self, api_base: impl Into<String>, api: Arc<dyn ApiEndpoint>) {
        let api_base = api_base.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.iter_mut().find(|(base, _)| *base == api_base) {
            Some(slot) => {
                debug!(api_base = %api_base, kind = %api.kind(), "registry: replaced");
                slot.1 = api;
            }
            None => {
                debug!(api_base = %api_base, kind = %api.kind(), "registry: registered");
                entries.push((api_base, api));
            }
        }
    }

    pub fn get_by_base(&self, api_base: &str) -> Option<Arc<dyn ApiEndpoint>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(base, _)| base == api_base)
            .map(|(_, api)| Arc::clone(api))
    }

    /// First endpoint matching `pred`.
    pub fn find(&self, pred: impl Fn(&dyn ApiEndpoint) -> bool) -> Option<Arc<dyn ApiEndpoint>> {
        // Scan a copy so predicates may consult the registry themselves.
        self.all().into_iter().find(|api| pred(api.as_ref()))
    }

    pub fn find_by_kind(&self, kind: &str) -> Option<Arc<dyn ApiEndpoint>> {
        self.find(|api| api.kind() == kind)
    }

    pub fn find_by_kind_and_version(&self, kind: &str, api_version: &str) -> Option<Arc<dyn ApiEndpoint>> {
        self.find(|api| api.kind() == kind && api.api_version_with_group() == api_version)
    }

    /// All endpoints in registration order.
    pub fn all(&self) -> Vec<Arc<dyn ApiEndpoint>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).iter().map(|(_, api)| Arc::clone(api)).collect()
    }

    pub fn len(&self) -> usize { self.entries.read().unwrap_or_else(PoisonError::into_inner).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Drop every entry (application reset).
    pub fn clear(&self) { self.entries.write().unwrap_or_else(PoisonError::into_inner).clear(); }
}

impl std::fmt::Debug for ApiRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_list().entries(entries.iter().map(|(base, api)| (base.as_str(), api.kind().to_string()))).finish()
    }
}
