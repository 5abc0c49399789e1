use std::sync::{PoisonError, RwLock};

use rustc_hash::FxHashMap;
use tracing::debug;

/// Last seen `resourceVersion` per namespace for one kind; `""` is the cluster-wide key.
///
/// Writes are last-write-wins. A stale cursor only makes the next watch replay a
/// little more history.
#[derive(Debug, Default)]
pub struct ResourceVersionTracker {
    cursors: RwLock<FxHashMap<String, String>>,
}

impl ResourceVersionTracker {
    pub fn new() -> Self { Self::default() }

    pub fn set(&self, namespace: &str, version: impl Into<String>) {
        let version = version.into();
        debug!(ns = %namespace, rv = %version, "cursor advanced");
        self.cursors.write().unwrap_or_else(PoisonError::into_inner).insert(namespace.to_string(), version);
    }

    pub fn get(&self, namespace: &str) -> Option<String> {
        self.cursors.read().unwrap_or_else(PoisonError::into_inner).get(namespace).cloned()
    }

    /// Drop one namespace's cursor so the next watch there starts without a resourceVersion.
    pub fn forget(&self, namespace: &str) -> Option<String> {
        let old = self.cursors.write().unwrap_or_else(PoisonError::into_inner).remove(namespace);
        if old.is_some() {
            debug!(ns = %namespace, "cursor forgotten");
        }
        old
    }

    /// Forget every cursor (full state reset).
    pub fn clear(&self) { self.cursors.write().unwrap_or_else(PoisonError::into_inner).clear(); }

    pub fn len(&self) -> usize { self.cursors.read().unwrap_or_else(PoisonError::into_inner).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Sorted copy of all cursors.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let mut out: Vec<_> = self
            .cursors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort();
        out
    }
}
