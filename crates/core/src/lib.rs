//! kubelink core: Kubernetes REST path grammar and the small value types shared by
//! the client, the registry and the object store.

#![forbid(unsafe_code)]

pub mod path;
pub mod query;
pub mod reference;

pub use path::{build, parse, ApiPathComponents, PathError, PathRef};
pub use query::{with_query, Query};
pub use reference::ObjectReference;

pub mod prelude {
    pub use super::{build, merge_json, parse, with_query, ApiPathComponents, ObjectReference, PathError, PathRef, Query};
}

/// Deep-merge `overlay` into `base`.
///
/// Objects merge key by key; any other overlay value replaces what `base` held.
pub fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    use serde_json::Value;
    match (base, overlay) {
        (Value::Object(dst), Value::Object(src)) => {
            for (k, v) in src {
                match dst.get_mut(&k) {
                    Some(slot) => merge_json(slot, v),
                    None => { dst.insert(k, v); }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}
