//! Kubernetes API path grammar.
//!
//! ```text
//! {prefix}/{group}/{version}/namespaces/{namespace}/{resource}/{name}
//! {prefix}/{version}/{resource}/{name}
//! {prefix}/{group}/{version}/{resource}/{name}
//! ```
//!
//! Cluster-scoped paths carry no marker telling group, version and resource apart,
//! so `parse` guesses from the shape of the first two segments.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^v[0-9]").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("malformed api path {path:?}: api base is empty")]
    Malformed { path: String },
}

/// Structured view of a REST path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPathComponents {
    /// Collection path without namespace or name, e.g. `/apis/apps/v1/deployments`.
    pub api_base: String,
    /// `/api` or `/apis`
    pub api_prefix: String,
    /// Empty for the core group.
    pub api_group: String,
    pub api_version: String,
    /// `group/version`, or just `version` for the core group.
    pub api_version_with_group: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Input for [`build`]. `api_version` is the version with its group, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathRef<'a> {
    /// Defaults to `/apis`.
    pub api_prefix: Option<&'a str>,
    pub api_version: &'a str,
    pub resource: &'a str,
    pub namespace: Option<&'a str>,
    pub name: Option<&'a str>,
}

fn join_present<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts.into_iter().filter(|p| !p.is_empty()).collect::<Vec<_>>().join("/")
}

/// Split a REST path into its components.
pub fn parse(path: &str) -> Result<ApiPathComponents, PathError> {
    let bare = path.split('?').next().unwrap_or("");
    let mut segments = bare.split('/').filter(|s| !s.is_empty());
    let api_prefix = segments.next().map(|p| format!("/{p}")).unwrap_or_default();
    let rest: Vec<&str> = segments.collect();

    let mut api_group = String::new();
    let mut api_version = "";
    let mut resource = "";
    let mut namespace: Option<&str> = None;
    let mut name: Option<&str> = None;

    match rest.iter().position(|s| *s == "namespaces") {
        Some(idx) => {
            let (left, right) = (&rest[..idx], &rest[idx + 1..]);
            match right {
                [] => resource = "namespaces",
                [only] => resource = *only,
                [ns, res, tail @ ..] => {
                    namespace = Some(*ns);
                    resource = *res;
                    name = tail.first().copied();
                }
            }
            if let Some((version, group)) = left.split_last() {
                api_version = *version;
                api_group = group.join("/");
            }
        }
        None => match rest.as_slice() {
            [] => {}
            [version] => api_version = *version,
            [version, res] => {
                api_version = *version;
                resource = *res;
            }
            [first, second, tail @ ..] => {
                if first.contains('.') || VERSION_RE.is_match(second) {
                    api_group = (*first).to_string();
                    api_version = *second;
                    resource = tail[0];
                    name = tail.get(1).copied();
                } else {
                    api_version = *first;
                    resource = *second;
                    name = tail.first().copied();
                }
            }
        },
    }

    let api_base = join_present([api_prefix.as_str(), api_group.as_str(), api_version, resource]);
    if api_base.is_empty() {
        return Err(PathError::Malformed { path: path.to_string() });
    }
    Ok(ApiPathComponents {
        api_version_with_group: join_present([api_group.as_str(), api_version]),
        api_base,
        api_prefix,
        api_group,
        api_version: api_version.to_string(),
        resource: resource.to_string(),
        namespace: namespace.map(str::to_string),
        name: name.map(str::to_string),
    })
}

/// Inverse of [`parse`]; absent or empty parts are left out.
pub fn build(r: &PathRef<'_>) -> String {
    let ns_segment = r.namespace.filter(|ns| !ns.is_empty()).map(|ns| format!("namespaces/{ns}"));
    join_present([
        r.api_prefix.unwrap_or("/apis"),
        r.api_version,
        ns_segment.as_deref().unwrap_or(""),
        r.resource,
        r.name.unwrap_or(""),
    ])
}

impl ApiPathComponents {
    /// Borrow these components as a [`PathRef`] for `build`.
    pub fn as_path_ref(&self) -> PathRef<'_> {
        PathRef {
            api_prefix: Some(self.api_prefix.as_str()),
            api_version: &self.api_version_with_group,
            resource: &self.resource,
            namespace: self.namespace.as_deref(),
            name: self.name.as_deref(),
        }
    }
}
