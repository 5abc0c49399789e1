use std::fmt;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

/// RFC 3986 unreserved characters stay as-is.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Ordered query parameters for list, get and watch requests.
///
/// Setting an existing key replaces its value in place, so the rendered order is
/// the order keys were first introduced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pairs: Vec<(String, String)>,
}

impl Query {
    pub fn new() -> Self { Self::default() }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.pairs.iter().position(|(k, _)| k == key)?;
        Some(self.pairs.remove(idx).1)
    }

    /// Apply every entry of `other` on top of this query.
    pub fn extend(&mut self, other: &Query) {
        for (k, v) in &other.pairs {
            self.set(k.clone(), v);
        }
    }

    pub fn is_empty(&self) -> bool { self.pairs.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn watch(self) -> Self { self.param("watch", 1) }

    pub fn resource_version(self, rv: impl Into<String>) -> Self { self.param("resourceVersion", rv.into()) }

    pub fn timeout_seconds(self, secs: u32) -> Self { self.param("timeoutSeconds", secs) }

    /// Page size. The API server rejects it together with `watch`.
    pub fn limit(self, n: u32) -> Self { self.param("limit", n) }

    pub fn continue_token(self, token: impl Into<String>) -> Self { self.param("continue", token.into()) }

    pub fn label_selector(self, selector: impl Into<String>) -> Self { self.param("labelSelector", selector.into()) }

    pub fn field_selector(self, selector: impl Into<String>) -> Self { self.param("fieldSelector", selector.into()) }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.pairs.iter().enumerate() {
            if i > 0 { f.write_str("&")?; }
            write!(f, "{}={}", utf8_percent_encode(k, QUERY_VALUE), utf8_percent_encode(v, QUERY_VALUE))?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Query {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut q = Query::new();
        for (k, v) in iter { q.set(k, v); }
        q
    }
}

/// Append `query` to `url` unless it is empty.
pub fn with_query(url: String, query: Option<&Query>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{url}?{q}"),
        _ => url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_in_insertion_order_and_replaces_in_place() {
        let q = Query::new().watch().resource_version("10").timeout_seconds(30).resource_version("12");
        assert_eq!(q.to_string(), "watch=1&resourceVersion=12&timeoutSeconds=30");
    }

    #[test]
    fn encodes_selectors() {
        let q = Query::new().label_selector("app=web,tier!=db");
        assert_eq!(q.to_string(), "labelSelector=app%3Dweb%2Ctier%21%3Ddb");
    }

    #[test]
    fn empty_query_leaves_url_alone() {
        assert_eq!(with_query("/api/v1/pods".into(), Some(&Query::new())), "/api/v1/pods");
        assert_eq!(with_query("/api/v1/pods".into(), None), "/api/v1/pods");
        assert_eq!(with_query("/api/v1/pods".into(), Some(&Query::new().limit(5))), "/api/v1/pods?limit=5");
    }

    #[test]
    fn extend_and_remove() {
        let mut base: Query = [("watch", "1"), ("limit", "10")].into_iter().collect();
        base.extend(&Query::new().param("watch", "0").continue_token("abc"));
        assert_eq!(base.get("watch"), Some("0"));
        assert_eq!(base.remove("limit").as_deref(), Some("10"));
        assert_eq!(base.get("limit"), None);
        assert_eq!(base.to_string(), "watch=0&continue=abc");
    }
}
