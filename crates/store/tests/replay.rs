#![forbid(unsafe_code)]

use std::sync::Arc;

use kubelink_kubehub::mock::MockTransport;
use kubelink_kubehub::{ApiEndpoint, ApiRegistry, ResourceApiClient, ResourceDescriptor, WatchEvent};
use kubelink_store::ObjectStore;
use serde_json::{json, Value};

fn uid(n: u8) -> String { format!("00000000-0000-0000-0000-{:012}", n) }

fn obj(n: u8, name: &str, ns: Option<&str>, rv: &str) -> Value {
    let mut meta = json!({ "name": name, "uid": uid(n), "resourceVersion": rv });
    if let Some(ns) = ns { meta["namespace"] = Value::String(ns.to_string()); }
    json!({ "metadata": meta })
}

fn store() -> (Arc<MockTransport>, ObjectStore) {
    let transport = Arc::new(MockTransport::new());
    let registry = ApiRegistry::new();
    let api = ResourceApiClient::<Value>::new(ResourceDescriptor::new("Pod", "/api/v1/pods", true), transport.clone(), &registry)
        .expect("client");
    (transport, ObjectStore::new(api))
}

#[test]
fn replay_basic_sequence() {
    let (_transport, mut store) = store();

    // add a/ns, duplicate add, add b, rename a -> a2, delete b
    let events = vec![
        WatchEvent::Added(obj(1, "a", Some("ns"), "10")),
        WatchEvent::Added(obj(1, "a", Some("ns"), "10")),
        WatchEvent::Added(obj(2, "b", Some("ns"), "11")),
        WatchEvent::Modified(obj(1, "a2", Some("ns"), "12")),
        WatchEvent::Deleted(obj(2, "b", Some("ns"), "13")),
    ];

    store.apply_batch(events[..2].iter().cloned().map(|e| (Some("ns".to_string()), e)).collect());
    let snap1 = store.freeze();
    assert_eq!(snap1.epoch, 1);
    assert_eq!(snap1.len(), 1);
    assert_eq!(snap1.items[0]["metadata"]["name"], "a");
    assert_eq!(store.api().versions().get("ns").as_deref(), Some("10"));

    store.apply_batch(events[2..].iter().cloned().map(|e| (Some("ns".to_string()), e)).collect());
    let snap2 = store.freeze();
    assert_eq!(snap2.epoch, 2);
    assert_eq!(snap2.len(), 1);
    assert!(snap2.get(Some("ns"), "a2").is_some());
    assert_eq!(store.api().versions().get("ns").as_deref(), Some("13"));
    // earlier snapshots are untouched
    assert_eq!(snap1.items[0]["metadata"]["name"], "a");
}

#[test]
fn bookmarks_and_errors_only_touch_the_cursor() {
    let (_transport, mut store) = store();
    store.apply(None, &WatchEvent::Added(obj(1, "a", Some("ns"), "5")));
    store.apply(None, &WatchEvent::Bookmark { resource_version: "99".into() });
    store.apply(None, &WatchEvent::Error { code: 500, message: "internal error".into() });

    assert_eq!(store.len(), 1);
    assert_eq!(store.api().versions().get("").as_deref(), Some("99"));
    assert_eq!(store.api().versions().get("ns"), None);
}

#[test]
fn gone_error_forgets_the_cursor_until_the_stream_closes() {
    let (_transport, mut store) = store();
    store.apply(Some("ns"), &WatchEvent::Added(obj(1, "a", Some("ns"), "5")));
    store.apply(Some("ns"), &WatchEvent::Error { code: 410, message: "too old resource version: 5 (90)".into() });

    assert!(store.is_lossy(Some("ns")));
    assert_eq!(store.api().versions().get("ns"), None);
    assert_eq!(store.api().get_watch_url(Some("ns"), None), "/api/v1/namespaces/ns/pods?watch=1");

    // Trailing events of the dead stream do not bring the stale cursor back.
    store.apply(Some("ns"), &WatchEvent::Bookmark { resource_version: "6".into() });
    assert_eq!(store.api().versions().get("ns"), None);

    store.stream_closed(Some("ns"));
    store.apply(Some("ns"), &WatchEvent::Added(obj(2, "b", Some("ns"), "91")));
    assert_eq!(store.api().versions().get("ns").as_deref(), Some("91"));
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn load_all_replaces_contents_and_sets_cursors() {
    let (transport, mut store) = store();
    store.apply(Some("ns"), &WatchEvent::Added(obj(9, "stale", Some("ns"), "1")));
    transport.respond(json!({
        "kind": "PodList",
        "apiVersion": "v1",
        "metadata": { "resourceVersion": "42" },
        "items": [
            obj(1, "b", Some("ns"), "40"),
            { "metadata": { "name": "a", "namespace": "ns", "uid": uid(2), "managedFields": [{ "manager": "kubectl" }] } }
        ]
    }));

    store.apply(Some("ns"), &WatchEvent::Error { code: 410, message: "gone".into() });
    let n = store.load_all(Some("ns")).await.expect("load");

    assert_eq!(n, 2);
    let snap = store.freeze();
    let names: Vec<&str> = snap.items.iter().filter_map(|o| o["metadata"]["name"].as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(snap.items[0]["kind"], "Pod");
    assert!(snap.items[0]["metadata"].get("managedFields").is_none());
    assert_eq!(store.api().versions().get("ns").as_deref(), Some("42"));
    assert_eq!(store.api().versions().get("").as_deref(), Some("42"));
    assert!(!store.is_lossy(Some("ns")));
}

#[tokio::test]
async fn load_all_failure_keeps_previous_contents() {
    let (transport, mut store) = store();
    store.apply(Some("ns"), &WatchEvent::Added(obj(1, "a", Some("ns"), "1")));
    transport.fail("connection refused");

    assert!(store.load_all(None).await.is_err());
    assert_eq!(store.len(), 1);
}
