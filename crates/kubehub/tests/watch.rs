#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kubelink_kubehub::mock::MockTransport;
use kubelink_kubehub::{
    watch_all, ApiEndpoint, ApiRegistry, DisposeError, Disposer, ResourceApiClient, ResourceDescriptor, StreamWatchCoordinator,
    WatchCoordinator, WatchEvent, WatchMessage,
};
use serde_json::{json, Value};

/// Hands out disposers that record their api base; one of them panics.
struct ScriptedCoordinator {
    calls: Arc<Mutex<Vec<String>>>,
    fail_on: &'static str,
}

impl WatchCoordinator for ScriptedCoordinator {
    fn subscribe(&self, api: Arc<dyn ApiEndpoint>, _namespace: Option<String>) -> Disposer {
        let base = api.api_base().to_string();
        let calls = self.calls.clone();
        let fail = base == self.fail_on;
        Disposer::from_fn(move || {
            calls.lock().expect("calls").push(base.clone());
            if fail {
                panic!("teardown of {base} blew up");
            }
            Ok(())
        })
    }
}

fn pods(transport: Arc<MockTransport>, registry: &ApiRegistry) -> Arc<ResourceApiClient<Value>> {
    ResourceApiClient::new(ResourceDescriptor::new("Pod", "/api/v1/pods", true), transport, registry).expect("pods")
}

fn pod(name: &str, rv: &str) -> Value {
    json!({ "metadata": { "name": name, "namespace": "ns-a", "uid": format!("uid-{name}"), "resourceVersion": rv } })
}

#[test]
fn watch_all_disposes_every_subscription_once_even_if_one_fails() {
    let transport = Arc::new(MockTransport::new());
    let registry = ApiRegistry::new();
    let apis: Vec<Arc<dyn ApiEndpoint>> = [
        ("Pod", "/api/v1/pods"),
        ("Service", "/api/v1/services"),
        ("Deployment", "/apis/apps/v1/deployments"),
    ]
    .into_iter()
    .map(|(kind, base)| {
        let api: Arc<dyn ApiEndpoint> =
            ResourceApiClient::<Value>::new(ResourceDescriptor::new(kind, base, true), transport.clone(), &registry).expect("api");
        api
    })
    .collect();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let coordinator = ScriptedCoordinator { calls: calls.clone(), fail_on: "/api/v1/services" };
    let all = watch_all(&coordinator, &apis, None);

    let err = all.dispose().expect_err("one teardown failed");
    assert!(matches!(err, DisposeError::Aggregate { ref failures, total: 3 } if failures.len() == 1), "{err}");
    assert!(all.dispose().is_ok());
    assert_eq!(*calls.lock().expect("calls"), vec!["/api/v1/pods", "/api/v1/services", "/apis/apps/v1/deployments"]);
}

#[tokio::test]
async fn stream_coordinator_forwards_events_then_closes() {
    let transport = Arc::new(MockTransport::new());
    let registry = ApiRegistry::new();
    let api = pods(transport.clone(), &registry);
    transport.respond(json!({ "kind": "PodList", "apiVersion": "v1", "metadata": { "resourceVersion": "42" }, "items": [] }));
    api.list(Some("ns-a"), None).await.expect("list");
    transport.push_watch(vec![WatchEvent::Added(pod("a", "43")), WatchEvent::Deleted(pod("a", "44"))]);

    let (coordinator, mut rx) = StreamWatchCoordinator::channel(16);
    let coordinator = coordinator.with_timeout_seconds(300);
    let disposer = api.watch(&coordinator, Some("ns-a"));

    let first = rx.recv().await.expect("first");
    assert!(matches!(first, WatchMessage::Event { event: WatchEvent::Added(_), ref namespace, .. } if namespace.as_deref() == Some("ns-a")));
    let second = rx.recv().await.expect("second");
    assert!(matches!(second, WatchMessage::Event { event: WatchEvent::Deleted(_), .. }));
    let closed = rx.recv().await.expect("closed");
    assert_eq!(closed, WatchMessage::Closed { api_base: "/api/v1/pods".into(), namespace: Some("ns-a".into()), error: None });

    assert_eq!(transport.watched_urls(), vec!["/api/v1/namespaces/ns-a/pods?watch=1&resourceVersion=42&timeoutSeconds=300"]);
    assert!(disposer.dispose().is_ok());
    assert!(disposer.dispose().is_ok());
}

#[tokio::test]
async fn open_failure_is_reported_as_closed() {
    let transport = Arc::new(MockTransport::new());
    let registry = ApiRegistry::new();
    let api = pods(transport.clone(), &registry);

    let (coordinator, mut rx) = StreamWatchCoordinator::channel(4);
    let _disposer = api.watch(&coordinator, None);

    match rx.recv().await.expect("closed") {
        WatchMessage::Closed { error: Some(e), api_base, .. } => {
            assert_eq!(api_base, "/api/v1/pods");
            assert!(e.contains("no canned watch"), "{e}");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn dispose_stops_an_open_stream() {
    let transport = Arc::new(MockTransport::new());
    let registry = ApiRegistry::new();
    let api = pods(transport.clone(), &registry);
    transport.push_watch_open(vec![WatchEvent::Modified(pod("a", "7"))]);

    let (coordinator, mut rx) = StreamWatchCoordinator::channel(4);
    let disposer = api.watch(&coordinator, Some("ns-a"));
    assert!(matches!(rx.recv().await, Some(WatchMessage::Event { .. })));

    disposer.dispose().expect("dispose");
    drop(coordinator);

    // Aborted task drops its sender without a Closed message.
    let next = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.expect("channel closes");
    assert_eq!(next, None);
}

#[tokio::test]
async fn watch_all_with_stream_coordinator() {
    let transport = Arc::new(MockTransport::new());
    let registry = ApiRegistry::new();
    let pods = pods(transport.clone(), &registry);
    let nodes: Arc<dyn ApiEndpoint> =
        ResourceApiClient::<Value>::new(ResourceDescriptor::new("Node", "/api/v1/nodes", false), transport.clone(), &registry).expect("nodes");
    transport.push_watch_open(vec![]);
    transport.push_watch_open(vec![]);

    let (coordinator, mut rx) = StreamWatchCoordinator::channel(4);
    let all = watch_all(&coordinator, &[pods as Arc<dyn ApiEndpoint>, nodes], None);

    for _ in 0..50 {
        if transport.watched_urls().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let mut urls = transport.watched_urls();
    urls.sort();
    assert_eq!(urls, vec!["/api/v1/nodes?watch=1", "/api/v1/pods?watch=1"]);
    assert!(all.dispose().is_ok());
    drop(coordinator);
    let next = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.expect("channel closes");
    assert_eq!(next, None);
}
