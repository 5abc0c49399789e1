//! Watch coordination boundary and cancellation handles.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use kubelink_core::Query;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::endpoint::ApiEndpoint;
use crate::transport::WatchEvent;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DisposeError {
    #[error("disposer failed: {0}")]
    Failed(String),
    #[error("disposer panicked: {0}")]
    Panicked(String),
    #[error("{} of {total} disposers failed", .failures.len())]
    Aggregate { failures: Vec<DisposeError>, total: usize },
}

type DisposeFn = Box<dyn FnOnce() -> Result<(), DisposeError> + Send>;

/// Zero-argument cancellation handle. Only the first `dispose` runs the teardown.
#[derive(Clone)]
pub struct Disposer {
    inner: Arc<Mutex<Option<DisposeFn>>>,
}

impl Disposer {
    pub fn from_fn(f: impl FnOnce() -> Result<(), DisposeError> + Send + 'static) -> Self {
        Self { inner: Arc::new(Mutex::new(Some(Box::new(f)))) }
    }

    pub fn noop() -> Self { Self { inner: Arc::new(Mutex::new(None)) } }

    /// Abort `task` on dispose; aborting a finished task is harmless.
    pub fn from_task(task: tokio::task::JoinHandle<()>) -> Self {
        Self::from_fn(move || {
            task.abort();
            Ok(())
        })
    }

    /// Combine several disposers; every one of them runs even if others fail or panic.
    pub fn merge(disposers: Vec<Disposer>) -> Self {
        Self::from_fn(move || {
            let total = disposers.len();
            let failures: Vec<DisposeError> = disposers.iter().filter_map(|d| d.dispose().err()).collect();
            for e in &failures {
                warn!(error = %e, "watch: disposer failed");
            }
            if failures.is_empty() { Ok(()) } else { Err(DisposeError::Aggregate { failures, total }) }
        })
    }

    pub fn dispose(&self) -> Result<(), DisposeError> {
        let teardown = self.inner.lock().unwrap_or_else(PoisonError::into_inner).take();
        match teardown {
            Some(f) => catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(DisposeError::Panicked(panic_message(payload)))),
            None => Ok(()),
        }
    }

    pub fn is_disposed(&self) -> bool { self.inner.lock().unwrap_or_else(PoisonError::into_inner).is_none() }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer").field("disposed", &self.is_disposed()).finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => payload.downcast_ref::<&str>().map(|s| s.to_string()).unwrap_or_else(|| "unknown panic".into()),
    }
}

/// Turns a client into a live subscription.
///
/// Whoever consumes the events is expected to advance the endpoint's cursor for
/// the namespace as events arrive, so a later subscription resumes instead of
/// replaying.
pub trait WatchCoordinator: Send + Sync {
    fn subscribe(&self, api: Arc<dyn ApiEndpoint>, namespace: Option<String>) -> Disposer;
}

/// Subscribe every endpoint and return one disposer for all of them.
pub fn watch_all(coordinator: &dyn WatchCoordinator, apis: &[Arc<dyn ApiEndpoint>], namespace: Option<&str>) -> Disposer {
    Disposer::merge(
        apis.iter()
            .map(|api| coordinator.subscribe(Arc::clone(api), namespace.map(str::to_string)))
            .collect(),
    )
}

/// What a [`StreamWatchCoordinator`] delivers to its consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchMessage {
    Event { api_base: String, namespace: Option<String>, event: WatchEvent },
    /// Stream ended or failed; reconnecting is up to the consumer.
    Closed { api_base: String, namespace: Option<String>, error: Option<String> },
}

impl WatchMessage {
    pub fn api_base(&self) -> &str {
        match self {
            WatchMessage::Event { api_base, .. } | WatchMessage::Closed { api_base, .. } => api_base,
        }
    }
}

/// Coordinator that opens the transport's event stream on a tokio task per
/// subscription and forwards everything into one channel.
///
/// Disposing aborts the task. Messages already sitting in the channel are still
/// delivered.
#[derive(Clone)]
pub struct StreamWatchCoordinator {
    tx: mpsc::Sender<WatchMessage>,
    timeout_seconds: Option<u32>,
}

impl StreamWatchCoordinator {
    pub fn new(tx: mpsc::Sender<WatchMessage>) -> Self { Self { tx, timeout_seconds: None } }

    pub fn channel(cap: usize) -> (Self, mpsc::Receiver<WatchMessage>) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        (Self::new(tx), rx)
    }

    /// Ask the server to end each stream after `secs`.
    pub fn with_timeout_seconds(mut self, secs: u32) -> Self {
        self.timeout_seconds = Some(secs);
        self
    }
}

impl WatchCoordinator for StreamWatchCoordinator {
    fn subscribe(&self, api: Arc<dyn ApiEndpoint>, namespace: Option<String>) -> Disposer {
        let query = self.timeout_seconds.map(|s| Query::new().timeout_seconds(s));
        let url = api.get_watch_url(namespace.as_deref(), query.as_ref());
        let api_base = api.api_base().to_string();
        let transport = api.transport();
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            info!(api_base = %api_base, url = %url, "watch: stream opening");
            let error = match transport.watch(&url).await {
                Ok(mut stream) => loop {
                    match stream.next().await {
                        Some(Ok(event)) => {
                            counter!("kubelink_watch_events_total", 1u64);
                            let msg = WatchMessage::Event { api_base: api_base.clone(), namespace: namespace.clone(), event };
                            if tx.send(msg).await.is_err() {
                                break None;
                            }
                        }
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break None,
                    }
                },
                Err(e) => Some(e.to_string()),
            };
            match &error {
                Some(e) => warn!(api_base = %api_base, error = %e, "watch: stream failed"),
                None => info!(api_base = %api_base, "watch: stream ended"),
            }
            let _ = tx.send(WatchMessage::Closed { api_base, namespace, error }).await;
        });
        Disposer::from_task(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispose_runs_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let d = Disposer::from_fn(move || {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let twin = d.clone();
        assert!(d.dispose().is_ok());
        assert!(twin.dispose().is_ok());
        assert!(d.dispose().is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(twin.is_disposed());
    }

    #[test]
    fn panics_become_errors() {
        let d = Disposer::from_fn(|| panic!("socket already closed"));
        assert_eq!(d.dispose(), Err(DisposeError::Panicked("socket already closed".into())));
        assert_eq!(d.dispose(), Ok(()));
    }

    #[test]
    fn merged_disposer_isolates_failures() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counting = |hits: &Arc<AtomicUsize>| {
            let h = hits.clone();
            Disposer::from_fn(move || {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let all = Disposer::merge(vec![
            counting(&hits),
            Disposer::from_fn(|| Err(DisposeError::Failed("boom".into()))),
            Disposer::from_fn(|| panic!("kaboom")),
            counting(&hits),
        ]);
        match all.dispose() {
            Err(DisposeError::Aggregate { failures, total }) => {
                assert_eq!(total, 4);
                assert_eq!(failures.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(all.dispose(), Ok(()));
    }
}
