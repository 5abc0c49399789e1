//! kubelink kubehub: per-kind API clients, the endpoint registry, link resolution
//! and watch wiring on top of a pluggable transport.

#![forbid(unsafe_code)]

pub mod client;
pub mod endpoint;
pub mod link;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod registry;
pub mod transport;
pub mod versions;
pub mod watch;

pub use client::{normalize_response, Normalized, ResourceApiClient, ResourceDescriptor};
pub use endpoint::{ApiEndpoint, ObjectTarget};
pub use link::{guess_resource, lookup_api_link, lookup_api_link_from};
pub use registry::ApiRegistry;
pub use transport::{EventStream, KubeTransport, Method, Transport, WatchEvent};
pub use versions::ResourceVersionTracker;
pub use watch::{watch_all, DisposeError, Disposer, StreamWatchCoordinator, WatchCoordinator, WatchMessage};

pub mod prelude {
    pub use super::{
        lookup_api_link, watch_all, ApiEndpoint, ApiError, ApiRegistry, ApiResult, Disposer, ObjectTarget,
        ResourceApiClient, ResourceDescriptor, Transport, WatchCoordinator, WatchEvent,
    };
}

/// Errors surfaced by clients and transports. Nothing here is retried.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Path(#[from] kubelink_core::PathError),
    #[error("kube: {0}")]
    Kube(#[from] kube::Error),
    #[error("request: {0}")]
    Request(String),
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

pub type ApiResult<T> = Result<T, ApiError>;
