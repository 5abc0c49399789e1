//! In-memory transport for tests: canned bodies, canned event streams, and a
//! record of every request made.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use futures::{stream, StreamExt};
use serde_json::Value;

use crate::transport::{EventStream, Method, Transport, WatchEvent};
use crate::{ApiError, ApiResult};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

struct CannedWatch {
    events: Vec<ApiResult<WatchEvent>>,
    hold_open: bool,
}

#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<Result<Value, String>>>,
    watches: Mutex<VecDeque<CannedWatch>>,
    requests: Mutex<Vec<RecordedRequest>>,
    watched: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self { Self::default() }

    /// Queue a body for the next request.
    pub fn respond(&self, body: Value) {
        self.responses.lock().unwrap_or_else(PoisonError::into_inner).push_back(Ok(body));
    }

    /// Queue a failure for the next request.
    pub fn fail(&self, message: impl Into<String>) {
        self.responses.lock().unwrap_or_else(PoisonError::into_inner).push_back(Err(message.into()));
    }

    /// Queue events for the next watch; the stream ends after the last one.
    pub fn push_watch(&self, events: Vec<WatchEvent>) {
        self.push_watch_results(events.into_iter().map(Ok).collect(), false);
    }

    /// Queue events for the next watch; the stream then stays open until dropped.
    pub fn push_watch_open(&self, events: Vec<WatchEvent>) {
        self.push_watch_results(events.into_iter().map(Ok).collect(), true);
    }

    pub fn push_watch_results(&self, events: Vec<ApiResult<WatchEvent>>, hold_open: bool) {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner).push_back(CannedWatch { events, hold_open });
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn watched_urls(&self) -> Vec<String> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn request(&self, method: Method, url: &str, body: Option<Value>) -> ApiResult<Value> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedRequest { method, url: url.to_string(), body });
        let canned = self.responses.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        match canned {
            Some(Ok(body)) => Ok(body),
            Some(Err(msg)) => Err(ApiError::Request(msg)),
            None => Err(ApiError::Request(format!("no canned response for {method} {url}"))),
        }
    }

    async fn watch(&self, url: &str) -> ApiResult<EventStream> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner).push(url.to_string());
        let canned = self.watches.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        let Some(CannedWatch { events, hold_open }) = canned else {
            return Err(ApiError::Request(format!("no canned watch for {url}")));
        };
        let events = stream::iter(events);
        Ok(if hold_open { events.chain(stream::pending()).boxed() } else { events.boxed() })
    }
}
