//! Caller-side object store: applies watch events for one kind, advances the
//! kind's resource-version cursor, and publishes immutable snapshots.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use kubelink_kubehub::{ApiEndpoint, ApiResult, ResourceApiClient, WatchEvent, WatchMessage};
use metrics::histogram;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Status code the API server sends when a watch asks for a compacted resourceVersion.
pub const GONE: u16 = 410;

/// Coalescer capacity used by [`spawn_sync`].
pub const DEFAULT_QUEUE_CAP: usize = 2048;

/// Identity of a stored object.
///
/// `metadata.uid` when present (as a UUID when it parses as one), otherwise
/// `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKey {
    Uid(Uuid),
    OpaqueUid(String),
    Name { namespace: String, name: String },
}

impl ObjectKey {
    pub fn of(obj: &Value) -> Option<Self> {
        let meta = obj.get("metadata")?;
        if let Some(uid) = meta.get("uid").and_then(Value::as_str).filter(|s| !s.is_empty()) {
            return Some(match Uuid::parse_str(uid) {
                Ok(u) => ObjectKey::Uid(u),
                Err(_) => ObjectKey::OpaqueUid(uid.to_string()),
            });
        }
        let name = meta.get("name").and_then(Value::as_str)?;
        let namespace = meta.get("namespace").and_then(Value::as_str).unwrap_or("");
        Some(ObjectKey::Name { namespace: namespace.to_string(), name: name.to_string() })
    }
}

/// Immutable view of the store at one epoch, items ordered by namespace then name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub epoch: u64,
    pub items: Vec<Value>,
}

impl Snapshot {
    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<&Value> {
        self.items.iter().find(|o| meta_str(o, "name") == Some(name) && meta_str(o, "namespace") == namespace)
    }
}

fn meta_str<'a>(obj: &'a Value, field: &str) -> Option<&'a str> {
    obj.get("metadata").and_then(|m| m.get(field)).and_then(Value::as_str)
}

fn strip_managed_fields(obj: &mut Value) {
    if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("managedFields");
    }
}

/// In-memory copy of one kind's objects.
///
/// A namespace whose stream lost events (coalescer overflow or a 410) is held
/// lossy: its cursor is forgotten and stays unset until the stream closes or a
/// fresh list arrives, so the next watch replays current state.
pub struct ObjectStore {
    api: Arc<ResourceApiClient<Value>>,
    items: FxHashMap<ObjectKey, Value>,
    lossy: FxHashSet<String>,
    epoch: u64,
}

impl ObjectStore {
    pub fn new(api: Arc<ResourceApiClient<Value>>) -> Self {
        Self { api, items: FxHashMap::default(), lossy: FxHashSet::default(), epoch: 0 }
    }

    pub fn api(&self) -> &Arc<ResourceApiClient<Value>> { &self.api }

    pub fn epoch(&self) -> u64 { self.epoch }

    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Replace the contents with a fresh list; the list itself moves the cursor.
    pub async fn load_all(&mut self, namespace: Option<&str>) -> ApiResult<usize> {
        let t0 = Instant::now();
        let listed = self.api.list(namespace, None).await?;
        self.items.clear();
        match namespace {
            Some(ns) => {
                self.lossy.remove(ns);
            }
            None => self.lossy.clear(),
        }
        for mut obj in listed {
            strip_managed_fields(&mut obj);
            match ObjectKey::of(&obj) {
                Some(key) => {
                    self.items.insert(key, obj);
                }
                None => debug!(kind = %self.api.kind(), "store: skipping listed object without identity"),
            }
        }
        self.epoch = self.epoch.saturating_add(1);
        info!(kind = %self.api.kind(), namespace = ?namespace, items = self.items.len(), took_ms = %t0.elapsed().as_millis(), "store: load_all done");
        Ok(self.items.len())
    }

    /// Apply one event observed for `namespace` (`None` for a cluster-wide watch).
    ///
    /// Any event carrying a resourceVersion advances that namespace's cursor.
    pub fn apply(&mut self, namespace: Option<&str>, event: &WatchEvent) {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => match ObjectKey::of(obj) {
                Some(key) => {
                    let mut obj = obj.clone();
                    strip_managed_fields(&mut obj);
                    self.items.insert(key, obj);
                }
                None => debug!(kind = %self.api.kind(), "store: event object without identity"),
            },
            WatchEvent::Deleted(obj) => {
                if let Some(key) = ObjectKey::of(obj) {
                    self.items.remove(&key);
                }
            }
            WatchEvent::Bookmark { .. } => {}
            WatchEvent::Error { code, message } => {
                warn!(kind = %self.api.kind(), code, message = %message, "store: watch error event");
                if *code == GONE {
                    self.mark_lossy(namespace.unwrap_or(""));
                }
            }
        }
        if let Some(rv) = event.resource_version() {
            self.advance(namespace.unwrap_or(""), rv);
        }
    }

    /// Move a namespace's cursor unless that namespace is lossy.
    pub fn advance(&self, namespace: &str, rv: &str) {
        if !self.lossy.contains(namespace) {
            self.api.versions().set(namespace, rv.to_string());
        }
    }

    /// Forget the namespace's cursor and hold it unset until [`Self::stream_closed`] or a list.
    pub fn mark_lossy(&mut self, namespace: &str) {
        let forgotten = self.api.versions().forget(namespace);
        if self.lossy.insert(namespace.to_string()) {
            warn!(kind = %self.api.kind(), ns = %namespace, forgotten = ?forgotten, "store: events lost; next watch replays from current state");
        }
    }

    pub fn is_lossy(&self, namespace: Option<&str>) -> bool { self.lossy.contains(namespace.unwrap_or("")) }

    /// The stream for `namespace` ended; the next subscription starts clean.
    pub fn stream_closed(&mut self, namespace: Option<&str>) { self.lossy.remove(namespace.unwrap_or("")); }

    /// Apply a batch and bump the epoch once.
    pub fn apply_batch(&mut self, batch: Vec<(Option<String>, WatchEvent)>) {
        if batch.is_empty() {
            return;
        }
        let t0 = Instant::now();
        for (ns, ev) in &batch {
            self.apply(ns.as_deref(), ev);
        }
        self.epoch = self.epoch.saturating_add(1);
        histogram!("kubelink_store_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
    }

    pub fn freeze(&self) -> Arc<Snapshot> {
        let mut items: Vec<Value> = self.items.values().cloned().collect();
        items.sort_by(|a, b| {
            (meta_str(a, "namespace").unwrap_or(""), meta_str(a, "name").unwrap_or(""))
                .cmp(&(meta_str(b, "namespace").unwrap_or(""), meta_str(b, "name").unwrap_or("")))
        });
        Arc::new(Snapshot { epoch: self.epoch, items })
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore").field("api", &self.api).field("items", &self.items.len()).field("epoch", &self.epoch).finish()
    }
}

/// Coalescing queue keyed by object identity, FIFO by first arrival, fixed capacity.
///
/// Events without an object identity (bookmarks, errors) are kept in arrival
/// order. Cursor moves are tracked separately so the final cursor per namespace
/// is the last one that arrived, whatever the coalesced order.
pub struct Coalescer {
    map: FxHashMap<ObjectKey, (Option<String>, WatchEvent)>,
    order: VecDeque<ObjectKey>,
    passthrough: Vec<(Option<String>, WatchEvent)>,
    cursors: FxHashMap<String, String>,
    cap: usize,
    dropped: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            map: FxHashMap::default(),
            order: VecDeque::new(),
            passthrough: Vec::new(),
            cursors: FxHashMap::default(),
            cap: cap.max(1),
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize { self.map.len() + self.passthrough.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn dropped(&self) -> u64 { self.dropped }

    /// Queue an event. Returns the namespace key (`""` for cluster-wide) of an
    /// event evicted to make room, if any.
    pub fn push(&mut self, namespace: Option<String>, event: WatchEvent) -> Option<String> {
        if let Some(rv) = event.resource_version() {
            self.cursors.insert(namespace.clone().unwrap_or_default(), rv.to_string());
        }
        let Some(key) = event.object().and_then(ObjectKey::of) else {
            self.passthrough.push((namespace, event));
            return None;
        };
        let mut evicted = None;
        if !self.map.contains_key(&key) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    if let Some((ns, _)) = self.map.remove(&old) {
                        evicted = Some(ns.unwrap_or_default());
                    }
                    self.dropped += 1;
                }
            }
            self.order.push_back(key.clone());
        }
        self.map.insert(key, (namespace, event));
        evicted
    }

    /// Drain everything queued, plus the last cursor seen per namespace.
    pub fn drain_ready(&mut self) -> (Vec<(Option<String>, WatchEvent)>, Vec<(String, String)>) {
        let mut out = Vec::with_capacity(self.order.len() + self.passthrough.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(entry) = self.map.remove(&key) {
                out.push(entry);
            }
        }
        out.append(&mut self.passthrough);
        (out, self.cursors.drain().collect())
    }
}

/// Read side of a running [`spawn_sync`] loop.
pub struct SyncHandle {
    snap: Arc<ArcSwap<Snapshot>>,
    epoch_rx: watch::Receiver<u64>,
    task: tokio::task::JoinHandle<ObjectStore>,
}

impl SyncHandle {
    pub fn current(&self) -> Arc<Snapshot> { self.snap.load_full() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Wait for the loop to finish (its channel closed) and take the store back. Call once.
    pub async fn join(&mut self) -> Option<ObjectStore> { (&mut self.task).await.ok() }

    pub fn abort(&self) { self.task.abort(); }
}

/// [`spawn_sync_with_capacity`] with [`DEFAULT_QUEUE_CAP`].
pub fn spawn_sync(store: ObjectStore, rx: mpsc::Receiver<WatchMessage>) -> SyncHandle {
    spawn_sync_with_capacity(store, rx, DEFAULT_QUEUE_CAP)
}

/// Store plus its pending coalesced events; what one sync loop owns.
struct Ingest {
    store: ObjectStore,
    coalescer: Coalescer,
    api_base: String,
}

impl Ingest {
    fn new(store: ObjectStore, cap: usize) -> Self {
        let api_base = store.api().api_base().to_string();
        Self { store, coalescer: Coalescer::with_capacity(cap), api_base }
    }

    /// Queue an event, or settle a closed stream. Returns a snapshot when a close forced a flush.
    fn handle(&mut self, msg: WatchMessage) -> Option<Arc<Snapshot>> {
        match msg {
            WatchMessage::Event { api_base, namespace, event } if api_base == self.api_base => {
                if let Some(ns) = self.coalescer.push(namespace, event) {
                    self.store.mark_lossy(&ns);
                }
                None
            }
            WatchMessage::Closed { api_base, namespace, error } if api_base == self.api_base => {
                match error {
                    Some(e) => warn!(api_base = %api_base, namespace = ?namespace, error = %e, "store: watch closed"),
                    None => info!(api_base = %api_base, namespace = ?namespace, "store: watch closed"),
                }
                // Flush first so a pending 410 or overflow is settled before the next stream.
                let next = self.flush();
                self.store.stream_closed(namespace.as_deref());
                next
            }
            other => {
                debug!(api_base = %other.api_base(), "store: message for another kind");
                None
            }
        }
    }

    /// Apply whatever is queued; `None` when nothing was.
    fn flush(&mut self) -> Option<Arc<Snapshot>> {
        if self.coalescer.is_empty() {
            return None;
        }
        let (batch, cursors) = self.coalescer.drain_ready();
        self.store.apply_batch(batch);
        for (ns, rv) in cursors {
            self.store.advance(&ns, &rv);
        }
        Some(self.store.freeze())
    }
}

/// Spawn the ingest loop: consume watch messages for the store's kind, coalesce
/// them per tick, apply, and swap in a new snapshot.
///
/// Messages for other api bases are ignored. `Closed` flushes what is queued and
/// ends the namespace's lossy state; reconnecting is left to whoever owns the
/// subscription.
pub fn spawn_sync_with_capacity(store: ObjectStore, mut rx: mpsc::Receiver<WatchMessage>, cap: usize) -> SyncHandle {
    let snap = Arc::new(ArcSwap::new(store.freeze()));
    let (epoch_tx, epoch_rx) = watch::channel(store.epoch());
    let snap_clone = Arc::clone(&snap);

    let task = tokio::spawn(async move {
        let mut ingest = Ingest::new(store, cap);
        let mut ticker = tokio::time::interval(Duration::from_millis(8));
        let publish = |next: Option<Arc<Snapshot>>| {
            if let Some(next) = next {
                let epoch = next.epoch;
                snap_clone.store(next);
                let _ = epoch_tx.send(epoch);
            }
        };
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(msg) => publish(ingest.handle(msg)),
                    None => {
                        debug!("watch channel closed; draining and exiting sync loop");
                        publish(ingest.flush());
                        break;
                    }
                },
                _ = ticker.tick() => publish(ingest.flush()),
            }
        }
        if ingest.coalescer.dropped() > 0 {
            warn!(dropped = ingest.coalescer.dropped(), "store: coalescer dropped events");
        }
        info!(api_base = %ingest.api_base, "sync loop stopped");
        ingest.store
    });

    SyncHandle { snap, epoch_rx, task }
}
