#![forbid(unsafe_code)]

mod kinds;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kubelink_core::{parse, ObjectReference, Query};
use kubelink_kubehub::{
    lookup_api_link, lookup_api_link_from, ApiEndpoint, ApiError, ApiResult, Disposer, EventStream, KubeTransport, Method,
    ObjectTarget, StreamWatchCoordinator, Transport, WatchCoordinator, WatchEvent, WatchMessage,
};
use kubelink_store::{spawn_sync_with_capacity, ObjectStore, GONE};
use serde_json::Value;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::kinds::Catalog;

#[derive(Parser, Debug)]
#[command(name = "kubelinkctl", version, about = "kubelink CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Kind name for an API path that is not registered yet
    #[arg(long = "kind", global = true)]
    path_kind: Option<String>,

    /// Treat an unregistered API path as cluster-scoped
    #[arg(long = "cluster-scoped", global = true, action = ArgAction::SetTrue)]
    cluster_scoped: bool,

    /// Watch channel capacity
    #[arg(long = "queue-cap", env = "KUBELINK_QUEUE_CAP", global = true, default_value_t = kubelink_store::DEFAULT_QUEUE_CAP)]
    queue_cap: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Split an API path into its components (offline)
    Parse { path: String },
    /// Print the URL a client uses for a collection, an object or a watch (offline)
    Url {
        /// Kind, resource or API path, e.g. "Deployment" or "/apis/apps/v1/deployments"
        target: String,
        name: Option<String>,
        #[arg(long = "watch", action = ArgAction::SetTrue)]
        watch: bool,
    },
    /// List objects of a kind
    Ls {
        target: String,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        #[arg(long = "limit")]
        limit: Option<u32>,
    },
    /// Fetch one object
    Get { target: String, name: String },
    /// Create an object; the body is merged over kind, apiVersion, name and namespace
    Create {
        target: String,
        name: String,
        /// JSON body file, "-" for stdin
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,
    },
    /// Delete one object
    Delete {
        target: String,
        name: String,
        /// Orphan, Background or Foreground
        #[arg(long = "propagation")]
        propagation: Option<String>,
    },
    /// Load, then watch one or more kinds and print +/- events until Ctrl-C
    Watch {
        #[arg(required = true, num_args = 1..)]
        targets: Vec<String>,
        #[arg(long = "timeout-seconds")]
        timeout_seconds: Option<u32>,
    },
    /// Resolve an object reference to an API URL (offline)
    Link {
        #[arg(required_unless_present = "from")]
        kind: Option<String>,
        #[arg(required_unless_present = "from")]
        api_version: Option<String>,
        #[arg(required_unless_present = "from")]
        name: Option<String>,
        /// JSON object whose ownerReferences / involvedObject are resolved instead
        #[arg(long = "from")]
        from: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("KUBELINK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUBELINK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KUBELINK_METRICS_ADDR; expected host:port");
        }
    }
}

/// Transport for commands that only build URLs.
struct Offline;

#[async_trait::async_trait]
impl Transport for Offline {
    async fn request(&self, method: Method, url: &str, _body: Option<Value>) -> ApiResult<Value> {
        Err(ApiError::Request(format!("offline: {method} {url}")))
    }

    async fn watch(&self, url: &str) -> ApiResult<EventStream> {
        Err(ApiError::Request(format!("offline: watch {url}")))
    }
}

async fn connect() -> Result<Arc<dyn Transport>> {
    let t0 = Instant::now();
    let transport = KubeTransport::try_default().await.context("connecting to cluster")?;
    info!(took_ms = %t0.elapsed().as_millis(), "cluster client ready");
    Ok(Arc::new(transport))
}

fn read_json(path: &Path) -> Result<Value> {
    let text = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("reading stdin")?
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
    };
    serde_json::from_str(&text).with_context(|| format!("parsing {} as JSON", path.display()))
}

fn meta<'a>(v: &'a Value, field: &str) -> Option<&'a str> {
    v.get("metadata").and_then(|m| m.get(field)).and_then(Value::as_str)
}

fn json_key(v: &Value) -> String {
    let name = meta(v, "name").unwrap_or("");
    match meta(v, "namespace") {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

fn print_object(output: Output, v: &Value) -> Result<()> {
    match output {
        Output::Human => println!(
            "{} {} rv={}",
            v.get("kind").and_then(Value::as_str).unwrap_or("-"),
            json_key(v),
            meta(v, "resourceVersion").unwrap_or("-")
        ),
        Output::Json => println!("{}", serde_json::to_string_pretty(v)?),
    }
    Ok(())
}

fn print_message(output: Output, msg: &WatchMessage) -> Result<()> {
    if output == Output::Json {
        println!("{}", serde_json::to_string(msg)?);
        return Ok(());
    }
    match msg {
        WatchMessage::Event { event, .. } => match event {
            WatchEvent::Added(o) | WatchEvent::Modified(o) => println!("+ {}", json_key(o)),
            WatchEvent::Deleted(o) => println!("- {}", json_key(o)),
            WatchEvent::Bookmark { .. } => {}
            WatchEvent::Error { code, message } => eprintln!("! {} {}", code, message),
        },
        WatchMessage::Closed { api_base, error: Some(e), .. } => eprintln!("watch on {} failed: {}", api_base, e),
        WatchMessage::Closed { api_base, error: None, .. } => info!(api_base = %api_base, "watch expired; resubscribing"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Parse { ref path } => {
            let c = parse(path)?;
            match cli.output {
                Output::Human => {
                    println!("apiBase:             {}", c.api_base);
                    println!("apiPrefix:           {}", c.api_prefix);
                    println!("apiGroup:            {}", c.api_group);
                    println!("apiVersion:          {}", c.api_version);
                    println!("apiVersionWithGroup: {}", c.api_version_with_group);
                    println!("resource:            {}", c.resource);
                    println!("namespace:           {}", c.namespace.as_deref().unwrap_or("-"));
                    println!("name:                {}", c.name.as_deref().unwrap_or("-"));
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&c)?),
            }
        }
        Commands::Url { ref target, ref name, watch } => {
            let mut catalog = Catalog::builtin(Arc::new(Offline))?;
            let api = catalog.resolve(target, cli.path_kind.as_deref(), cli.cluster_scoped)?;
            let url = if watch {
                api.get_watch_url(ns, None)
            } else {
                api.get_url(&ObjectTarget { name: name.as_deref(), namespace: ns }, None)
            };
            println!("{}", url);
        }
        Commands::Ls { ref target, ref selector, limit } => {
            let mut catalog = Catalog::builtin(connect().await?)?;
            let api = catalog.resolve(target, cli.path_kind.as_deref(), cli.cluster_scoped)?;
            let mut query = Query::new();
            if let Some(sel) = selector {
                query = query.label_selector(sel.as_str());
            }
            if let Some(n) = limit {
                query = query.limit(n);
            }
            info!(kind = %api.kind(), ns = ?ns, "ls invoked");
            let items = api.list(ns, (!query.is_empty()).then_some(&query)).await?;
            match cli.output {
                Output::Human => {
                    println!("{:<20} {:<40} RESOURCEVERSION", "NAMESPACE", "NAME");
                    for item in &items {
                        println!(
                            "{:<20} {:<40} {}",
                            meta(item, "namespace").unwrap_or("-"),
                            meta(item, "name").unwrap_or(""),
                            meta(item, "resourceVersion").unwrap_or("-")
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
        Commands::Get { ref target, ref name } => {
            let mut catalog = Catalog::builtin(connect().await?)?;
            let api = catalog.resolve(target, cli.path_kind.as_deref(), cli.cluster_scoped)?;
            let obj = api.get(&ObjectTarget { name: Some(name.as_str()), namespace: ns }, None).await?;
            print_object(cli.output, &obj)?;
        }
        Commands::Create { ref target, ref name, ref file } => {
            let data = file.as_deref().map(read_json).transpose()?;
            let mut catalog = Catalog::builtin(connect().await?)?;
            let api = catalog.resolve(target, cli.path_kind.as_deref(), cli.cluster_scoped)?;
            let created = api.create(&ObjectTarget { name: Some(name.as_str()), namespace: ns }, data).await?;
            print_object(cli.output, &created)?;
        }
        Commands::Delete { ref target, ref name, ref propagation } => {
            let mut catalog = Catalog::builtin(connect().await?)?;
            let api = catalog.resolve(target, cli.path_kind.as_deref(), cli.cluster_scoped)?;
            let params = propagation.as_deref().map(|p| Query::new().param("propagationPolicy", p));
            api.delete(&ObjectTarget { name: Some(name.as_str()), namespace: ns }, params.as_ref()).await?;
            if cli.output == Output::Human {
                println!("deleted {}", api.get_url(&ObjectTarget { name: Some(name.as_str()), namespace: ns }, None));
            }
        }
        Commands::Watch { ref targets, timeout_seconds } => {
            let mut catalog = Catalog::builtin(connect().await?)?;
            let apis = targets
                .iter()
                .map(|t| catalog.resolve(t, cli.path_kind.as_deref(), cli.cluster_scoped))
                .collect::<Result<Vec<_>>>()?;
            info!(kinds = apis.len(), ns = ?ns, "watch invoked");

            let (coordinator, mut rx) = StreamWatchCoordinator::channel(cli.queue_cap);
            let coordinator = match timeout_seconds {
                Some(secs) => coordinator.with_timeout_seconds(secs),
                None => coordinator,
            };

            // Prime each store with a list so the watches resume from its cursor.
            let mut sinks: HashMap<String, mpsc::Sender<WatchMessage>> = HashMap::new();
            let mut handles = Vec::new();
            for api in &apis {
                let mut store = ObjectStore::new(Arc::clone(api));
                let n = store.load_all(ns).await?;
                info!(kind = %api.kind(), items = n, "initial list loaded");
                let (tx, srx) = mpsc::channel(cli.queue_cap.max(1));
                handles.push(spawn_sync_with_capacity(store, srx, cli.queue_cap));
                sinks.insert(api.api_base().to_string(), tx);
            }

            let mut disposers: HashMap<String, Disposer> = apis
                .iter()
                .map(|api| (api.api_base().to_string(), api.watch(&coordinator, ns)))
                .collect();

            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        let Some(msg) = maybe else { break };
                        print_message(cli.output, &msg)?;
                        let base = msg.api_base().to_string();
                        if let Some(tx) = sinks.get(&base) {
                            let _ = tx.send(msg.clone()).await;
                        }
                        // The store forgets the cursor too, but the resubscribe below must not race it.
                        if let WatchMessage::Event { namespace, event: WatchEvent::Error { code: GONE, .. }, .. } = &msg {
                            if let Some(api) = catalog.registry.get_by_base(&base) {
                                api.versions().forget(namespace.as_deref().unwrap_or(""));
                            }
                        }
                        if let WatchMessage::Closed { error, .. } = &msg {
                            match (error, catalog.registry.get_by_base(&base)) {
                                (None, Some(api)) => {
                                    let d = coordinator.subscribe(api, ns.map(str::to_string));
                                    disposers.insert(base, d);
                                }
                                _ => {
                                    disposers.remove(&base);
                                }
                            }
                            if disposers.is_empty() {
                                warn!("all watches ended");
                                break;
                            }
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }

            for (base, d) in disposers {
                if let Err(e) = d.dispose() {
                    warn!(api_base = %base, error = %e, "dispose failed");
                }
            }
            drop(coordinator);
            drop(sinks);
            for mut handle in handles {
                if let Some(store) = handle.join().await {
                    info!(kind = %store.api().kind(), items = store.len(), epoch = store.epoch(), "store closed");
                }
            }
        }
        Commands::Link { ref kind, ref api_version, ref name, ref from } => {
            let catalog = Catalog::builtin(Arc::new(Offline))?;
            let links: Vec<(ObjectReference, String)> = match from {
                Some(path) => {
                    let obj = read_json(path)?;
                    let mut refs = ObjectReference::owners_of(&obj);
                    refs.extend(ObjectReference::involved_object(&obj));
                    if refs.is_empty() {
                        bail!("{} has no ownerReferences or involvedObject", path.display());
                    }
                    refs.into_iter()
                        .map(|r| {
                            let link = lookup_api_link_from(&catalog.registry, &r, &obj);
                            (r, link)
                        })
                        .collect()
                }
                None => {
                    let (Some(kind), Some(api_version), Some(name)) = (kind, api_version, name) else {
                        return Err(anyhow!("kind, apiVersion and name are required without --from"));
                    };
                    let r = ObjectReference::new(kind.as_str(), api_version.as_str(), name.as_str());
                    let link = lookup_api_link(&catalog.registry, &r, ns);
                    vec![(r, link)]
                }
            };
            match cli.output {
                Output::Human => {
                    for (r, link) in &links {
                        println!("{} {} -> {}", r.kind, r.name, link);
                    }
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Row<'a> { reference: &'a ObjectReference, link: &'a str }
                    let rows: Vec<_> = links.iter().map(|(r, l)| Row { reference: r, link: l }).collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
    }

    Ok(())
}
