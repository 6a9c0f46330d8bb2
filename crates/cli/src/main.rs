use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use ferry_core::ObjectStore;
use ferry_kubehub::{KubeObjectStore, KubeServiceNamespaceStore};
use ferry_sync::{scope, Controller, ControllerConfig, ProviderTarget, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ferryctl", version, about = "Ferry spec propagation controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Propagate one bound resource type from the consumer cluster to its providers
    Run {
        /// GVK key, e.g. "example.dev/v1/Widget"
        #[arg(long = "resource", env = "FERRY_RESOURCE")]
        resource: String,
        /// Kubeconfig context of the consumer cluster (default: inferred)
        #[arg(long = "consumer-context", env = "FERRY_CONSUMER_CONTEXT")]
        consumer_context: Option<String>,
        /// Provider binding: id=<cluster-id>,namespace=<owner-namespace>[,context=<ctx>][,uid=<namespace-uid>]
        #[arg(long = "provider", required = true, action = ArgAction::Append)]
        providers: Vec<ProviderSpec>,
        /// Top-level spec field the provider may amend; repeatable
        #[arg(long = "provider-field", action = ArgAction::Append)]
        provider_fields: Vec<String>,
        /// Worker count
        #[arg(long = "workers", env = "FERRY_WORKERS")]
        workers: Option<usize>,
    },
    /// Print the upstream name of a cluster-scoped object, or the downstream name with --reverse
    Translate {
        /// Provider namespace dedicated to the consumer
        #[arg(long = "owner-namespace")]
        owner_namespace: String,
        name: String,
        #[arg(long = "reverse", action = ArgAction::SetTrue)]
        reverse: bool,
    },
}

/// One `--provider` binding.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ProviderSpec {
    id: String,
    namespace: String,
    context: Option<String>,
    uid: Option<String>,
}

impl FromStr for ProviderSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mut id, mut namespace, mut context, mut uid) = (None, None, None, None);
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = part.split_once('=').ok_or_else(|| format!("expected key=value, got {:?}", part))?;
            let v = v.trim();
            if v.is_empty() {
                return Err(format!("empty value for {}", k));
            }
            let slot = match k.trim() {
                "id" => &mut id,
                "namespace" => &mut namespace,
                "context" => &mut context,
                "uid" => &mut uid,
                other => return Err(format!("unknown provider key {:?}", other)),
            };
            *slot = Some(v.to_string());
        }
        Ok(Self {
            id: id.ok_or("provider needs id=")?,
            namespace: namespace.ok_or("provider needs namespace=")?,
            context,
            uid,
        })
    }
}

fn init_tracing() {
    let env = std::env::var("FERRY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FERRY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid FERRY_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { resource, consumer_context, providers, provider_fields, workers } => {
            run(resource, consumer_context, providers, provider_fields, workers).await?;
        }
        Commands::Translate { owner_namespace, name, reverse } => {
            let (downstream, upstream) = if reverse {
                match scope::downstream_name(&owner_namespace, &name) {
                    Some(d) => (d.to_string(), name.clone()),
                    None => bail!("{} does not carry the {}{} prefix", name, owner_namespace, scope::SEPARATOR),
                }
            } else {
                (name.clone(), scope::upstream_name(&owner_namespace, &name))
            };
            match cli.output {
                Output::Human => println!("{}", if reverse { &downstream } else { &upstream }),
                Output::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "ownerNamespace": owner_namespace,
                        "downstream": downstream,
                        "upstream": upstream,
                    }))?
                ),
            }
        }
    }
    Ok(())
}

async fn run(
    resource: String,
    consumer_context: Option<String>,
    providers: Vec<ProviderSpec>,
    provider_fields: Vec<String>,
    workers: Option<usize>,
) -> Result<()> {
    for (i, p) in providers.iter().enumerate() {
        if providers[..i].iter().any(|q| q.id == p.id) {
            bail!("provider {} configured twice", p.id);
        }
    }
    let mut config = ControllerConfig::from_env();
    if let Some(n) = workers {
        config.workers = n.max(1);
    }

    let consumer = ferry_kubehub::client_for_context(consumer_context.as_deref()).await?;
    let descriptor = ferry_kubehub::discover_descriptor(consumer.clone(), &resource, provider_fields)
        .await
        .with_context(|| format!("discovering {}", resource))?;
    let ar = descriptor.api_resource();
    info!(resource = %descriptor.gvk_key(), namespaced = descriptor.namespaced, "bound resource discovered");

    let cancel = CancellationToken::new();
    let mut watchers = Vec::new();
    let downstream = Arc::new(ferry_store::object_cache("consumer"));
    watchers.push(ferry_kubehub::watch_objects(consumer.clone(), &ar, None, Arc::clone(&downstream), cancel.clone()));
    let consumer_store: Arc<dyn ObjectStore> = Arc::new(KubeObjectStore::new(consumer, ar.clone()));

    let mut targets = Vec::with_capacity(providers.len());
    for p in providers {
        let client = ferry_kubehub::client_for_context(p.context.as_deref()).await?;
        let uid = match p.uid {
            Some(uid) => uid,
            None => ferry_kubehub::namespace_uid(client.clone(), &p.namespace).await?,
        };
        let objects = Arc::new(ferry_store::object_cache(&format!("{}/objects", p.id)));
        let sns = Arc::new(ferry_store::service_namespace_cache(&format!("{}/servicenamespaces", p.id)));
        // cluster-scoped copies all live in the owner namespace
        let watch_ns = if descriptor.namespaced { None } else { Some(p.namespace.as_str()) };
        watchers.push(ferry_kubehub::watch_objects(client.clone(), &ar, watch_ns, Arc::clone(&objects), cancel.clone()));
        watchers.push(ferry_kubehub::watch_service_namespaces(client.clone(), Arc::clone(&sns), cancel.clone()));
        let transport = Transport {
            objects: Arc::new(KubeObjectStore::new(client.clone(), ar.clone())),
            service_namespaces: Arc::new(KubeServiceNamespaceStore::new(client)),
        };
        info!(provider = %p.id, owner_namespace = %p.namespace, context = ?p.context, "provider configured");
        targets.push(Arc::new(ProviderTarget::new(p.id, p.namespace, uid, objects, sns, transport)));
    }

    let controller = Controller::new(descriptor, downstream, consumer_store, targets, &config);
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { controller.run(cancel).await }
    });
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    cancel.cancel();
    if let Err(e) = handle.await {
        error!(error = %e, "controller task failed");
    }
    for w in watchers {
        if let Err(e) = w.await {
            error!(error = %e, "watcher task failed");
        }
    }
    Ok(())
}
