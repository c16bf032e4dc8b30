use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use moduleops::auth::{CredentialsResolver, KubeSecretStore};
use moduleops::config::OperatorConfig;
use moduleops::controller::{
    ControllerRuntime, KubeClusterClient, KubeModuleStore, Reconciler,
};
use moduleops::crd::Module;
use moduleops::gitops::{CliGitBackend, GitWriteClient};
use moduleops::template::source::default_fetchers;
use moduleops::template::{TemplateCache, TemplateRepository};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Run(OperatorConfig),
    /// Show version and build information
    Version,
    /// List Modules and their reconcile phase
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace to list; all namespaces when omitted
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("moduleops controller v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(config) => run_controller(config).await,
    }
}

async fn run_info(args: InfoArgs) -> anyhow::Result<()> {
    let client = kube::Client::try_default()
        .await
        .context("connecting to Kubernetes")?;

    let api: Api<Module> = match &args.namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let modules = api
        .list(&ListParams::default())
        .await
        .context("listing Modules")?;

    println!("Managed Modules: {}", modules.items.len());
    for module in &modules.items {
        let phase = module
            .status
            .as_ref()
            .map(|s| s.phase.to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        println!(
            "  {}/{}  {}  {}",
            module.namespace().unwrap_or_default(),
            module.name_any(),
            module.spec.template.version,
            phase
        );
    }
    Ok(())
}

fn init_tracing(config: &OperatorConfig) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = if config.log_json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    if config.telemetry_enabled() {
        match moduleops::telemetry::init_telemetry(&registry) {
            Ok(otel_layer) => {
                registry.with(otel_layer).init();
                info!("OpenTelemetry tracing initialized");
            }
            Err(e) => {
                registry.init();
                warn!("OpenTelemetry tracing disabled: {}", e);
            }
        }
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled");
    }
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    init_tracing(&config);
    config.validate()?;

    info!("Starting moduleops controller v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .context("connecting to Kubernetes")?;
    info!("Connected to Kubernetes cluster");

    let is_leader = if config.leader_elect {
        let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });
        info!("Leader election using holder ID: {}", holder_identity);

        let flag = Arc::new(AtomicBool::new(false));
        let leases: Api<Lease> = Api::namespaced(client.clone(), &config.operator_namespace);
        let namespace = config.operator_namespace.clone();
        let flag_bg = Arc::clone(&flag);
        tokio::spawn(async move {
            run_leader_election(leases, namespace, holder_identity, flag_bg).await;
        });
        Some(flag)
    } else {
        None
    };

    let secrets = KubeSecretStore::new(client.clone(), &config.operator_namespace);
    let credentials = CredentialsResolver::new(Arc::new(secrets));

    let cache = match config.template_cache_capacity {
        0 => TemplateCache::new(),
        capacity => TemplateCache::with_capacity(capacity),
    };
    let http = reqwest::Client::builder()
        .user_agent(concat!("moduleops/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(60))
        .build()
        .context("building HTTP client")?;
    let templates = Arc::new(TemplateRepository::new(cache, default_fetchers(http)));

    let git_backend = CliGitBackend::new(&config.git_author_name, &config.git_author_email);
    let git = Arc::new(GitWriteClient::new(
        Arc::new(git_backend),
        config.commit_message_template.clone(),
    ));

    let reconciler = Arc::new(Reconciler::new(
        Arc::new(KubeModuleStore::new(client.clone())),
        Arc::new(KubeClusterClient::new(client.clone())),
        credentials,
        templates,
        git,
        config.reconciler_config(),
    ));
    let runtime = ControllerRuntime::new(reconciler, config.runtime_config());

    #[cfg(feature = "rest-api")]
    {
        let handle = runtime.handle();
        let addr = config.rest_bind_address;
        tokio::spawn(async move {
            if let Err(e) = moduleops::rest_api::run_server(handle, addr).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    let result = runtime.run(client, is_leader).await;

    // Flush any remaining traces
    moduleops::telemetry::shutdown_telemetry();

    result.map_err(Into::into)
}

const LEASE_NAME: &str = "moduleops-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

async fn run_leader_election(
    leases: Api<Lease>,
    namespace: String,
    identity: String,
    is_leader: Arc<AtomicBool>,
) {
    loop {
        match try_acquire_or_renew(&leases, &namespace, &identity).await {
            Ok(true) => {
                if !is_leader.swap(true, Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.swap(false, Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let Some(existing) = leases.get_opt(LEASE_NAME).await? else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                ..Default::default()
            }),
        };
        leases.create(&PostParams::default(), &lease).await?;
        info!("Created lease {} with holder {}", LEASE_NAME, identity);
        return Ok(true);
    };

    let spec = existing.spec.as_ref();
    let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

    let patch = if current_holder == Some(identity) {
        serde_json::json!({
            "spec": {
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        })
    } else {
        let expired = spec
            .and_then(|s| s.renew_time.as_ref())
            .map(|renew| {
                let duration = spec
                    .and_then(|s| s.lease_duration_seconds)
                    .unwrap_or(LEASE_DURATION_SECS);
                now > renew.0 + chrono::Duration::seconds(duration as i64)
            })
            .unwrap_or(true);
        if !expired {
            return Ok(false);
        }
        info!("Lease held by {:?} has expired, taking over", current_holder);
        serde_json::json!({
            "spec": {
                "holderIdentity": identity,
                "acquireTime": MicroTime(now),
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        })
    };

    leases
        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}
