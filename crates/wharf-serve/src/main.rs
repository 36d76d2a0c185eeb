//! wharf-serve: websocket-based pipeline scheduler.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wharf_cluster::{ClusterConfig, HttpClusterClient};
use wharf_core::config::Credentials;
use wharf_handlers::{HandlerConfig, HandlerModules, HandlerRegistry};
use wharf_scheduler::{Executor, ExecutorConfig};
use wharf_serve::{AppState, build_app};

#[derive(Parser)]
#[command(name = "wharf-serve", version, about = "WebSocket-based pipeline scheduler")]
struct Args {
    /// Root directory holding the pipeline definitions.
    #[arg(long)]
    root_path: PathBuf,

    /// Data directory for run workspaces; defaults to the root path.
    #[arg(long)]
    data_path: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 30000)]
    port: u16,

    /// Credential file with the jobs-db sections; falls back to the
    /// environment when absent.
    #[arg(long)]
    cred: Option<PathBuf>,

    /// Cluster API-server base URL.
    #[arg(long, default_value = "http://127.0.0.1:8001")]
    cluster_url: String,

    #[arg(long, default_value = "default")]
    namespace: String,

    /// Bearer token for the cluster, when RBAC requires one.
    #[arg(long)]
    cluster_token: Option<String>,

    /// Handler groups to register: all, core, kf, or elastic.
    #[arg(long, default_value = "all")]
    modules: String,

    /// Seconds an image pull may back off before the task fails.
    #[arg(long, default_value_t = 300)]
    image_pull_deadline: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wharf=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let root_path = args
        .root_path
        .canonicalize()
        .with_context(|| format!("unreadable pipelines root {}", args.root_path.display()))?;
    let data_path = match &args.data_path {
        Some(path) => {
            tokio::fs::create_dir_all(path).await?;
            path.canonicalize()?
        }
        None => root_path.clone(),
    };

    let modules: HandlerModules = args
        .modules
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let credentials = match &args.cred {
        Some(path) => Credentials::from_file(path)?,
        None => Credentials::from_env(),
    };

    tracing::info!("Connecting to jobs store...");
    let store = wharf_store::connect(&credentials.jobs_db).await?;

    let cluster = Arc::new(HttpClusterClient::new(ClusterConfig {
        base_url: args.cluster_url.clone(),
        namespace: args.namespace.clone(),
        token: args.cluster_token.clone(),
        request_timeout: Duration::from_secs(30),
    })?);

    let handler_config = HandlerConfig {
        image_pull_deadline: Duration::from_secs(args.image_pull_deadline),
        ..HandlerConfig::default()
    };
    let registry = Arc::new(HandlerRegistry::new(
        cluster.clone(),
        handler_config,
        modules,
    ));

    let executor = Executor::new(
        store.clone(),
        registry.clone(),
        cluster.clone(),
        ExecutorConfig::default(),
    );

    // Pick up every run the previous process left unfinished.
    let resumed = executor.resume_all().await?;
    if !resumed.is_empty() {
        tracing::info!(count = resumed.len(), "Resumed unfinished runs");
    }

    let state = Arc::new(AppState::new(
        store,
        registry,
        executor,
        root_path,
        data_path,
    ));
    let app = build_app(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {}", addr))?;
    tracing::info!(addr = %addr, "Ready to serve");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
