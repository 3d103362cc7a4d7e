mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{BusKind, LogFormat, TaskmeshConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use taskmesh_gateway::{AppState, AuthConfig, GatewayServer};
use taskmesh_orchestrator::{
    AgentRegistry, AgentScorer, HttpHealthChecker, InMemoryBus, MessageBus, Orchestrator,
    OrchestratorConfig, SidecarBus, TraceSink,
};
use taskmesh_store::{Database, FileKvStore, SqliteCheckpointStore, SqliteOutcomeStore};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskmesh", about = "taskmesh: capability-based task scheduler for agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "taskmesh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler and its HTTP control plane
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List registered agents
    Agents,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let (config, loaded) = load_config(&cli.config).await?;
    init_logging(config.log.format);
    if !loaded {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::Agents => list_agents(&config).await,
    }
}

/// Reads the config file. A missing file yields defaults; an unreadable or
/// invalid one is an error.
async fn load_config(path: &Path) -> anyhow::Result<(TaskmeshConfig, bool)> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => {
            let config = TaskmeshConfig::parse(&raw)
                .with_context(|| format!("Invalid config file '{}'", path.display()))?;
            Ok((config, true))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok((TaskmeshConfig::default(), false))
        }
        Err(e) => Err(anyhow::anyhow!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        )),
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).compact().init(),
    }
}

async fn open_registry(config: &TaskmeshConfig) -> anyhow::Result<Arc<AgentRegistry>> {
    let kv = FileKvStore::new(config.storage.registry_dir()).await?;
    Ok(Arc::new(AgentRegistry::new(Arc::new(kv))))
}

async fn serve(
    config: TaskmeshConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    let registry = open_registry(&config).await?;
    let db = Database::open(&config.storage.database_path())?;
    let checkpoints = Arc::new(SqliteCheckpointStore::new(db.clone()));
    let outcomes =
        Arc::new(SqliteOutcomeStore::new(db).with_retention(config.scoring.outcome_retention()));

    let checker = HttpHealthChecker::new(Duration::from_millis(
        config.scoring.health_check_timeout_ms,
    ))?;
    let scorer = Arc::new(AgentScorer::with_config(
        outcomes,
        Arc::new(checker),
        (&config.scoring).into(),
    ));

    let (bus, results) = match config.bus.kind {
        BusKind::Memory => {
            let bus = InMemoryBus::new();
            let results = bus.subscribe(&config.bus.results_topic);
            (bus as Arc<dyn MessageBus>, Some(results))
        }
        BusKind::Sidecar => {
            info!(
                sidecar = %config.bus.sidecar_url,
                pubsub = %config.bus.pubsub_name,
                "Using sidecar bus"
            );
            let bus = SidecarBus::new(
                config.bus.sidecar_url.clone(),
                config.bus.pubsub_name.clone(),
            );
            (Arc::new(bus) as Arc<dyn MessageBus>, None)
        }
    };

    let orchestrator = Orchestrator::new(
        registry,
        scorer,
        bus,
        checkpoints,
        TraceSink::jsonl(config.storage.trace_dir()),
        OrchestratorConfig::from(&config.scheduler),
    );

    match orchestrator.recover().await {
        Ok(n) => info!(recovered = n, "Checkpoint recovery finished"),
        Err(e) => error!(error = %e, "Checkpoint recovery failed, starting empty"),
    }

    // Sidecar deployments deliver results over POST /results instead.
    let listener_task = results.map(|rx| orchestrator.spawn_result_listener(rx));

    let mut auth_config = AuthConfig::new(config.server.api_keys.clone());
    if auth_config.is_enabled() {
        info!(keys = config.server.api_keys.len(), "API key auth enabled");
    }
    if let Some(token) = &config.bus.app_token {
        info!("Sidecar token required on result delivery");
        auth_config = auth_config.with_sidecar_token(token.clone());
    }
    let state = AppState::new(orchestrator.clone())
        .with_subscription(config.bus.pubsub_name.clone(), config.bus.results_topic.clone());
    let app = GatewayServer::build_with_auth(state, auth_config);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("taskmesh listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(task) = listener_task {
        task.abort();
    }
    orchestrator.shutdown().await;
    Ok(())
}

async fn list_agents(config: &TaskmeshConfig) -> anyhow::Result<()> {
    let registry = open_registry(config).await?;
    let agents = registry.list_all().await?;
    if agents.is_empty() {
        println!("No agents registered.");
        return Ok(());
    }

    println!("Registered agents:");
    for agent in &agents {
        println!(
            "  {} ({}) [{:?}] last heartbeat {}",
            agent.app_id,
            agent.name,
            agent.status,
            agent.last_heartbeat.to_rfc3339()
        );
        for cap in &agent.capabilities {
            println!("    {}: weight {:.2}", cap.name, cap.weight);
        }
    }
    println!("\nTotal: {} agent(s)", agents.len());
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
