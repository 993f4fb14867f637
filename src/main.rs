use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use tenantd::{
    config,
    db::{self, pool::DbPool},
    runtime::{network, ContainerRuntime, DockerCli},
    state,
    tenant::plan,
};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "tenantd", about = "Tenant provisioning orchestrator", version)]
struct Cli {
    /// Path to TOML config file
    #[arg(short, long, default_value = "tenantd.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialise data directories, database, stock plans and docker network
    Bootstrap,
    /// Start the HTTP API server
    Serve,
}

// ── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenantd=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;

    match cli.command {
        Commands::Bootstrap => bootstrap(cfg).await,
        Commands::Serve => serve(cfg).await,
    }
}

// ── Bootstrap ──────────────────────────────────────────────────────────────

async fn bootstrap(cfg: config::PlatformConfig) -> anyhow::Result<()> {
    info!("Starting bootstrap...");

    if let Some(parent) = cfg.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db dir: {}", parent.display()))?;
        }
    }

    let db_path = cfg
        .database_path
        .to_str()
        .context("database_path is not valid UTF-8")?;
    let db = DbPool::open(db_path, 1).context("failed to open database")?;
    db::run_migrations(&db).context("failed to run database migrations")?;
    info!("Database migrations applied");

    db.write(plan::seed_defaults)
        .context("failed to seed default plans")?;
    info!("Stock plans present");

    let runtime = DockerCli;
    if runtime.ping() {
        info!("Container engine is reachable");
        if let Err(e) = network::ensure_network(&cfg.docker_network) {
            tracing::warn!("Failed to create docker network: {}", e);
        }
    } else {
        tracing::warn!("Container engine not responding — provisioning will not work");
    }

    info!("Bootstrap complete.");
    Ok(())
}

// ── Serve ──────────────────────────────────────────────────────────────────

async fn serve(mut cfg: config::PlatformConfig) -> anyhow::Result<()> {
    info!("Opening database (4 reader connections)...");
    let db_path = cfg
        .database_path
        .to_str()
        .context("database_path is not valid UTF-8")?;
    let db = Arc::new(DbPool::open(db_path, 4).context("failed to open database")?);
    db::run_migrations(&db).context("failed to run database migrations")?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli);
    if !runtime.ping() {
        tracing::warn!("Container engine not responding — provisioning will fail until it is up");
    } else {
        match network::resolve_network(&cfg.docker_network) {
            Ok(name) => {
                info!("Tenant network: {}", name);
                cfg.docker_network = name;
            }
            Err(e) => tracing::warn!("Network discovery failed: {}", e),
        }
    }

    let state = state::build_state(cfg.clone(), db, runtime);
    let app = tenantd::routes::app(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid bind address")?;

    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind TCP listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Server stopped.");
    Ok(())
}

// ── Graceful shutdown ──────────────────────────────────────────────────────

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("Shutdown signal received, stopping server...");
}
