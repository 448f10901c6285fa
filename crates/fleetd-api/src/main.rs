//! fleetd API server and worker pool.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use fleetd_api::{AppState, routes};
use fleetd_cloud::CloudManagers;
use fleetd_config::load_settings;
use fleetd_core::Environment;
use fleetd_core::host::HostStore;
use fleetd_core::registry::JobRegistry;
use fleetd_core::settings::{DatabaseSettings, Settings};
use fleetd_db::{MemoryHostStore, PgHostStore, create_pool, run_migrations};
use fleetd_scheduler::{LocalQueue, PgQueue, Queue, WorkerPool};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "fleetd-server")]
#[command(about = "fleetd host orchestration server", long_about = None)]
struct Args {
    /// Path to the KDL settings file
    #[arg(long, env = "FLEETD_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL URL; overrides the settings file. Without one, state is kept in memory.
    #[arg(long, env = "FLEETD_DATABASE_URL")]
    database_url: Option<String>,

    /// Address to serve the API on
    #[arg(long, env = "FLEETD_LISTEN")]
    listen: Option<String>,

    /// Number of job workers
    #[arg(long, env = "FLEETD_WORKERS")]
    workers: Option<usize>,

    #[arg(long, env = "FLEETD_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

impl Args {
    fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => load_settings(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?,
            None => Settings::default(),
        };

        if let Some(url) = &self.database_url {
            let max_connections = settings
                .database
                .as_ref()
                .map(|db| db.max_connections)
                .unwrap_or(10);
            settings.database = Some(DatabaseSettings {
                url: url.clone(),
                max_connections,
            });
        }
        if let Some(listen) = &self.listen {
            settings.api.listen = listen.clone();
        }
        if let Some(workers) = self.workers {
            settings.queue.workers = workers;
        }
        Ok(settings)
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Cancelled on SIGTERM or SIGINT.
fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }

        token_clone.cancel();
    });

    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let settings = Arc::new(args.settings()?);

    let mut registry = JobRegistry::new();
    fleetd_units::register_all(&mut registry)?;

    let (hosts, queue, pool) = match &settings.database {
        Some(database) => {
            info!("Connecting to database...");
            let pool = create_pool(database).await?;
            run_migrations(&pool).await?;
            info!("Database connected");
            (
                Arc::new(PgHostStore::new(pool.clone())) as Arc<dyn HostStore>,
                Arc::new(PgQueue::new(pool.clone(), registry)) as Arc<dyn Queue>,
                Some(pool),
            )
        }
        None => {
            warn!("No database configured, keeping hosts and jobs in memory");
            (
                Arc::new(MemoryHostStore::new()) as Arc<dyn HostStore>,
                Arc::new(LocalQueue::new(registry)) as Arc<dyn Queue>,
                None,
            )
        }
    };

    let env = Arc::new(Environment::new(
        settings.clone(),
        hosts,
        Arc::new(CloudManagers::new()),
    ));

    let pool_name = format!("fleetd-{}", uuid::Uuid::now_v7().simple());
    let workers = WorkerPool::start(&pool_name, queue.clone(), env.clone(), &settings.queue);

    let mut state = AppState::new(env, queue);
    if let Some(pool) = pool {
        state = state.with_pool(pool);
    }
    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let shutdown = install_shutdown_handler();
    let listener = TcpListener::bind(settings.api.listen.as_str())
        .await
        .with_context(|| format!("failed to bind {}", settings.api.listen))?;
    info!("Starting server on {}", settings.api.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    workers.shutdown().await;
    Ok(())
}
