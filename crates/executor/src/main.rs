//! flowrun executor server
//!
//! Serves the execution API and runs the executor loop and the trigger
//! scheduler in the same process.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowrun_executor::{
    config::{AppConfig, DatabaseConfig, StorageBackend},
    db::{
        self, ExecutionRepository, MemoryExecutionRepository, MemoryTriggerRepository,
        PostgresExecutionRepository, PostgresTriggerRepository, TriggerRepository,
    },
    engine::{DefaultConditionEvaluator, Execution, WorkerJob},
    flow::FlowRepository,
    handlers,
    queue::{MemoryQueue, NatsQueue, Queue, EXECUTIONS_SUBJECT, WORKER_JOBS_SUBJECT},
    services::Scheduler,
    state::AppState,
};

/// Initialize tracing/logging.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,flowrun_executor=debug,tower_http=debug".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Connect to NATS if configured.
async fn connect_nats(config: &AppConfig) -> Option<async_nats::Client> {
    if let Some(ref nats_url) = config.nats_url {
        match async_nats::connect(nats_url).await {
            Ok(client) => {
                tracing::info!(url = %nats_url, "Connected to NATS");
                Some(client)
            }
            Err(e) => {
                tracing::warn!(error = %e, url = %nats_url, "Failed to connect to NATS, using in-memory queues");
                None
            }
        }
    } else {
        tracing::info!("NATS not configured, using in-memory queues");
        None
    }
}

type Storage = (Arc<dyn ExecutionRepository>, Arc<dyn TriggerRepository>);

async fn open_storage(config: &AppConfig) -> anyhow::Result<Storage> {
    match config.storage {
        StorageBackend::Memory => {
            tracing::warn!("In-memory storage: executions are lost on restart");
            let executions: Arc<dyn ExecutionRepository> =
                Arc::new(MemoryExecutionRepository::new(config.lock_timeout()));
            let triggers: Arc<dyn TriggerRepository> = Arc::new(MemoryTriggerRepository::new());
            Ok((executions, triggers))
        }
        StorageBackend::Postgres => {
            let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load database config, using defaults");
                DatabaseConfig::default()
            });
            let pool = db::connect(&db_config).await?;
            let executions: Arc<dyn ExecutionRepository> = Arc::new(
                PostgresExecutionRepository::new(pool.clone(), config.lock_timeout()),
            );
            let triggers: Arc<dyn TriggerRepository> =
                Arc::new(PostgresTriggerRepository::new(pool));
            Ok((executions, triggers))
        }
    }
}

type Queues = (Arc<dyn Queue<Execution>>, Arc<dyn Queue<WorkerJob>>);

async fn open_queues(config: &AppConfig, nats: Option<&async_nats::Client>) -> anyhow::Result<Queues> {
    let queues: Queues = match nats {
        Some(client) => (
            Arc::new(NatsQueue::<Execution>::new(client.clone(), EXECUTIONS_SUBJECT).await?),
            Arc::new(NatsQueue::<WorkerJob>::new(client.clone(), WORKER_JOBS_SUBJECT).await?),
        ),
        None => (
            Arc::new(MemoryQueue::<Execution>::new(config.queue_capacity)),
            Arc::new(MemoryQueue::<WorkerJob>::new(config.queue_capacity)),
        ),
    };
    Ok(queues)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env();
    init_tracing(config.as_ref().map(|c| c.log_json).unwrap_or(false));

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting flowrun executor"
    );

    let app_config = config.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });

    tracing::info!(
        host = %app_config.host,
        port = app_config.port,
        storage = ?app_config.storage,
        lock_timeout_ms = app_config.lock_timeout_ms,
        "Configuration loaded"
    );

    let flows = Arc::new(FlowRepository::new());
    if let Some(dir) = &app_config.flows_dir {
        flows.load_dir(dir)?;
    }

    let (repository, triggers) = open_storage(&app_config).await?;
    let nats_client = connect_nats(&app_config).await;
    let (execution_queue, job_queue) = open_queues(&app_config, nats_client.as_ref()).await?;

    let state = AppState::new(
        app_config.clone(),
        repository,
        flows.clone(),
        execution_queue,
        job_queue,
        Arc::new(DefaultConditionEvaluator),
        nats_client,
    );

    let executor = state.executor.clone();
    let executor_task = tokio::spawn(async move {
        if let Err(e) = executor.run().await {
            tracing::error!(error = %e, "Executor loop stopped");
        }
    });

    let scheduler = Scheduler::new(
        triggers,
        flows,
        state.executor.clone(),
        app_config.scheduler_interval(),
    );
    let scheduler_task = tokio::spawn(async move {
        if let Err(e) = scheduler.run().await {
            tracing::error!(error = %e, "Scheduler stopped");
        }
    });

    // CORS configuration - allow all origins for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = handlers::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr: SocketAddr = app_config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, server = %app_config.server_name, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    executor_task.abort();
    scheduler_task.abort();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
