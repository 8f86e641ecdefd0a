/// Server setup and initialization
///
/// Wires together all components: database, steps tables, step
/// implementations, lane gate, router, workers, maintenance jobs and HTTP
/// routes.

use crate::{
    api::{create_lane_routes, create_workflow_routes, AppState},
    config::Config,
    database,
    lane::{gate::SequenceGate, storage::CronProcessStorage, types::LaneKey},
    runtime::{
        dispatch::ChannelDispatcher,
        reconcile::Reconciler,
        router::WorkflowRouter,
        scheduler::MaintenanceScheduler,
        step::StepHandlers,
        worker::{LaneWorker, WorkerSettings},
    },
    steps::builtin_handlers,
    workflow::{
        registry::StepsConfigRegistry,
        storage::WorkflowStorage,
        types::WorkflowKind,
    },
};
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch};

/// Shared engine components
#[derive(Debug, Clone)]
pub struct Engine {
    pub gate: Arc<SequenceGate>,
    pub router: Arc<WorkflowRouter>,
    pub dispatcher: Arc<ChannelDispatcher>,
    pub reconciler: Arc<Reconciler>,
}

/// Workflow kinds named in the config, parsed
pub fn enabled_kinds(config: &Config) -> Result<Vec<WorkflowKind>> {
    config
        .worker
        .enabled_kinds
        .iter()
        .map(|raw| {
            raw.parse::<WorkflowKind>()
                .with_context(|| format!("ECONOMYFLOW_ENABLED_KINDS entry '{}'", raw))
        })
        .collect()
}

/// Build the engine on `pool` for the enabled kinds
///
/// Fails fast when a steps table does not compile or when the handler
/// bindings of an enabled kind do not match its table.
pub fn build_engine(config: &Config, pool: SqlitePool, handlers: StepHandlers) -> Result<Engine> {
    let kinds = enabled_kinds(config)?;

    tracing::info!("📊 Compiling steps tables");
    let builtin = StepsConfigRegistry::builtin().context("Failed to compile built-in steps tables")?;

    let mut registry = StepsConfigRegistry::new();
    for kind in &kinds {
        let table = builtin
            .get(*kind)
            .with_context(|| format!("No steps table for {}", kind))?;
        handlers
            .validate(*kind, &table)
            .with_context(|| format!("Step implementations for {} are incomplete", kind))?;
        registry.register((*table).clone());
    }
    tracing::info!("✅ Enabled workflow kinds: {:?}", registry.kinds());

    let gate = Arc::new(SequenceGate::new(CronProcessStorage::new(pool.clone())));
    let dispatcher = Arc::new(ChannelDispatcher::new());
    let router = Arc::new(WorkflowRouter::new(
        WorkflowStorage::new(pool),
        Arc::new(registry),
        Arc::new(handlers),
        dispatcher.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&router),
        Duration::from_secs(config.maintenance.pending_timeout_secs),
        Duration::from_secs(config.maintenance.queued_timeout_secs),
    ));

    Ok(Engine {
        gate,
        router,
        dispatcher,
        reconciler,
    })
}

/// Create the main Axum application with all routes
pub fn create_app(engine: &Engine) -> Router {
    let app_state = AppState {
        router: Arc::clone(&engine.router),
        gate: Arc::clone(&engine.gate),
    };

    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        // Workflow trigger and lane operator routes
        .merge(create_workflow_routes().with_state(app_state.clone()))
        .merge(create_lane_routes().with_state(app_state))
}

/// Spawn one worker per configured lane
pub fn spawn_workers(
    config: &Config,
    engine: &Engine,
    shutdown: &watch::Receiver<bool>,
) -> Result<Vec<tokio::task::JoinHandle<()>>> {
    let settings = WorkerSettings {
        poll_interval: Duration::from_secs(config.worker.poll_interval_secs),
        retry_delay: Duration::from_millis(config.worker.retry_delay_ms),
        default_prefetch: config.worker.default_prefetch,
    };

    config
        .worker
        .lanes
        .iter()
        .map(|raw| {
            let lane_key: LaneKey = raw
                .parse()
                .with_context(|| format!("ECONOMYFLOW_WORKER_LANES entry '{}'", raw))?;
            let worker = LaneWorker::new(
                lane_key,
                Arc::clone(&engine.gate),
                Arc::clone(&engine.router),
                Arc::clone(&engine.dispatcher),
                settings,
            );
            Ok::<_, anyhow::Error>(worker.spawn(shutdown.clone()))
        })
        .collect()
}

/// Start the HTTP server, workers and maintenance jobs
///
/// Runs until ctrl-c, then stops workers (releasing their lanes) and the scheduler.
pub async fn start_server(config: Config) -> Result<()> {
    tracing::info!("Starting economyflow server...");

    let pool = database::connect(&config.database)
        .await
        .context("Failed to open database")?;
    let kinds = enabled_kinds(&config)?;
    let engine = build_engine(&config, pool, builtin_handlers(&kinds))?;

    tracing::info!("⏰ Initializing maintenance scheduler");
    let scheduler = MaintenanceScheduler::new(
        Arc::clone(&engine.gate),
        Arc::clone(&engine.reconciler),
        config.maintenance.clone(),
    )
    .await
    .context("Failed to initialize maintenance scheduler")?;
    scheduler.start().await.context("Failed to start maintenance scheduler")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(&config, &engine, &shutdown_rx)?;
    tracing::info!("👷 Spawned {} lane worker(s)", workers.len());

    let app = create_app(&engine);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("❌ Failed to listen for ctrl-c: {}", e);
            }
        })
        .await?;

    tracing::info!("⏹️ Shutting down workers");
    shutdown_tx.send_replace(true);
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!("❌ Worker task panicked: {}", e);
        }
    }
    scheduler.stop().await?;

    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
