//! Process entry point: loads configuration, wires up the metadata store,
//! blob store, scheduler, and worker, then serves the HTTP API.
//!
//! Exit codes follow the server's contract: 0 on clean shutdown, 1 on
//! startup configuration error, 2 on unrecoverable storage error.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing_subscriber::{fmt, EnvFilter};

use batch_core::config::Config;
use batch_core::db::Database;
use batch_core::blobstore::FileBlobStore;
use batch_core::engine::HttpInferenceEngine;
use batch_core::handlers::webhook::WebhookHandler;
use batch_core::handlers::HandlerRegistry;
use batch_core::models::WorkerHeartbeat;
use batch_core::scheduler::Scheduler;
use batch_core::worker::Worker;

use batch_server::state::AppState;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter);
    if config.json_logging {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };
    init_tracing(&config);

    if let Err(err) = run(config).await {
        tracing::error!(%err, "unrecoverable storage error");
        std::process::exit(2);
    }
}

async fn run(config: Config) -> batch_core::Result<()> {
    let db = Database::open(&config.database_path).await?;
    let blobs = FileBlobStore::new(&config.storage_path)?;
    let heartbeat = Arc::new(RwLock::new(WorkerHeartbeat::new()));

    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(WebhookHandler::new(
        config.retry_attempts,
        std::time::Duration::from_secs(30),
    )));

    let engine = Arc::new(HttpInferenceEngine::new(config.engine_base_url.clone()));
    // Worker-visible GPU memory budget: the optimizer needs a number to
    // weigh model profiles against. Absent a real GPU query, MAX_MODEL_LEN's
    // companion GPU_MEMORY_UTILIZATION tuning knob implies the deployer
    // already knows this figure; a conservative 24 GiB default covers a
    // typical single consumer/workstation GPU.
    let total_memory_gb = 24.0_f32;

    let worker = Arc::new(Worker::new(
        db.clone(),
        blobs.clone(),
        config.clone(),
        heartbeat.clone(),
        engine,
        handlers,
        total_memory_gb,
    ));

    let scheduler = Arc::new(Scheduler::new(db.clone(), blobs.clone(), config.clone(), heartbeat.clone()));

    worker.resume_pending().await?;

    let (dispatch_tx, dispatch_rx) = mpsc::channel(16);

    let (dispatch_shutdown_tx, dispatch_shutdown_rx) = oneshot::channel();
    let (expiry_shutdown_tx, expiry_shutdown_rx) = oneshot::channel();
    let (heartbeat_shutdown_tx, heartbeat_shutdown_rx) = oneshot::channel();
    let (retention_shutdown_tx, retention_shutdown_rx) = oneshot::channel();
    let (worker_shutdown_tx, worker_shutdown_rx) = oneshot::channel();

    let dispatch_handle = tokio::spawn(scheduler.clone().run_dispatch_loop(dispatch_tx, dispatch_shutdown_rx));
    let expiry_handle = tokio::spawn(scheduler.clone().run_expiry_sweeper(expiry_shutdown_rx));
    let heartbeat_handle = tokio::spawn(scheduler.clone().run_heartbeat_monitor(heartbeat_shutdown_rx));
    let retention_handle = tokio::spawn(scheduler.clone().run_retention_sweeper(retention_shutdown_rx));
    let worker_handle = tokio::spawn(worker.clone().run_dispatch_consumer(dispatch_rx, worker_shutdown_rx));

    let state = AppState {
        db,
        blobs,
        scheduler: scheduler.clone(),
        heartbeat,
        config: Arc::new(config.clone()),
    };
    let app = batch_server::create_router(state);

    let listener = tokio::net::TcpListener::bind(config.socket_addr())
        .await
        .map_err(|e| batch_core::Error::internal(format!("failed to bind {}: {e}", config.socket_addr())))?;
    tracing::info!(addr = %config.socket_addr(), "batch-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| batch_core::Error::internal(format!("server error: {e}")))?;

    for (name, tx) in [
        ("dispatch", dispatch_shutdown_tx),
        ("expiry", expiry_shutdown_tx),
        ("heartbeat", heartbeat_shutdown_tx),
        ("retention", retention_shutdown_tx),
        ("worker", worker_shutdown_tx),
    ] {
        if tx.send(()).is_err() {
            tracing::warn!(loop_name = name, "background loop already stopped");
        }
    }
    let _ = tokio::join!(dispatch_handle, expiry_handle, heartbeat_handle, retention_handle, worker_handle);

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
