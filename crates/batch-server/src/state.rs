//! Shared handler state, built once in `main` and cloned into every request.

use std::sync::Arc;

use batch_core::{Config, Database, FileBlobStore, Scheduler};
use tokio::sync::RwLock;

use batch_core::models::WorkerHeartbeat;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub blobs: FileBlobStore,
    pub scheduler: Arc<Scheduler>,
    pub heartbeat: Arc<RwLock<WorkerHeartbeat>>,
    pub config: Arc<Config>,
}
