//! Admission control, FIFO dispatch, cancellation, expiry sweeping, and
//! worker heartbeat monitoring.
//!
//! The scheduler never touches the GPU itself; it only moves batches
//! between metadata-store states and wakes the [`crate::worker::Worker`]
//! when there's an oldest `validating` batch to hand off.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};

use crate::blobstore::FileBlobStore;
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{BatchJob, BatchStatus, FilePurpose, WorkerHeartbeat, WorkerStatus};

/// A dispatched batch id, sent to whoever is driving the worker loop.
pub type DispatchTx = mpsc::Sender<String>;
pub type DispatchRx = mpsc::Receiver<String>;

pub struct Scheduler {
    db: Database,
    blobs: FileBlobStore,
    config: Config,
    heartbeat: Arc<RwLock<WorkerHeartbeat>>,
}

impl Scheduler {
    pub fn new(db: Database, blobs: FileBlobStore, config: Config, heartbeat: Arc<RwLock<WorkerHeartbeat>>) -> Self {
        Self { db, blobs, config, heartbeat }
    }

    /// Validates and admits a new batch, returning it in `validating` state.
    /// Does not dispatch it — the dispatch loop picks it up on its next tick.
    pub async fn submit(
        &self,
        input_file_id: &str,
        endpoint: &str,
        completion_window_seconds: Option<i64>,
        metadata: std::collections::HashMap<String, serde_json::Value>,
        now: i64,
    ) -> Result<BatchJob> {
        if endpoint != crate::models::ENDPOINT_CHAT_COMPLETIONS {
            return Err(Error::invalid_request(format!("unsupported endpoint: {endpoint}")));
        }

        let file = self
            .db
            .get_file(input_file_id)
            .await?
            .ok_or_else(|| Error::invalid_request(format!("unknown input_file_id: {input_file_id}")))?;
        if file.deleted {
            return Err(Error::invalid_request("input_file_id refers to a deleted file"));
        }
        if file.purpose != FilePurpose::Batch {
            return Err(Error::invalid_request("input_file_id must have purpose=batch"));
        }

        let total_requests = self.count_request_lines(input_file_id).await?;
        if total_requests > self.config.max_requests_per_job {
            return Err(Error::invalid_request(format!(
                "file has {total_requests} requests, exceeding max_requests_per_job={}",
                self.config.max_requests_per_job
            )));
        }

        self.check_admission_capacity(total_requests).await?;

        let window = completion_window_seconds.unwrap_or(self.config.completion_window_seconds);
        let batch = BatchJob {
            id: crate::ids::new_batch_id(),
            object: "batch",
            endpoint: endpoint.to_string(),
            input_file_id: input_file_id.to_string(),
            output_file_id: None,
            error_file_id: None,
            status: BatchStatus::Validating,
            request_counts: crate::models::RequestCounts { total: total_requests as i64, completed: 0, failed: 0 },
            metadata,
            created_at: now,
            in_progress_at: None,
            finalizing_at: None,
            completed_at: None,
            failed_at: None,
            expired_at: None,
            cancelling_at: None,
            cancelled_at: None,
            expires_at: now + window,
            errors: None,
        };
        self.db.create_batch(&batch).await?;
        Ok(batch)
    }

    /// A zero-request file is legal (§8: a batch with zero requests is
    /// admitted and completes immediately).
    async fn count_request_lines(&self, input_file_id: &str) -> Result<u64> {
        let lines = self.blobs.open_lines(input_file_id).await?;
        Ok(lines.len() as u64)
    }

    async fn check_admission_capacity(&self, incoming_requests: u64) -> Result<()> {
        let in_flight = self.db.find_resumable().await?;
        let queue_depth = in_flight
            .iter()
            .filter(|b| matches!(b.status, BatchStatus::Validating | BatchStatus::InProgress))
            .count();
        if queue_depth >= self.config.max_queue_depth {
            return Err(Error::queue_full(format!(
                "queue depth {queue_depth} at limit {}",
                self.config.max_queue_depth
            )));
        }

        let queued_requests: i64 = in_flight
            .iter()
            .filter(|b| matches!(b.status, BatchStatus::Validating | BatchStatus::InProgress))
            .map(|b| b.request_counts.total)
            .sum();
        if queued_requests as u64 + incoming_requests > self.config.max_total_queued_requests {
            return Err(Error::queue_full(format!(
                "total queued requests would exceed max_total_queued_requests={}",
                self.config.max_total_queued_requests
            )));
        }

        Ok(())
    }

    pub async fn cancel(&self, batch_id: &str, now: i64) -> Result<BatchJob> {
        let moved = self
            .db
            .transition_batch(
                batch_id,
                &[BatchStatus::Validating, BatchStatus::InProgress],
                BatchStatus::Cancelling,
                "cancelling_at",
                now,
            )
            .await?;
        if !moved {
            let existing = self.db.get_batch(batch_id).await?.ok_or_else(|| Error::not_found(batch_id))?;
            return Err(Error::state_conflict(format!(
                "batch {batch_id} cannot be cancelled from status {}",
                existing.status
            )));
        }
        self.db.get_batch(batch_id).await?.ok_or_else(|| Error::not_found(batch_id))
    }

    /// Dispatches the oldest `validating` batch to `tx`, transitioning it to
    /// `in_progress`. No-op if nothing is waiting.
    async fn dispatch_next(&self, tx: &DispatchTx, now: i64) -> Result<()> {
        let Some(batch) = self.db.next_validating().await? else { return Ok(()) };
        let moved = self
            .db
            .transition_batch(&batch.id, &[BatchStatus::Validating], BatchStatus::InProgress, "in_progress_at", now)
            .await?;
        if moved {
            tracing::info!(batch_id = %batch.id, "dispatching batch to worker");
            let _ = tx.send(batch.id.clone()).await;
        }
        Ok(())
    }

    /// Background loop: polls for the next dispatchable batch every tick.
    pub async fn run_dispatch_loop(self: Arc<Self>, tx: DispatchTx, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = unix_now();
                    if let Err(err) = self.dispatch_next(&tx, now).await {
                        tracing::error!(%err, "dispatch tick failed");
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("dispatch loop shutting down");
                    break;
                }
            }
        }
    }

    /// Background loop: expires batches past `expires_at`.
    pub async fn run_expiry_sweeper(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = unix_now();
                    match self.db.find_expired(now).await {
                        Ok(expired) => {
                            for batch in expired {
                                if let Err(err) = self
                                    .db
                                    .transition_batch(
                                        &batch.id,
                                        &[BatchStatus::Validating, BatchStatus::InProgress, BatchStatus::Finalizing],
                                        BatchStatus::Expired,
                                        "expired_at",
                                        now,
                                    )
                                    .await
                                {
                                    tracing::error!(batch_id = %batch.id, %err, "failed to expire batch");
                                }
                            }
                        }
                        Err(err) => tracing::error!(%err, "expiry sweep query failed"),
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("expiry sweeper shutting down");
                    break;
                }
            }
        }
    }

    /// Background loop: flags the worker dead once its heartbeat goes stale.
    /// The in-flight batch is left `in_progress`; it resumes once the
    /// worker's heartbeat recovers or an operator restarts the process.
    pub async fn run_heartbeat_monitor(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        let dead_after = self.config.heartbeat_dead_after();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut hb = self.heartbeat.write().await;
                    if Duration::from_secs(hb.age_seconds().max(0) as u64) > dead_after && hb.status != WorkerStatus::Dead {
                        tracing::warn!("worker heartbeat stale, marking dead");
                        hb.status = WorkerStatus::Dead;
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("heartbeat monitor shutting down");
                    break;
                }
            }
        }
    }

    /// Background loop: hard-deletes files soft-deleted more than
    /// `cleanup_after_days` ago, blob then row so a crash mid-sweep never
    /// leaves a metadata row pointing at a missing blob.
    pub async fn run_retention_sweeper(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        let retention_seconds = self.config.cleanup_after_days.max(0) * 86_400;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let cutoff = unix_now() - retention_seconds;
                    match self.db.find_files_due_for_purge(cutoff).await {
                        Ok(due) => {
                            for file in due {
                                if let Err(err) = self.blobs.delete(&file.id).await {
                                    tracing::error!(file_id = %file.id, %err, "retention sweep: failed to delete blob");
                                    continue;
                                }
                                if let Err(err) = self.db.purge_file(&file.id).await {
                                    tracing::error!(file_id = %file.id, %err, "retention sweep: failed to purge file row");
                                }
                            }
                        }
                        Err(err) => tracing::error!(%err, "retention sweep query failed"),
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("retention sweeper shutting down");
                    break;
                }
            }
        }
    }

    pub async fn is_worker_alive(&self) -> bool {
        let hb = self.heartbeat.read().await;
        hb.status != WorkerStatus::Dead
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileObject, RequestCounts};

    fn sample_batch(status: BatchStatus) -> BatchJob {
        BatchJob {
            id: crate::ids::new_batch_id(),
            object: "batch",
            endpoint: crate::models::ENDPOINT_CHAT_COMPLETIONS.into(),
            input_file_id: "file-1".into(),
            output_file_id: None,
            error_file_id: None,
            status,
            request_counts: RequestCounts::default(),
            metadata: Default::default(),
            created_at: 0,
            in_progress_at: None,
            finalizing_at: None,
            completed_at: None,
            failed_at: None,
            expired_at: None,
            cancelling_at: None,
            cancelled_at: None,
            expires_at: 100,
            errors: None,
        }
    }

    async fn scheduler_with_db(dir: &tempfile::TempDir) -> (Scheduler, Database) {
        let db = Database::open(":memory:").await.unwrap();
        let blobs = FileBlobStore::new(dir.path()).unwrap();
        let mut config = Config::from_env().unwrap();
        config.max_queue_depth = 2;
        config.max_total_queued_requests = 10;
        config.max_requests_per_job = 5;
        let heartbeat = Arc::new(RwLock::new(WorkerHeartbeat::new()));
        (Scheduler::new(db.clone(), blobs, config, heartbeat), db)
    }

    #[tokio::test]
    async fn test_cancel_on_terminal_batch_is_state_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, db) = scheduler_with_db(&dir).await;
        let batch = sample_batch(BatchStatus::Completed);
        db.create_batch(&batch).await.unwrap();

        let result = scheduler.cancel(&batch.id, 100).await;
        assert!(matches!(result, Err(Error::StateConflict(_))));
    }

    #[tokio::test]
    async fn test_cancel_unknown_batch_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _db) = scheduler_with_db(&dir).await;
        let result = scheduler.cancel("batch_missing", 100).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_submit_rejects_unknown_file() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _db) = scheduler_with_db(&dir).await;
        let result = scheduler
            .submit("file-missing", crate::models::ENDPOINT_CHAT_COMPLETIONS, None, Default::default(), 0)
            .await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_submit_rejects_wrong_purpose() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, db) = scheduler_with_db(&dir).await;
        let file = FileObject::new(
            "file-out-1".into(),
            FilePurpose::BatchOutput,
            "out.jsonl".into(),
            10,
            "/tmp/out".into(),
        );
        db.create_file(&file).await.unwrap();
        let result = scheduler
            .submit(&file.id, crate::models::ENDPOINT_CHAT_COMPLETIONS, None, Default::default(), 0)
            .await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_submit_admits_zero_request_file() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, db) = scheduler_with_db(&dir).await;
        let file = FileObject::new("file-1".into(), FilePurpose::Batch, "in.jsonl".into(), 0, "".into());
        db.create_file(&file).await.unwrap();
        scheduler.blobs.put(&file.id, b"").await.unwrap();

        let batch = scheduler
            .submit(&file.id, crate::models::ENDPOINT_CHAT_COMPLETIONS, None, Default::default(), 0)
            .await
            .unwrap();
        assert_eq!(batch.request_counts.total, 0);
        assert_eq!(batch.status, BatchStatus::Validating);
    }

    #[tokio::test]
    async fn test_submit_rejects_when_queue_depth_at_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, db) = scheduler_with_db(&dir).await;
        // max_queue_depth is 2 (scheduler_with_db); two validating batches
        // already occupy it.
        for _ in 0..2 {
            let file = FileObject::new(crate::ids::new_input_file_id(), FilePurpose::Batch, "in.jsonl".into(), 0, "".into());
            db.create_file(&file).await.unwrap();
            scheduler.blobs.put(&file.id, b"").await.unwrap();
            scheduler
                .submit(&file.id, crate::models::ENDPOINT_CHAT_COMPLETIONS, None, Default::default(), 0)
                .await
                .unwrap();
        }

        let file = FileObject::new(crate::ids::new_input_file_id(), FilePurpose::Batch, "in.jsonl".into(), 0, "".into());
        db.create_file(&file).await.unwrap();
        scheduler.blobs.put(&file.id, b"").await.unwrap();
        let result = scheduler
            .submit(&file.id, crate::models::ENDPOINT_CHAT_COMPLETIONS, None, Default::default(), 0)
            .await;
        assert!(matches!(result, Err(Error::QueueFull(_))));
    }

    #[tokio::test]
    async fn test_submit_rejects_when_total_queued_requests_exceeds_limit() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(":memory:").await.unwrap();
        let blobs = FileBlobStore::new(dir.path()).unwrap();
        let mut config = Config::from_env().unwrap();
        config.max_queue_depth = 10; // high enough that only the request total trips admission
        config.max_total_queued_requests = 10;
        config.max_requests_per_job = 5;
        let heartbeat = Arc::new(RwLock::new(WorkerHeartbeat::new()));
        let scheduler = Scheduler::new(db.clone(), blobs, config, heartbeat);

        // Two 5-request batches exactly fill the total; a third of any size
        // should be rejected on total-queued-requests grounds.
        for _ in 0..2 {
            let file = FileObject::new(crate::ids::new_input_file_id(), FilePurpose::Batch, "in.jsonl".into(), 0, "".into());
            db.create_file(&file).await.unwrap();
            let lines: String = (0..5).map(|i| format!("{{\"custom_id\":\"r{i}\"}}\n")).collect();
            scheduler.blobs.put(&file.id, lines.as_bytes()).await.unwrap();
            scheduler
                .submit(&file.id, crate::models::ENDPOINT_CHAT_COMPLETIONS, None, Default::default(), 0)
                .await
                .unwrap();
        }

        let file = FileObject::new(crate::ids::new_input_file_id(), FilePurpose::Batch, "in.jsonl".into(), 0, "".into());
        db.create_file(&file).await.unwrap();
        scheduler.blobs.put(&file.id, b"{\"custom_id\":\"r0\"}\n").await.unwrap();
        let result = scheduler
            .submit(&file.id, crate::models::ENDPOINT_CHAT_COMPLETIONS, None, Default::default(), 0)
            .await;
        assert!(matches!(result, Err(Error::QueueFull(_))));
    }

    #[tokio::test]
    async fn test_submit_rejects_over_max_requests_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, db) = scheduler_with_db(&dir).await;
        let file = FileObject::new("file-1".into(), FilePurpose::Batch, "in.jsonl".into(), 0, "".into());
        db.create_file(&file).await.unwrap();
        let lines: String = (0..6).map(|i| format!("{{\"custom_id\":\"r{i}\"}}\n")).collect();
        scheduler.blobs.put(&file.id, lines.as_bytes()).await.unwrap();

        let result = scheduler
            .submit(&file.id, crate::models::ENDPOINT_CHAT_COMPLETIONS, None, Default::default(), 0)
            .await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }
}
