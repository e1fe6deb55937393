//! The single-process consumer that drives batches to completion: model
//! hot-swap, chunked execution against the inference engine, incremental
//! persistence, resume-after-crash, and finalization.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex, RwLock};

use crate::blobstore::FileBlobStore;
use crate::config::Config;
use crate::db::Database;
use crate::engine::optimizer::{MemoryOptimizer, ModelProfileTable};
use crate::engine::{InferenceEngine, LoadOutcome};
use crate::error::{Error, Result};
use crate::handlers::HandlerRegistry;
use crate::ids;
use crate::models::{
    BatchJob, BatchRequestLine, BatchResultLine, BatchStatus, EngineConfig, RequestCounts, WorkerHeartbeat,
    WorkerStatus,
};
use crate::scheduler::DispatchRx;

/// Why a batch's chunk loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    InputExhausted,
    Cancelled,
    Expired,
}

pub struct Worker {
    db: Database,
    blobs: FileBlobStore,
    config: Config,
    heartbeat: Arc<RwLock<WorkerHeartbeat>>,
    engine: Arc<dyn InferenceEngine>,
    optimizer: MemoryOptimizer,
    handlers: HandlerRegistry,
    /// The `EngineConfig` the currently loaded model was loaded with, kept
    /// around so an OOM mid-run can be retried with `optimizer.shrink`.
    current_config: Mutex<Option<EngineConfig>>,
}

impl Worker {
    pub fn new(
        db: Database,
        blobs: FileBlobStore,
        config: Config,
        heartbeat: Arc<RwLock<WorkerHeartbeat>>,
        engine: Arc<dyn InferenceEngine>,
        handlers: HandlerRegistry,
        total_memory_gb: f32,
    ) -> Self {
        let optimizer = MemoryOptimizer::new(ModelProfileTable::with_known_profiles(), total_memory_gb);
        Self { db, blobs, config, heartbeat, engine, optimizer, handlers, current_config: Mutex::new(None) }
    }

    /// Consumes dispatched batch ids from the scheduler until `shutdown` fires.
    ///
    /// A tick on `heartbeat_interval` keeps the heartbeat fresh while idle —
    /// without it, an idle-but-alive worker goes stale past
    /// `heartbeat_interval × heartbeat_dead_multiplier` and the scheduler's
    /// heartbeat monitor wrongly declares it dead.
    pub async fn run_dispatch_consumer(self: Arc<Self>, mut rx: DispatchRx, mut shutdown: oneshot::Receiver<()>) {
        let mut heartbeat_tick = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            tokio::select! {
                next = rx.recv() => {
                    let Some(batch_id) = next else { break };
                    if let Err(err) = self.process_batch(&batch_id).await {
                        tracing::error!(batch_id = %batch_id, %err, "batch processing failed");
                    }
                }
                _ = heartbeat_tick.tick() => {
                    self.refresh_liveness().await;
                }
                _ = &mut shutdown => {
                    tracing::info!("worker shutting down");
                    break;
                }
            }
        }
    }

    /// Refreshes `last_seen` without changing `loaded_model`. Recovers a
    /// heartbeat the monitor had already flagged `dead`, since this loop
    /// running at all proves the worker is alive.
    async fn refresh_liveness(&self) {
        let mut hb = self.heartbeat.write().await;
        let status = if hb.status == WorkerStatus::Dead { WorkerStatus::Idle } else { hb.status };
        hb.touch(status);
    }

    /// Called once at boot: re-hands every non-terminal batch back to the
    /// worker loop so a crash never loses progress beyond the active chunk.
    pub async fn resume_pending(&self) -> Result<()> {
        for batch in self.db.find_resumable().await? {
            tracing::info!(batch_id = %batch.id, status = %batch.status, "resuming batch at startup");
            self.process_batch(&batch.id).await?;
        }
        Ok(())
    }

    async fn touch_heartbeat(&self, status: WorkerStatus, loaded_model: Option<String>) {
        let mut hb = self.heartbeat.write().await;
        hb.touch(status);
        if loaded_model.is_some() {
            hb.loaded_model = loaded_model;
        }
    }

    pub async fn process_batch(&self, batch_id: &str) -> Result<()> {
        let Some(mut batch) = self.db.get_batch(batch_id).await? else {
            tracing::warn!(batch_id, "dispatched batch no longer exists");
            return Ok(());
        };
        if batch.status.is_terminal() {
            return Ok(());
        }

        let now = unix_now();
        if batch.status == BatchStatus::Validating {
            self.db
                .transition_batch(batch_id, &[BatchStatus::Validating], BatchStatus::InProgress, "in_progress_at", now)
                .await?;
            batch.status = BatchStatus::InProgress;
        }

        if batch.status == BatchStatus::InProgress {
            let target_model = self.resolve_target_model(&batch).await?;
            if let Some(model_id) = target_model {
                if let Err(err) = self.ensure_model_loaded(&model_id).await {
                    self.fail_batch(&batch, format!("engine load failed: {err}")).await?;
                    return Ok(());
                }
            }

            let stop_reason = self.run_chunks(&batch).await?;
            self.finalize(&batch, stop_reason).await?;
        } else if batch.status == BatchStatus::Cancelling {
            self.finalize(&batch, StopReason::Cancelled).await?;
        }

        Ok(())
    }

    /// The model a batch wants: first request's `body.model`, else
    /// `metadata.model`. A batch with zero requests and no model hint
    /// simply keeps whatever is already loaded.
    async fn resolve_target_model(&self, batch: &BatchJob) -> Result<Option<String>> {
        if let Some(hint) = batch.metadata_model_hint() {
            return Ok(Some(hint));
        }
        let lines = self.blobs.open_lines(&batch.input_file_id).await.or_else(empty_on_missing)?;
        if let Some(first) = lines.first() {
            let request: BatchRequestLine = serde_json::from_str(first)?;
            return Ok(request.model().map(str::to_string));
        }
        Ok(None)
    }

    async fn ensure_model_loaded(&self, model_id: &str) -> Result<()> {
        let already_loaded = self.heartbeat.read().await.loaded_model.as_deref() == Some(model_id);
        if already_loaded {
            return Ok(());
        }

        self.touch_heartbeat(WorkerStatus::Unloading, None).await;
        if let Some(current) = self.heartbeat.read().await.loaded_model.clone() {
            self.engine.unload_model(&current).await?;
        }

        self.touch_heartbeat(WorkerStatus::Loading, None).await;
        let config = self.optimizer.optimize(model_id, self.config.max_model_len);
        match self.engine.load_model(&config).await? {
            LoadOutcome::Loaded => {
                *self.current_config.lock().await = Some(config);
                self.touch_heartbeat(WorkerStatus::Busy, Some(model_id.to_string())).await;
                Ok(())
            }
            LoadOutcome::OutOfMemory => {
                let shrunk = self.optimizer.shrink(&config);
                tracing::warn!(model_id, "out of memory at initial config, retrying with shrunk config");
                match self.engine.load_model(&shrunk).await? {
                    LoadOutcome::Loaded => {
                        *self.current_config.lock().await = Some(shrunk);
                        self.touch_heartbeat(WorkerStatus::Busy, Some(model_id.to_string())).await;
                        Ok(())
                    }
                    LoadOutcome::OutOfMemory => {
                        Err(Error::processing(format!("out of memory loading {model_id} even after shrinking config")))
                    }
                }
            }
        }
    }

    /// Runs chunks until the input is exhausted or the batch is observed to
    /// be `cancelling`/`expired`. Already-completed `custom_id`s (from a
    /// prior crash) are skipped so resume is idempotent.
    async fn run_chunks(&self, batch: &BatchJob) -> Result<StopReason> {
        let output_id = ids::output_file_id_for_batch(&batch.id);
        let error_id = ids::error_file_id_for_batch(&batch.id);

        let done_ids = self.already_completed_custom_ids(&output_id, &error_id).await?;

        let input_lines = self.blobs.open_lines(&batch.input_file_id).await.or_else(empty_on_missing)?;
        let mut pending: Vec<BatchRequestLine> = Vec::with_capacity(input_lines.len());
        for line in &input_lines {
            let request: BatchRequestLine = serde_json::from_str(line)?;
            if !done_ids.contains(&request.custom_id) {
                pending.push(request);
            }
        }

        for chunk in pending.chunks(self.config.chunk_size.max(1)) {
            let current = self.db.get_batch(&batch.id).await?.ok_or_else(|| Error::not_found(&batch.id))?;
            if current.status == BatchStatus::Cancelling {
                return Ok(StopReason::Cancelled);
            }
            if unix_now() >= current.expires_at {
                return Ok(StopReason::Expired);
            }

            let results = self.run_chunk_with_retry(chunk).await?;

            let mut completed_delta = 0_i64;
            let mut failed_delta = 0_i64;
            for result in &results {
                let line = serde_json::to_string(result)?;
                if result.is_success() {
                    self.blobs.append_line(&output_id, &line).await?;
                    completed_delta += 1;
                } else {
                    self.blobs.append_line(&error_id, &line).await?;
                    failed_delta += 1;
                }
            }
            self.db.bump_counts(&batch.id, completed_delta, failed_delta).await?;
            self.touch_heartbeat(WorkerStatus::Busy, None).await;
        }

        Ok(StopReason::InputExhausted)
    }

    /// §4.4: a chunk-level engine crash is retried once; if it fails again,
    /// every request left in the chunk is recorded as an error result.
    async fn run_chunk_with_retry(&self, chunk: &[BatchRequestLine]) -> Result<Vec<BatchResultLine>> {
        match self.engine.run_chunk(chunk).await {
            Ok(results) => Ok(results),
            Err(first_err) => {
                tracing::warn!(%first_err, "chunk failed, retrying once");
                match self.engine.run_chunk(chunk).await {
                    Ok(results) => Ok(results),
                    Err(second_err) => {
                        tracing::error!(%second_err, "chunk failed twice, recording all requests as errors");
                        Ok(chunk
                            .iter()
                            .map(|r| BatchResultLine {
                                id: ids::new_result_id(),
                                custom_id: r.custom_id.clone(),
                                response: None,
                                error: Some(crate::models::BatchResultError {
                                    code: "engine_error".to_string(),
                                    message: second_err.to_string(),
                                }),
                            })
                            .collect())
                    }
                }
            }
        }
    }

    async fn already_completed_custom_ids(&self, output_id: &str, error_id: &str) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for id in [output_id, error_id] {
            let lines = self.blobs.open_lines(id).await.or_else(empty_on_missing)?;
            for line in lines {
                if let Ok(result) = serde_json::from_str::<BatchResultLine>(&line) {
                    ids.insert(result.custom_id);
                }
            }
        }
        Ok(ids)
    }

    async fn finalize(&self, batch: &BatchJob, reason: StopReason) -> Result<()> {
        let now = unix_now();
        self.db
            .transition_batch(
                &batch.id,
                &[BatchStatus::InProgress, BatchStatus::Cancelling],
                BatchStatus::Finalizing,
                "finalizing_at",
                now,
            )
            .await?;

        let output_id = ids::output_file_id_for_batch(&batch.id);
        let error_id = ids::error_file_id_for_batch(&batch.id);
        let output_lines = self.blobs.open_lines(&output_id).await.or_else(empty_on_missing)?;
        let error_lines = self.blobs.open_lines(&error_id).await.or_else(empty_on_missing)?;

        let mut output_file_id = None;
        let mut error_file_id = None;
        if !output_lines.is_empty() {
            let size = self.blobs.size(&output_id).await?;
            let file = crate::models::FileObject::new(
                output_id.clone(),
                crate::models::FilePurpose::BatchOutput,
                format!("{}-output.jsonl", batch.id),
                size,
                self.blobs.path_for(&output_id).display().to_string(),
            );
            self.db.create_file(&file).await?;
            output_file_id = Some(output_id.clone());
        }
        if !error_lines.is_empty() {
            let size = self.blobs.size(&error_id).await?;
            let file = crate::models::FileObject::new(
                error_id.clone(),
                crate::models::FilePurpose::BatchError,
                format!("{}-error.jsonl", batch.id),
                size,
                self.blobs.path_for(&error_id).display().to_string(),
            );
            self.db.create_file(&file).await?;
            error_file_id = Some(error_id.clone());
        }
        self.db.set_output_files(&batch.id, output_file_id.as_deref(), error_file_id.as_deref()).await?;

        let terminal = match reason {
            StopReason::Cancelled => BatchStatus::Cancelled,
            StopReason::Expired => BatchStatus::Expired,
            StopReason::InputExhausted => {
                if output_lines.is_empty() && !error_lines.is_empty() {
                    BatchStatus::Failed
                } else {
                    BatchStatus::Completed
                }
            }
        };
        let timestamp_column = match terminal {
            BatchStatus::Completed => "completed_at",
            BatchStatus::Failed => "failed_at",
            BatchStatus::Expired => "expired_at",
            BatchStatus::Cancelled => "cancelled_at",
            _ => unreachable!("finalize only produces terminal statuses"),
        };
        self.db
            .transition_batch(&batch.id, &[BatchStatus::Finalizing], terminal, timestamp_column, now)
            .await?;

        self.touch_heartbeat(WorkerStatus::Idle, None).await;

        if let Some(mut finished) = self.db.get_batch(&batch.id).await? {
            finished.output_file_id = output_file_id;
            finished.error_file_id = error_file_id;
            let outcomes = self.handlers.process(&finished).await;
            for (name, ok) in outcomes {
                if !ok {
                    tracing::warn!(batch_id = %batch.id, handler = %name, "result handler reported failure");
                }
            }
        }

        Ok(())
    }

    async fn fail_batch(&self, batch: &BatchJob, error: String) -> Result<()> {
        tracing::error!(batch_id = %batch.id, %error, "batch failed");
        self.db.set_errors(&batch.id, &[error]).await?;
        self.db
            .transition_batch(
                &batch.id,
                &[BatchStatus::InProgress, BatchStatus::Validating],
                BatchStatus::Failed,
                "failed_at",
                unix_now(),
            )
            .await?;
        self.touch_heartbeat(WorkerStatus::Idle, None).await;
        Ok(())
    }
}

fn empty_on_missing(err: Error) -> Result<Vec<String>> {
    match err {
        Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        other => Err(other),
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use crate::models::{FileObject, FilePurpose};

    async fn setup(engine_fail_model: Option<&str>) -> (Worker, Database, FileBlobStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(":memory:").await.unwrap();
        let blobs = FileBlobStore::new(dir.path()).unwrap();
        let mut config = Config::from_env().unwrap();
        config.chunk_size = 2;
        let heartbeat = Arc::new(RwLock::new(WorkerHeartbeat::new()));
        let engine = Arc::new(MockEngine { fail_model: engine_fail_model.map(str::to_string) });
        let worker = Worker::new(db.clone(), blobs.clone(), config, heartbeat, engine, HandlerRegistry::new(), 16.0);
        (worker, db, blobs, dir)
    }

    fn request_line(custom_id: &str) -> String {
        serde_json::json!({
            "custom_id": custom_id,
            "method": "POST",
            "url": crate::models::ENDPOINT_CHAT_COMPLETIONS,
            "body": {"model": "test-model", "messages": []},
        })
        .to_string()
    }

    async fn seeded_batch(db: &Database, blobs: &FileBlobStore, n: usize) -> BatchJob {
        let input_id = "file-in-1".to_string();
        let file = FileObject::new(input_id.clone(), FilePurpose::Batch, "in.jsonl".into(), 0, "".into());
        db.create_file(&file).await.unwrap();
        let content: String = (0..n).map(|i| format!("{}\n", request_line(&format!("r{i}")))).collect();
        blobs.put(&input_id, content.as_bytes()).await.unwrap();

        let batch = BatchJob {
            id: crate::ids::new_batch_id(),
            object: "batch",
            endpoint: crate::models::ENDPOINT_CHAT_COMPLETIONS.into(),
            input_file_id: input_id,
            output_file_id: None,
            error_file_id: None,
            status: BatchStatus::Validating,
            request_counts: RequestCounts { total: n as i64, completed: 0, failed: 0 },
            metadata: Default::default(),
            created_at: 0,
            in_progress_at: None,
            finalizing_at: None,
            completed_at: None,
            failed_at: None,
            expired_at: None,
            cancelling_at: None,
            cancelled_at: None,
            expires_at: unix_now() + 86_400,
            errors: None,
        };
        db.create_batch(&batch).await.unwrap();
        batch
    }

    #[tokio::test]
    async fn test_happy_path_completes_with_all_results() {
        let (worker, db, _blobs, _dir) = setup(None).await;
        let batch = seeded_batch(&db, &worker.blobs, 5).await;

        worker.process_batch(&batch.id).await.unwrap();

        let finished = db.get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(finished.status, BatchStatus::Completed);
        assert_eq!(finished.request_counts.completed, 5);
        assert_eq!(finished.request_counts.failed, 0);
        assert!(finished.output_file_id.is_some());
    }

    #[tokio::test]
    async fn test_zero_request_batch_completes_immediately() {
        let (worker, db, _blobs, _dir) = setup(None).await;
        let batch = seeded_batch(&db, &worker.blobs, 0).await;

        worker.process_batch(&batch.id).await.unwrap();

        let finished = db.get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(finished.status, BatchStatus::Completed);
        assert!(finished.output_file_id.is_none());
    }

    #[tokio::test]
    async fn test_resume_skips_already_completed_custom_ids() {
        let (worker, db, blobs, _dir) = setup(None).await;
        let batch = seeded_batch(&db, &worker.blobs, 4).await;
        db.transition_batch(&batch.id, &[BatchStatus::Validating], BatchStatus::InProgress, "in_progress_at", 0)
            .await
            .unwrap();

        let output_id = ids::output_file_id_for_batch(&batch.id);
        let already = serde_json::json!({
            "id": "r0", "custom_id": "r0",
            "response": {"status_code": 200, "body": {}},
        });
        blobs.append_line(&output_id, &already.to_string()).await.unwrap();
        db.bump_counts(&batch.id, 1, 0).await.unwrap();

        worker.process_batch(&batch.id).await.unwrap();

        let finished = db.get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(finished.status, BatchStatus::Completed);
        assert_eq!(finished.request_counts.completed, 4);
        let lines = blobs.open_lines(&output_id).await.unwrap();
        assert_eq!(lines.len(), 4);
    }

    #[tokio::test]
    async fn test_engine_load_failure_fails_batch() {
        let (worker, db, _blobs, _dir) = setup(Some("test-model")).await;
        let batch = seeded_batch(&db, &worker.blobs, 3).await;

        worker.process_batch(&batch.id).await.unwrap();

        let finished = db.get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(finished.status, BatchStatus::Failed);
        assert!(finished.errors.is_some());
    }

    #[tokio::test]
    async fn test_cancelling_batch_finalizes_as_cancelled() {
        let (worker, db, _blobs, _dir) = setup(None).await;
        let batch = seeded_batch(&db, &worker.blobs, 3).await;
        db.transition_batch(&batch.id, &[BatchStatus::Validating], BatchStatus::InProgress, "in_progress_at", 0)
            .await
            .unwrap();
        db.transition_batch(&batch.id, &[BatchStatus::InProgress], BatchStatus::Cancelling, "cancelling_at", 0)
            .await
            .unwrap();

        worker.process_batch(&batch.id).await.unwrap();

        let finished = db.get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(finished.status, BatchStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_refresh_liveness_revives_a_dead_heartbeat() {
        let (worker, _db, _blobs, _dir) = setup(None).await;
        {
            let mut hb = worker.heartbeat.write().await;
            hb.status = WorkerStatus::Dead;
            hb.last_seen = 0;
        }

        worker.refresh_liveness().await;

        let hb = worker.heartbeat.read().await;
        assert_eq!(hb.status, WorkerStatus::Idle);
        assert!(hb.age_seconds() < 2);
    }

    #[tokio::test]
    async fn test_refresh_liveness_preserves_busy_status() {
        let (worker, _db, _blobs, _dir) = setup(None).await;
        {
            let mut hb = worker.heartbeat.write().await;
            hb.status = WorkerStatus::Busy;
            hb.last_seen = 0;
        }

        worker.refresh_liveness().await;

        let hb = worker.heartbeat.read().await;
        assert_eq!(hb.status, WorkerStatus::Busy);
        assert!(hb.age_seconds() < 2);
    }
}
