//! Metadata store — SQLx over SQLite.
//!
//! Holds the `files` and `batches` tables. All batch state transitions go
//! through [`Database::transition_batch`], a compare-and-set update that
//! only applies when the row's current status is still one of the caller's
//! expected `from` set; this is what lets the scheduler, worker, and the
//! cancel endpoint race against each other safely without a higher-level
//! lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};

use crate::error::{Error, Result};
use crate::models::{BatchJob, BatchStatus, FileObject, FilePurpose, RequestCounts};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path: PathBuf = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        tracing::info!(path = %db_path.display(), "connecting to metadata store");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        tracing::info!("running metadata store migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                purpose TEXT NOT NULL,
                filename TEXT NOT NULL,
                bytes INTEGER NOT NULL,
                path TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                deleted_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_purpose ON files(purpose, deleted)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batches (
                id TEXT PRIMARY KEY,
                endpoint TEXT NOT NULL,
                input_file_id TEXT NOT NULL,
                output_file_id TEXT,
                error_file_id TEXT,
                status TEXT NOT NULL,
                total_requests INTEGER NOT NULL DEFAULT 0,
                completed_requests INTEGER NOT NULL DEFAULT 0,
                failed_requests INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                in_progress_at INTEGER,
                finalizing_at INTEGER,
                completed_at INTEGER,
                failed_at INTEGER,
                expired_at INTEGER,
                cancelling_at INTEGER,
                cancelled_at INTEGER,
                expires_at INTEGER NOT NULL,
                errors TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_batches_status ON batches(status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    pub async fn create_file(&self, file: &FileObject) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (id, purpose, filename, bytes, path, created_at, deleted)
            VALUES (?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&file.id)
        .bind(file.purpose.as_str())
        .bind(&file.filename)
        .bind(file.bytes)
        .bind(&file.path)
        .bind(file.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_file(&self, id: &str) -> Result<Option<FileObject>> {
        let row = sqlx::query("SELECT * FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(file_from_row).transpose()
    }

    /// Paginated newest-first by `created_at`, `id` breaking ties; `after`
    /// is the id of the last row the caller already saw.
    pub async fn list_files(
        &self,
        purpose: Option<FilePurpose>,
        limit: i64,
        after: Option<&str>,
    ) -> Result<Vec<FileObject>> {
        let rows = match (purpose, after) {
            (Some(p), Some(after)) => {
                sqlx::query(
                    "SELECT * FROM files WHERE deleted = 0 AND purpose = ? \
                     AND (created_at, id) < (SELECT created_at, id FROM files WHERE id = ?) \
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(p.as_str())
                .bind(after)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(p), None) => {
                sqlx::query(
                    "SELECT * FROM files WHERE deleted = 0 AND purpose = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(p.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(after)) => {
                sqlx::query(
                    "SELECT * FROM files WHERE deleted = 0 \
                     AND (created_at, id) < (SELECT created_at, id FROM files WHERE id = ?) \
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(after)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, None) => {
                sqlx::query("SELECT * FROM files WHERE deleted = 0 ORDER BY created_at DESC, id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(file_from_row).collect()
    }

    /// Marks a file deleted without removing its row or its blob; the
    /// retention sweeper hard-deletes both once `cleanup_after_days` has
    /// passed since `deleted_at`. Returns `false` if the file did not exist
    /// or was already deleted.
    pub async fn soft_delete_file(&self, id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE files SET deleted = 1, deleted_at = ? WHERE id = ? AND deleted = 0")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Soft-deleted files whose `deleted_at` is older than `before` — due
    /// for the retention sweeper to hard-delete.
    pub async fn find_files_due_for_purge(&self, before: i64) -> Result<Vec<FileObject>> {
        let rows = sqlx::query("SELECT * FROM files WHERE deleted = 1 AND deleted_at < ?")
            .bind(before)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(file_from_row).collect()
    }

    /// Removes a file's metadata row outright. The caller is responsible
    /// for deleting the underlying blob first.
    pub async fn purge_file(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM files WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    pub async fn create_batch(&self, batch: &BatchJob) -> Result<()> {
        let metadata = serde_json::to_string(&batch.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO batches (
                id, endpoint, input_file_id, output_file_id, error_file_id, status,
                total_requests, completed_requests, failed_requests, metadata,
                created_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&batch.id)
        .bind(&batch.endpoint)
        .bind(&batch.input_file_id)
        .bind(&batch.output_file_id)
        .bind(&batch.error_file_id)
        .bind(batch.status.as_str())
        .bind(batch.request_counts.total)
        .bind(batch.request_counts.completed)
        .bind(batch.request_counts.failed)
        .bind(metadata)
        .bind(batch.created_at)
        .bind(batch.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_batch(&self, id: &str) -> Result<Option<BatchJob>> {
        let row = sqlx::query("SELECT * FROM batches WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(batch_from_row).transpose()
    }

    /// Paginated newest-first by `created_at`, `id` breaking ties; `after`
    /// is the id of the last row the caller already saw.
    pub async fn list_batches(&self, limit: i64, after: Option<&str>) -> Result<Vec<BatchJob>> {
        let rows = match after {
            Some(after) => {
                sqlx::query(
                    "SELECT * FROM batches \
                     WHERE (created_at, id) < (SELECT created_at, id FROM batches WHERE id = ?) \
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(after)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM batches ORDER BY created_at DESC, id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(batch_from_row).collect()
    }

    /// Batches in a non-terminal status, for resuming work after a restart.
    pub async fn find_resumable(&self) -> Result<Vec<BatchJob>> {
        let rows = sqlx::query(
            "SELECT * FROM batches WHERE status IN ('validating', 'in_progress', 'finalizing', 'cancelling') \
             ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(batch_from_row).collect()
    }

    /// The oldest `validating` batch, if any — what the scheduler dispatches next.
    pub async fn next_validating(&self) -> Result<Option<BatchJob>> {
        let row = sqlx::query("SELECT * FROM batches WHERE status = 'validating' ORDER BY created_at LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(batch_from_row).transpose()
    }

    /// Batches whose `expires_at` has passed and are not yet terminal.
    pub async fn find_expired(&self, now: i64) -> Result<Vec<BatchJob>> {
        let rows = sqlx::query(
            "SELECT * FROM batches WHERE expires_at < ? AND status IN \
             ('validating', 'in_progress', 'finalizing')",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(batch_from_row).collect()
    }

    /// Compare-and-set status transition: succeeds only if the row's current
    /// status is one of `from`. Stamps `timestamp_column` with `at`.
    /// Returns `false` (no error) when another writer already moved the row.
    pub async fn transition_batch(
        &self,
        id: &str,
        from: &[BatchStatus],
        to: BatchStatus,
        timestamp_column: &str,
        at: i64,
    ) -> Result<bool> {
        if !is_known_timestamp_column(timestamp_column) {
            return Err(Error::internal(format!("unknown timestamp column: {timestamp_column}")));
        }
        let placeholders = from.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE batches SET status = ?, {timestamp_column} = ? WHERE id = ? AND status IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(to.as_str()).bind(at).bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Accumulates completed/failed counts; used as each chunk finishes.
    pub async fn bump_counts(&self, id: &str, completed_delta: i64, failed_delta: i64) -> Result<()> {
        sqlx::query(
            "UPDATE batches SET completed_requests = completed_requests + ?, \
             failed_requests = failed_requests + ? WHERE id = ?",
        )
        .bind(completed_delta)
        .bind(failed_delta)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_total_requests(&self, id: &str, total: i64) -> Result<()> {
        sqlx::query("UPDATE batches SET total_requests = ? WHERE id = ?")
            .bind(total)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_output_files(
        &self,
        id: &str,
        output_file_id: Option<&str>,
        error_file_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE batches SET output_file_id = ?, error_file_id = ? WHERE id = ?")
            .bind(output_file_id)
            .bind(error_file_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_errors(&self, id: &str, errors: &[String]) -> Result<()> {
        let encoded = serde_json::to_string(errors)?;
        sqlx::query("UPDATE batches SET errors = ? WHERE id = ?")
            .bind(encoded)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn is_known_timestamp_column(column: &str) -> bool {
    matches!(
        column,
        "in_progress_at"
            | "finalizing_at"
            | "completed_at"
            | "failed_at"
            | "expired_at"
            | "cancelling_at"
            | "cancelled_at"
    )
}

fn file_from_row(row: sqlx::sqlite::SqliteRow) -> Result<FileObject> {
    let purpose_raw: String = row.try_get("purpose")?;
    let purpose = FilePurpose::from_str(&purpose_raw).map_err(Error::internal)?;
    Ok(FileObject {
        id: row.try_get("id")?,
        object: "file",
        purpose,
        filename: row.try_get("filename")?,
        bytes: row.try_get("bytes")?,
        created_at: row.try_get("created_at")?,
        deleted: row.try_get::<i64, _>("deleted")? != 0,
        path: row.try_get("path")?,
    })
}

fn batch_from_row(row: sqlx::sqlite::SqliteRow) -> Result<BatchJob> {
    let status_raw: String = row.try_get("status")?;
    let status = BatchStatus::from_str(&status_raw).map_err(Error::internal)?;
    let metadata_raw: String = row.try_get("metadata")?;
    let metadata: HashMap<String, serde_json::Value> = serde_json::from_str(&metadata_raw)?;
    let errors_raw: Option<String> = row.try_get("errors")?;
    let errors = errors_raw.map(|raw| serde_json::from_str(&raw)).transpose()?;

    Ok(BatchJob {
        id: row.try_get("id")?,
        object: "batch",
        endpoint: row.try_get("endpoint")?,
        input_file_id: row.try_get("input_file_id")?,
        output_file_id: row.try_get("output_file_id")?,
        error_file_id: row.try_get("error_file_id")?,
        status,
        request_counts: RequestCounts {
            total: row.try_get("total_requests")?,
            completed: row.try_get("completed_requests")?,
            failed: row.try_get("failed_requests")?,
        },
        metadata,
        created_at: row.try_get("created_at")?,
        in_progress_at: row.try_get("in_progress_at")?,
        finalizing_at: row.try_get("finalizing_at")?,
        completed_at: row.try_get("completed_at")?,
        failed_at: row.try_get("failed_at")?,
        expired_at: row.try_get("expired_at")?,
        cancelling_at: row.try_get("cancelling_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        expires_at: row.try_get("expires_at")?,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn sample_file(purpose: FilePurpose) -> FileObject {
        FileObject::new(ids::new_input_file_id(), purpose, "input.jsonl".into(), 1024, "/tmp/x".into())
    }

    fn sample_batch() -> BatchJob {
        BatchJob {
            id: ids::new_batch_id(),
            object: "batch",
            endpoint: crate::models::ENDPOINT_CHAT_COMPLETIONS.into(),
            input_file_id: "file-1".into(),
            output_file_id: None,
            error_file_id: None,
            status: BatchStatus::Validating,
            request_counts: RequestCounts::default(),
            metadata: HashMap::new(),
            created_at: 1000,
            in_progress_at: None,
            finalizing_at: None,
            completed_at: None,
            failed_at: None,
            expired_at: None,
            cancelling_at: None,
            cancelled_at: None,
            expires_at: 87400,
            errors: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_file() {
        let db = test_db().await;
        let file = sample_file(FilePurpose::Batch);
        db.create_file(&file).await.unwrap();
        let fetched = db.get_file(&file.id).await.unwrap().unwrap();
        assert_eq!(fetched.filename, "input.jsonl");
        assert_eq!(fetched.purpose, FilePurpose::Batch);
    }

    #[tokio::test]
    async fn test_soft_delete_is_idempotent_false_on_repeat() {
        let db = test_db().await;
        let file = sample_file(FilePurpose::Batch);
        db.create_file(&file).await.unwrap();
        assert!(db.soft_delete_file(&file.id, 1000).await.unwrap());
        assert!(!db.soft_delete_file(&file.id, 1000).await.unwrap());
    }

    #[tokio::test]
    async fn test_soft_delete_leaves_row_queryable_for_purge() {
        let db = test_db().await;
        let file = sample_file(FilePurpose::Batch);
        db.create_file(&file).await.unwrap();
        db.soft_delete_file(&file.id, 1000).await.unwrap();

        assert!(db.find_files_due_for_purge(999).await.unwrap().is_empty());
        let due = db.find_files_due_for_purge(1001).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, file.id);

        db.purge_file(&file.id).await.unwrap();
        assert!(db.get_file(&file.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_files_orders_newest_first_and_paginates() {
        let db = test_db().await;
        let mut older = sample_file(FilePurpose::Batch);
        older.created_at = 100;
        let mut newer = sample_file(FilePurpose::Batch);
        newer.created_at = 200;
        db.create_file(&older).await.unwrap();
        db.create_file(&newer).await.unwrap();

        let page = db.list_files(None, 10, None).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, newer.id);
        assert_eq!(page[1].id, older.id);

        let next_page = db.list_files(None, 10, Some(&newer.id)).await.unwrap();
        assert_eq!(next_page.len(), 1);
        assert_eq!(next_page[0].id, older.id);
    }

    #[tokio::test]
    async fn test_transition_batch_cas_rejects_wrong_from_state() {
        let db = test_db().await;
        let batch = sample_batch();
        db.create_batch(&batch).await.unwrap();

        let moved = db
            .transition_batch(&batch.id, &[BatchStatus::InProgress], BatchStatus::Finalizing, "finalizing_at", 2000)
            .await
            .unwrap();
        assert!(!moved);

        let moved = db
            .transition_batch(&batch.id, &[BatchStatus::Validating], BatchStatus::InProgress, "in_progress_at", 2000)
            .await
            .unwrap();
        assert!(moved);

        let refetched = db.get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(refetched.status, BatchStatus::InProgress);
        assert_eq!(refetched.in_progress_at, Some(2000));
    }

    #[tokio::test]
    async fn test_bump_counts_accumulates() {
        let db = test_db().await;
        let batch = sample_batch();
        db.create_batch(&batch).await.unwrap();
        db.bump_counts(&batch.id, 3, 1).await.unwrap();
        db.bump_counts(&batch.id, 2, 0).await.unwrap();
        let refetched = db.get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(refetched.request_counts.completed, 5);
        assert_eq!(refetched.request_counts.failed, 1);
    }

    #[tokio::test]
    async fn test_list_batches_orders_newest_first_and_paginates() {
        let db = test_db().await;
        let mut older = sample_batch();
        older.created_at = 100;
        let mut newer = sample_batch();
        newer.id = ids::new_batch_id();
        newer.created_at = 200;
        db.create_batch(&older).await.unwrap();
        db.create_batch(&newer).await.unwrap();

        let page = db.list_batches(10, None).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, newer.id);
        assert_eq!(page[1].id, older.id);

        let next_page = db.list_batches(10, Some(&newer.id)).await.unwrap();
        assert_eq!(next_page.len(), 1);
        assert_eq!(next_page[0].id, older.id);
    }

    #[tokio::test]
    async fn test_find_resumable_excludes_terminal() {
        let db = test_db().await;
        let mut running = sample_batch();
        running.status = BatchStatus::InProgress;
        db.create_batch(&running).await.unwrap();

        let mut done = sample_batch();
        done.id = ids::new_batch_id();
        done.status = BatchStatus::Completed;
        db.create_batch(&done).await.unwrap();

        let resumable = db.find_resumable().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].id, running.id);
    }
}
