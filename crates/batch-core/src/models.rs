//! OpenAI-compatible data model: files, batches, requests, results.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// File
// ============================================================================

/// What a stored file is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePurpose {
    Batch,
    BatchOutput,
    BatchError,
}

impl FilePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilePurpose::Batch => "batch",
            FilePurpose::BatchOutput => "batch_output",
            FilePurpose::BatchError => "batch_error",
        }
    }
}

impl std::fmt::Display for FilePurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FilePurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batch" => Ok(FilePurpose::Batch),
            "batch_output" => Ok(FilePurpose::BatchOutput),
            "batch_error" => Ok(FilePurpose::BatchError),
            other => Err(format!("unknown file purpose: {other}")),
        }
    }
}

/// An uploaded or produced JSONL blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileObject {
    pub id: String,
    pub object: &'static str,
    pub purpose: FilePurpose,
    pub filename: String,
    pub bytes: i64,
    pub created_at: i64,
    pub deleted: bool,
    /// Opaque storage location, never exposed in API responses.
    #[serde(skip)]
    pub path: String,
}

impl FileObject {
    pub fn new(id: String, purpose: FilePurpose, filename: String, bytes: i64, path: String) -> Self {
        Self {
            id,
            object: "file",
            purpose,
            filename,
            bytes,
            created_at: Utc::now().timestamp(),
            deleted: false,
            path,
        }
    }
}

// ============================================================================
// Batch
// ============================================================================

/// Lifecycle state of a batch job. States form a DAG with a terminal set
/// `{Completed, Failed, Expired, Cancelled}`; transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelling,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Validating => "validating",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Finalizing => "finalizing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Expired => "expired",
            BatchStatus::Cancelling => "cancelling",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Expired | BatchStatus::Cancelled
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validating" => Ok(BatchStatus::Validating),
            "in_progress" => Ok(BatchStatus::InProgress),
            "finalizing" => Ok(BatchStatus::Finalizing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "expired" => Ok(BatchStatus::Expired),
            "cancelling" => Ok(BatchStatus::Cancelling),
            "cancelled" => Ok(BatchStatus::Cancelled),
            other => Err(format!("unknown batch status: {other}")),
        }
    }
}

/// Running totals for a batch; monotonically non-decreasing per field.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RequestCounts {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
}

/// The scheduling unit: a file of independent chat-completion requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub object: &'static str,
    pub endpoint: String,
    pub input_file_id: String,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    pub status: BatchStatus,
    pub request_counts: RequestCounts,
    pub metadata: HashMap<String, serde_json::Value>,

    pub created_at: i64,
    pub in_progress_at: Option<i64>,
    pub finalizing_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub expired_at: Option<i64>,
    pub cancelling_at: Option<i64>,
    pub cancelled_at: Option<i64>,
    pub expires_at: i64,

    pub errors: Option<Vec<String>>,
}

impl BatchJob {
    /// Model hint: first request's `body.model`, falling back to
    /// `metadata.model`. Resolved by the caller from the input file;
    /// this helper only reads whichever has already been recorded.
    pub fn metadata_model_hint(&self) -> Option<String> {
        self.metadata
            .get("model")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    pub fn webhook_url(&self) -> Option<String> {
        self.metadata
            .get("webhook_url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

pub const ENDPOINT_CHAT_COMPLETIONS: &str = "/v1/chat/completions";

/// The set of statuses a batch may be dispatched or resumed from.
pub const NON_TERMINAL_STATUSES: &[BatchStatus] = &[
    BatchStatus::Validating,
    BatchStatus::InProgress,
    BatchStatus::Finalizing,
    BatchStatus::Cancelling,
];

// ============================================================================
// Request / Result lines (JSONL)
// ============================================================================

/// One line of an input JSONL file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequestLine {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: serde_json::Value,
}

impl BatchRequestLine {
    pub fn model(&self) -> Option<&str> {
        self.body.get("model").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResultResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResultError {
    pub code: String,
    pub message: String,
}

/// One line of an output or error JSONL file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResultLine {
    pub id: String,
    pub custom_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<BatchResultResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchResultError>,
}

impl BatchResultLine {
    pub fn is_success(&self) -> bool {
        self.response.is_some()
    }
}

// ============================================================================
// Worker / engine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelLoadState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

/// Worker-local knowledge about a model: its tuning hints and load state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub model_id: String,
    pub estimated_memory_gb: f32,
    pub gpu_memory_utilization: f32,
    pub enforce_eager: bool,
    pub load_state: ModelLoadState,
}

/// Configuration the memory optimizer hands the engine before a load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model_id: String,
    pub gpu_memory_utilization: f32,
    pub max_model_len: u32,
    pub enforce_eager: bool,
    pub kv_cache_dtype: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Loading,
    Unloading,
    /// Derived by the scheduler's heartbeat monitor, never set by the worker itself.
    Dead,
}

/// Process-wide worker liveness state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub last_seen: i64,
    pub loaded_model: Option<String>,
    pub status: WorkerStatus,
}

impl WorkerHeartbeat {
    pub fn new() -> Self {
        Self {
            last_seen: Utc::now().timestamp(),
            loaded_model: None,
            status: WorkerStatus::Idle,
        }
    }

    pub fn touch(&mut self, status: WorkerStatus) {
        self.last_seen = Utc::now().timestamp();
        self.status = status;
    }

    pub fn age_seconds(&self) -> i64 {
        Utc::now().timestamp() - self.last_seen
    }
}

impl Default for WorkerHeartbeat {
    fn default() -> Self {
        Self::new()
    }
}
