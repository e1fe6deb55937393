//! Inference backends: the trait the worker drives chunks through, plus
//! an HTTP-backed implementation and a test double.

pub mod optimizer;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{BatchRequestLine, BatchResultError, BatchResultLine, BatchResultResponse, EngineConfig};

/// Outcome of loading a model into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    OutOfMemory,
}

/// A chat-completion backend the worker drives one chunk at a time.
///
/// Implementations own whatever process or connection talks to the actual
/// model server; `load_model`/`unload_model` bracket a hot-swap so only one
/// model occupies GPU memory at a time.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn load_model(&self, config: &EngineConfig) -> Result<LoadOutcome>;

    async fn unload_model(&self, model_id: &str) -> Result<()>;

    /// Runs one chunk of independent requests, returning one result line
    /// per input line, in the same order. A request-level failure is
    /// reported as an `error` result line, not a `Result::Err` — only
    /// engine-level failures (the backend is unreachable, OOM) return `Err`.
    async fn run_chunk(&self, requests: &[BatchRequestLine]) -> Result<Vec<BatchResultLine>>;
}

/// Talks to an OpenAI-compatible chat-completions server over HTTP.
pub struct HttpInferenceEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInferenceEngine {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, base_url: base_url.into() }
    }
}

#[async_trait]
impl InferenceEngine for HttpInferenceEngine {
    async fn load_model(&self, config: &EngineConfig) -> Result<LoadOutcome> {
        let response = self
            .client
            .post(format!("{}/load_model", self.base_url))
            .json(&serde_json::json!({
                "model": config.model_id,
                "gpu_memory_utilization": config.gpu_memory_utilization,
                "max_model_len": config.max_model_len,
                "enforce_eager": config.enforce_eager,
                "kv_cache_dtype": config.kv_cache_dtype,
            }))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::INSUFFICIENT_STORAGE
            || response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE
        {
            return Ok(LoadOutcome::OutOfMemory);
        }
        response.error_for_status_ref().map_err(|e| crate::error::Error::processing(e.to_string()))?;
        Ok(LoadOutcome::Loaded)
    }

    async fn unload_model(&self, model_id: &str) -> Result<()> {
        self.client
            .post(format!("{}/unload_model", self.base_url))
            .json(&serde_json::json!({ "model": model_id }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| crate::error::Error::processing(e.to_string()))?;
        Ok(())
    }

    async fn run_chunk(&self, requests: &[BatchRequestLine]) -> Result<Vec<BatchResultLine>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let response = self
                .client
                .post(format!("{}{}", self.base_url, request.url))
                .json(&request.body)
                .send()
                .await?;
            let status = response.status();
            let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);

            results.push(if status.is_success() {
                BatchResultLine {
                    id: crate::ids::new_result_id(),
                    custom_id: request.custom_id.clone(),
                    response: Some(BatchResultResponse { status_code: status.as_u16(), body }),
                    error: None,
                }
            } else {
                BatchResultLine {
                    id: crate::ids::new_result_id(),
                    custom_id: request.custom_id.clone(),
                    response: None,
                    error: Some(BatchResultError {
                        code: status.as_str().to_string(),
                        message: body.get("error").and_then(|e| e.get("message")).and_then(|m| m.as_str())
                            .unwrap_or("inference request failed").to_string(),
                    }),
                }
            });
        }
        Ok(results)
    }
}

/// In-memory engine for tests: echoes a fixed response, or simulates an
/// OOM/failure when configured to.
#[cfg(any(test, feature = "test-util"))]
pub struct MockEngine {
    pub fail_model: Option<String>,
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl InferenceEngine for MockEngine {
    async fn load_model(&self, config: &EngineConfig) -> Result<LoadOutcome> {
        if self.fail_model.as_deref() == Some(config.model_id.as_str()) {
            return Ok(LoadOutcome::OutOfMemory);
        }
        Ok(LoadOutcome::Loaded)
    }

    async fn unload_model(&self, _model_id: &str) -> Result<()> {
        Ok(())
    }

    async fn run_chunk(&self, requests: &[BatchRequestLine]) -> Result<Vec<BatchResultLine>> {
        Ok(requests
            .iter()
            .map(|r| BatchResultLine {
                id: crate::ids::new_result_id(),
                custom_id: r.custom_id.clone(),
                response: Some(BatchResultResponse {
                    status_code: 200,
                    body: serde_json::json!({ "echo": r.body }),
                }),
                error: None,
            })
            .collect())
    }
}
