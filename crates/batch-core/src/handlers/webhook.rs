//! Built-in webhook notification handler.
//!
//! Always enabled; fires only for batches whose metadata carries a
//! `webhook_url`. Posts an OpenAI-compatible completion payload with
//! exponential backoff (1s, 2s, 4s) over `max_retries` attempts.

use async_trait::async_trait;
use std::time::Duration;

use crate::models::BatchJob;
use crate::retry::with_backoff;

use super::ResultHandler;

pub struct WebhookHandler {
    client: reqwest::Client,
    max_retries: u32,
    timeout: Duration,
}

impl WebhookHandler {
    pub fn new(max_retries: u32, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, max_retries, timeout }
    }

    fn payload(&self, batch: &BatchJob) -> serde_json::Value {
        let metadata: serde_json::Map<String, serde_json::Value> = batch
            .metadata
            .iter()
            .filter(|(k, _)| k.as_str() != "webhook_url")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        serde_json::json!({
            "id": batch.id,
            "object": "batch",
            "status": batch.status.as_str(),
            "created_at": batch.created_at,
            "completed_at": batch.completed_at,
            "request_counts": {
                "total": batch.request_counts.total,
                "completed": batch.request_counts.completed,
                "failed": batch.request_counts.failed,
            },
            "metadata": metadata,
            "output_file_url": format!("/v1/batches/{}/results", batch.id),
        })
    }
}

impl Default for WebhookHandler {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}

#[async_trait]
impl ResultHandler for WebhookHandler {
    fn name(&self) -> &str {
        "webhook"
    }

    fn enabled(&self, _batch: &BatchJob) -> bool {
        true
    }

    async fn handle(&self, batch: &BatchJob) -> Result<(), String> {
        let Some(webhook_url) = batch.webhook_url() else {
            tracing::debug!(batch_id = %batch.id, "no webhook_url in metadata, skipping");
            return Ok(());
        };

        let payload = self.payload(batch);
        let client = &self.client;
        let url = webhook_url.clone();

        with_backoff(self.max_retries, |attempt| {
            let client = client.clone();
            let url = url.clone();
            let payload = payload.clone();
            async move {
                tracing::info!(%url, attempt = attempt + 1, "sending webhook");
                let response = client
                    .post(&url)
                    .json(&payload)
                    .timeout(self.timeout)
                    .send()
                    .await
                    .map_err(|e| e.to_string())?;

                let status = response.status().as_u16();
                if matches!(status, 200 | 201 | 202 | 204) {
                    Ok(())
                } else {
                    Err(format!("webhook returned status {status}"))
                }
            }
        })
        .await
    }
}
