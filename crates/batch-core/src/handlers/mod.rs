//! Result handler plugin registry.
//!
//! A [`ResultHandler`] runs once a batch reaches a terminal state. The
//! built-in [`webhook::WebhookHandler`] is always registered; callers may
//! register additional handlers (e.g. to push results into a downstream
//! pipeline) before the server starts accepting batches.

pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::models::BatchJob;

/// Runs after a batch finishes, successfully or not.
#[async_trait]
pub trait ResultHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this handler should run for this batch. Called with the
    /// batch's own metadata so a handler can opt out per-job.
    fn enabled(&self, batch: &BatchJob) -> bool;

    async fn handle(&self, batch: &BatchJob) -> Result<(), String>;

    /// Called when `handle` returns `Err`; override to customize logging
    /// or alerting. Never causes `process` to fail.
    fn on_error(&self, batch: &BatchJob, error: &str) {
        tracing::error!(batch_id = %batch.id, handler = %self.name(), %error, "result handler failed");
    }
}

/// Registers handlers by name, de-duplicating re-registration so a handler
/// can be swapped out by registering a new instance under the same name.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ResultHandler>>,
    /// Preserves registration order since `HashMap` iteration order isn't stable.
    order: Vec<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new(), order: Vec::new() }
    }

    pub fn register(&mut self, handler: Arc<dyn ResultHandler>) {
        let name = handler.name().to_string();
        if !self.handlers.contains_key(&name) {
            self.order.push(name.clone());
        }
        tracing::info!(handler = %name, "registered result handler");
        self.handlers.insert(name, handler);
    }

    /// Runs every enabled handler in registration order, sequentially.
    /// A handler's failure doesn't stop the others from running.
    pub async fn process(&self, batch: &BatchJob) -> HashMap<String, bool> {
        let mut outcomes = HashMap::new();
        for name in &self.order {
            let Some(handler) = self.handlers.get(name) else { continue };
            if !handler.enabled(batch) {
                tracing::debug!(handler = %name, "handler disabled, skipping");
                continue;
            }
            tracing::info!(handler = %name, batch_id = %batch.id, "running result handler");
            match handler.handle(batch).await {
                Ok(()) => {
                    outcomes.insert(name.clone(), true);
                }
                Err(err) => {
                    handler.on_error(batch, &err);
                    outcomes.insert(name.clone(), false);
                }
            }
        }
        outcomes
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
