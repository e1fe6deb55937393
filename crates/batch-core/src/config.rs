//! Ambient configuration, loaded once from the environment at boot.
//!
//! Every component takes a `Config` (or a clone of the fields it needs)
//! through its constructor; nothing reaches into `std::env` after `main`
//! has built this struct.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Immutable, process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub model_name: String,
    pub gpu_memory_utilization: f32,
    pub max_model_len: u32,
    pub max_num_seqs: u32,

    pub max_requests_per_job: u64,
    pub max_queue_depth: usize,
    pub max_total_queued_requests: u64,
    pub chunk_size: usize,
    pub retry_attempts: u32,

    pub heartbeat_interval_seconds: u64,
    pub heartbeat_dead_multiplier: u64,
    pub completion_window_seconds: i64,

    pub storage_path: PathBuf,
    pub database_path: PathBuf,
    pub cleanup_after_days: i64,

    /// Base URL of the OpenAI-compatible chat-completions backend the
    /// worker's `HttpInferenceEngine` talks to.
    pub engine_base_url: String,

    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,

    pub log_level: String,
    pub json_logging: bool,
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| Error::internal(format!("invalid value for {key}: {raw}"))),
    }
}

impl Config {
    /// Build configuration from environment variables, falling back to the
    /// defaults documented in the HTTP API and scheduler specification.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            model_name: env_var("MODEL_NAME").unwrap_or_else(|| "default-model".to_string()),
            gpu_memory_utilization: parse_env("GPU_MEMORY_UTILIZATION", 0.9_f32)?,
            max_model_len: parse_env("MAX_MODEL_LEN", 8192_u32)?,
            max_num_seqs: parse_env("MAX_NUM_SEQS", 256_u32)?,

            max_requests_per_job: parse_env("MAX_REQUESTS_PER_JOB", 50_000_u64)?,
            max_queue_depth: parse_env("MAX_QUEUE_DEPTH", 5_usize)?,
            max_total_queued_requests: parse_env("MAX_TOTAL_QUEUED_REQUESTS", 100_000_u64)?,
            chunk_size: parse_env("CHUNK_SIZE", 100_usize)?,
            retry_attempts: parse_env("RETRY_ATTEMPTS", 3_u32)?,

            heartbeat_interval_seconds: parse_env("HEARTBEAT_INTERVAL_SECONDS", 15_u64)?,
            heartbeat_dead_multiplier: parse_env("HEARTBEAT_DEAD_MULTIPLIER", 3_u64)?,
            completion_window_seconds: parse_env("COMPLETION_WINDOW_SECONDS", 86_400_i64)?,

            storage_path: PathBuf::from(
                env_var("STORAGE_PATH").unwrap_or_else(|| "./data/batches".to_string()),
            ),
            database_path: PathBuf::from(
                env_var("DATABASE_PATH").unwrap_or_else(|| "./data/batch.db".to_string()),
            ),
            cleanup_after_days: parse_env("CLEANUP_AFTER_DAYS", 7_i64)?,
            engine_base_url: env_var("ENGINE_BASE_URL").unwrap_or_else(|| "http://localhost:8001".to_string()),

            host: env_var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_env("PORT", 8000_u16)?,
            api_key: env_var("API_KEY"),

            log_level: env_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            json_logging: parse_env("JSON_LOGGING", true)?,
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    /// Heartbeat age beyond which the worker is declared dead.
    pub fn heartbeat_dead_after(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds * self.heartbeat_dead_multiplier)
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        // SAFETY in tests: no other test in this process races these vars.
        for key in [
            "MODEL_NAME",
            "MAX_REQUESTS_PER_JOB",
            "MAX_QUEUE_DEPTH",
            "CHUNK_SIZE",
        ] {
            env::remove_var(key);
        }
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.max_requests_per_job, 50_000);
        assert_eq!(cfg.max_queue_depth, 5);
        assert_eq!(cfg.chunk_size, 100);
    }

    #[test]
    fn test_heartbeat_dead_after() {
        let mut cfg = Config::from_env().unwrap();
        cfg.heartbeat_interval_seconds = 15;
        cfg.heartbeat_dead_multiplier = 3;
        assert_eq!(cfg.heartbeat_dead_after(), Duration::from_secs(45));
    }
}
