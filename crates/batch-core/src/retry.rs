//! Exponential backoff retry, shared by webhook dispatch and worker
//! per-request retries: 1s, 2s, 4s, ... up to `attempts` tries.

use std::time::Duration;

/// Runs `op` up to `attempts` times, sleeping `2^n` seconds between
/// failures. Returns the last error if every attempt fails.
pub async fn with_backoff<T, E, F, Fut>(attempts: u32, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_err = Some(err);
                if attempt + 1 < attempts {
                    let backoff = Duration::from_secs(2_u64.pow(attempt));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(last_err.expect("attempts >= 1 guarantees at least one iteration"))
}
