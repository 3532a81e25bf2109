//! Dispatch of synchronous store calls onto tokio's blocking pool.

use crate::config::RetryPolicy;
use crate::error::{IndexError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Runs `f` on the blocking pool, failing with `Transient` if it does not
/// finish within `timeout`. The blocking call itself is not interrupted.
pub async fn run_blocking<T, F>(op: &'static str, timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(res)) => res,
        Ok(Err(join)) => Err(IndexError::Worker(format!("{op}: {join}"))),
        Err(_) => Err(IndexError::timeout(op, timeout)),
    }
}

/// Like [`run_blocking`], but a call that overruns `timeout` is awaited to
/// completion before `Transient` is returned. When this returns, the call
/// has stopped touching the store, whatever the outcome.
pub async fn run_blocking_settled<T, F>(op: &'static str, timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let mut handle = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(res)) => res,
        Ok(Err(join)) => Err(IndexError::Worker(format!("{op}: {join}"))),
        Err(_) => {
            warn!(op, ?timeout, "call overran its timeout, waiting for it to settle");
            if let Err(join) = handle.await {
                warn!(op, error = %join, "overrunning call failed");
            }
            Err(IndexError::timeout(op, timeout))
        }
    }
}

/// Retries `attempt` while it fails with a transient error. Only for idempotent operations.
pub async fn with_retry<T, F, Fut>(op: &'static str, policy: &RetryPolicy, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut tries = 0;
    loop {
        match attempt().await {
            Err(e) if e.is_transient() && tries + 1 < attempts => {
                let delay = policy.delay_for(tries);
                warn!(op, attempt = tries + 1, ?delay, error = %e, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                tries += 1;
            }
            res => return res,
        }
    }
}
