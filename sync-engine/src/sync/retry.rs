//! Retry and recovery helpers
//!
//! Two independent layers:
//! - `with_connection`: a transport failure on a borrowed connection
//!   discards it and reruns the single failed operation once on a newly
//!   opened one. Anything else propagates untouched.
//! - `retry_with_backoff`: orchestration-level retries for best-effort
//!   remote pushes (flags), linear backoff, transient errors only.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::FlagRetryConfig;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::types::error::{Result, SyncError};

/// Run `op` against a pooled connection for `account_id`.
///
/// `op` takes the connection by value and hands it back with its result
/// so the helper can decide between release and discard.
pub async fn with_connection<T, F, Fut>(
    pool: &ConnectionPool,
    cancel: &CancellationToken,
    account_id: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(PooledConnection) -> Fut,
    Fut: Future<Output = (PooledConnection, Result<T>)>,
{
    let mut retried = false;

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // After a transport failure the account's idle sessions are suspect too
        let conn = if retried {
            pool.acquire_fresh(account_id, cancel).await?
        } else {
            pool.acquire(account_id, cancel).await?
        };
        let connection_id = conn.id();
        let (conn, result) = op(conn).await;

        match result {
            Err(e) if e.is_connection_error() => {
                pool.discard(conn);
                if retried {
                    warn!(account_id, connection_id, "Connection error after retry: {}", e);
                    return Err(e);
                }
                info!(
                    account_id,
                    connection_id, "Connection error ({}), retrying once on a fresh connection", e
                );
                retried = true;
            }
            result => {
                pool.release(conn);
                return result;
            }
        }
    }
}

/// Retry `f` on transient errors, sleeping `backoff(n)` before retry `n`
pub async fn retry_with_backoff<T, F, Fut>(
    config: &FlagRetryConfig,
    cancel: &CancellationToken,
    what: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && retry < config.max_retries => {
                retry += 1;
                let delay = config.backoff(retry);
                warn!(
                    "{} failed ({}), retry {}/{} in {:?}",
                    what, e, retry, config.max_retries, delay
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}
