//! Folder sync phases: header sync and background body fetch

use std::collections::HashSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::store::LocalStore;
use crate::events::{EventSink, SyncEvent, SyncPhase};
use crate::logging::fmt_ms;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::sync::retry::with_connection;
use crate::types::error::{Result, SyncError};
use crate::types::{DeltaSummary, FolderSyncState, HeaderDelta};

/// Everything a sync phase needs besides its scope
pub struct SyncContext<'a> {
    pub pool: &'a ConnectionPool,
    pub store: &'a dyn LocalStore,
    pub events: &'a dyn EventSink,
    pub cancel: &'a CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSyncReport {
    pub exists: u32,
    pub reset: bool,
    pub summary: DeltaSummary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyFetchReport {
    pub fetched: u32,
    pub failed: u32,
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

/// Whether cached UIDs must be dropped: they are only meaningful within
/// one UIDVALIDITY epoch.
fn uid_validity_changed(folder: &str, stored: Option<u32>, server: u32) -> bool {
    match stored {
        Some(stored) if stored != server => {
            warn!(
                "UIDVALIDITY changed for folder '{}': {} -> {}. Invalidating cache.",
                folder, stored, server
            );
            true
        }
        Some(_) => false,
        None => {
            info!("Storing initial UIDVALIDITY {} for folder '{}'", server, folder);
            false
        }
    }
}

async fn fetch_delta(
    conn: &mut PooledConnection,
    folder: &str,
    prior: &FolderSyncState,
    known: &[u32],
    cancel: &CancellationToken,
) -> Result<HeaderDelta> {
    let status = conn.select(folder).await?;
    checkpoint(cancel)?;

    let reset = uid_validity_changed(folder, prior.uid_validity, status.uid_validity);
    let since = if reset { 0 } else { prior.highest_uid };

    let new_headers = conn.fetch_headers(since).await?;
    checkpoint(cancel)?;

    let mut delta = HeaderDelta {
        uid_validity: status.uid_validity,
        reset,
        exists: status.exists,
        new_headers,
        ..Default::default()
    };

    if since > 0 {
        delta.flag_updates = conn.fetch_flags(since).await?;
        checkpoint(cancel)?;

        let present: HashSet<u32> = conn.fetch_uids().await?.into_iter().collect();
        checkpoint(cancel)?;
        delta.vanished = known
            .iter()
            .copied()
            .filter(|uid| *uid <= since && !present.contains(uid))
            .collect();
    }

    Ok(delta)
}

/// Bring a folder's headers and flags up to date in the local store
pub async fn sync_headers(
    ctx: &SyncContext<'_>,
    account_id: &str,
    folder: &str,
) -> Result<HeaderSyncReport> {
    let started = Instant::now();
    info!("Syncing folder: {}/{}", account_id, folder);

    ctx.events.emit(SyncEvent::SyncProgress {
        account_id: account_id.to_string(),
        folder_id: folder.to_string(),
        phase: SyncPhase::Connecting,
        current: 0,
        total: None,
    });

    let prior = ctx.store.sync_state(account_id, folder)?;
    let known = ctx.store.known_uids(account_id, folder)?;
    let (prior, known, cancel) = (&prior, known.as_slice(), ctx.cancel);

    let delta = with_connection(ctx.pool, cancel, account_id, move |mut conn| async move {
        let result = fetch_delta(&mut conn, folder, prior, known, cancel).await;
        (conn, result)
    })
    .await?;
    checkpoint(cancel)?;

    let summary = ctx.store.apply_header_delta(account_id, folder, &delta)?;

    ctx.events.emit(SyncEvent::SyncProgress {
        account_id: account_id.to_string(),
        folder_id: folder.to_string(),
        phase: SyncPhase::Headers,
        current: summary.added,
        total: Some(delta.exists),
    });

    info!(
        "Synced headers for {}/{} in {}: +{} ~{} -{}",
        account_id,
        folder,
        fmt_ms(started.elapsed()),
        summary.added,
        summary.updated,
        summary.removed
    );

    Ok(HeaderSyncReport {
        exists: delta.exists,
        reset: delta.reset,
        summary,
    })
}

#[derive(Default)]
struct BatchOutcome {
    fetched: u32,
    failed: Vec<u32>,
}

async fn fetch_batch(
    conn: &mut PooledConnection,
    store: &dyn LocalStore,
    account_id: &str,
    folder: &str,
    uids: &[u32],
    cancel: &CancellationToken,
) -> Result<BatchOutcome> {
    conn.select(folder).await?;
    let mut outcome = BatchOutcome::default();

    for &uid in uids {
        checkpoint(cancel)?;
        match conn.fetch_body(uid).await {
            Ok(body) => match store.mark_body_fetched(account_id, folder, uid, &body) {
                Ok(()) => outcome.fetched += 1,
                Err(e) => {
                    warn!("Failed to store body {} in {}: {}", uid, folder, e);
                    outcome.failed.push(uid);
                }
            },
            // Abort the batch so the connection-level retry can rerun it
            Err(e) if e.is_connection_error() || e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!("Failed to fetch body {} in {}: {}", uid, folder, e);
                outcome.failed.push(uid);
            }
        }
    }

    Ok(outcome)
}

/// Download missing bodies in batches. Individual failures are logged
/// and skipped; the report says how many made it.
pub async fn fetch_bodies(
    ctx: &SyncContext<'_>,
    account_id: &str,
    folder: &str,
    batch_size: usize,
) -> Result<BodyFetchReport> {
    let started = Instant::now();
    let batch_size = batch_size.max(1);
    let mut report = BodyFetchReport::default();
    let mut skipped: HashSet<u32> = HashSet::new();

    loop {
        checkpoint(ctx.cancel)?;

        let batch: Vec<u32> = ctx
            .store
            .pending_bodies(account_id, folder, batch_size + skipped.len())?
            .into_iter()
            .filter(|uid| !skipped.contains(uid))
            .take(batch_size)
            .collect();
        if batch.is_empty() {
            break;
        }

        let (store, uids, cancel) = (ctx.store, batch.as_slice(), ctx.cancel);
        let outcome = with_connection(ctx.pool, cancel, account_id, move |mut conn| async move {
            let result = fetch_batch(&mut conn, store, account_id, folder, uids, cancel).await;
            (conn, result)
        })
        .await?;

        report.fetched += outcome.fetched;
        report.failed += outcome.failed.len() as u32;
        skipped.extend(outcome.failed);

        ctx.events.emit(SyncEvent::SyncProgress {
            account_id: account_id.to_string(),
            folder_id: folder.to_string(),
            phase: SyncPhase::Bodies,
            current: report.fetched,
            total: None,
        });
    }

    if report.fetched > 0 || report.failed > 0 {
        info!(
            "Fetched {} bodies for {}/{} in {} ({} failed)",
            report.fetched,
            account_id,
            folder,
            fmt_ms(started.elapsed()),
            report.failed
        );
    } else {
        debug!("No bodies to fetch for {}/{}", account_id, folder);
    }

    Ok(report)
}
