//! Message actions: flags, move, delete
//!
//! Local-first. The local store is written before the server is touched,
//! so a failed or deferred remote round-trip never loses what the user
//! did; it only delays when the server sees it.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::store::LocalStore;
use crate::config::FlagRetryConfig;
use crate::events::{EventSink, SyncEvent};
use crate::sync::orchestrator::{SyncOrchestrator, SyncOutcome};
use crate::sync::retry::{retry_with_backoff, with_connection};
use crate::types::error::{Result, SyncError};
use crate::types::Flag;

/// What happened on the server after the local write committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    /// The server round-trip failed; the local change stands
    Deferred { error: SyncError },
}

impl RemoteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RemoteOutcome::Applied)
    }
}

#[derive(Clone)]
pub struct MessageActions {
    orchestrator: SyncOrchestrator,
    store: Arc<dyn LocalStore>,
    events: Arc<dyn EventSink>,
    flag_retry: FlagRetryConfig,
    move_refresh_timeout: Duration,
    cancel: CancellationToken,
}

impl MessageActions {
    pub fn new(
        orchestrator: SyncOrchestrator,
        store: Arc<dyn LocalStore>,
        events: Arc<dyn EventSink>,
        flag_retry: FlagRetryConfig,
        move_refresh_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            store,
            events,
            flag_retry,
            move_refresh_timeout,
            cancel,
        }
    }

    /// Set `\Seen` locally, then on the server
    pub async fn mark_read(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
    ) -> Result<RemoteOutcome> {
        self.set_flag(account_id, folder, uids, Flag::Seen, true).await
    }

    /// Clear `\Seen` locally, then on the server
    pub async fn mark_unread(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
    ) -> Result<RemoteOutcome> {
        self.set_flag(account_id, folder, uids, Flag::Seen, false).await
    }

    /// Set `\Flagged` locally, then on the server
    pub async fn star(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
    ) -> Result<RemoteOutcome> {
        self.set_flag(account_id, folder, uids, Flag::Flagged, true).await
    }

    /// Clear `\Flagged` locally, then on the server
    pub async fn unstar(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
    ) -> Result<RemoteOutcome> {
        self.set_flag(account_id, folder, uids, Flag::Flagged, false).await
    }

    /// Add or remove one flag: store, then event, then server (+FLAGS/-FLAGS)
    pub async fn set_flag(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
        flag: Flag,
        add: bool,
    ) -> Result<RemoteOutcome> {
        if uids.is_empty() {
            return Ok(RemoteOutcome::Applied);
        }

        let flags = [flag];
        self.store.update_flags(account_id, folder, uids, &flags, add)?;
        self.events.emit(SyncEvent::FlagsChanged {
            account_id: account_id.to_string(),
            folder_id: folder.to_string(),
            uids: uids.to_vec(),
        });

        let pool = self.orchestrator.pool();
        let cancel = &self.cancel;
        let flags = &flags[..];
        let what = format!(
            "{} {} on {}/{}",
            if add { "+FLAGS" } else { "-FLAGS" },
            flags[0].as_imap(),
            account_id,
            folder
        );

        let result = retry_with_backoff(&self.flag_retry, cancel, &what, move || {
            with_connection(pool, cancel, account_id, move |mut conn| async move {
                let result = match conn.select(folder).await {
                    Ok(_) if add => conn.add_flags(uids, flags).await,
                    Ok(_) => conn.remove_flags(uids, flags).await,
                    Err(e) => Err(e),
                };
                (conn, result)
            })
        })
        .await;

        Ok(self.remote_outcome(&what, result))
    }

    /// Move messages between folders.
    ///
    /// After the server copy + expunge, the destination is refreshed under
    /// a bounded timeout so a slow server cannot pin pool connections
    /// across a sleep/wake cycle.
    pub async fn move_messages(
        &self,
        account_id: &str,
        from: &str,
        to: &str,
        uids: &[u32],
    ) -> Result<RemoteOutcome> {
        if uids.is_empty() || from == to {
            return Ok(RemoteOutcome::Applied);
        }

        self.store.move_messages(account_id, from, to, uids)?;

        let result = with_connection(
            self.orchestrator.pool(),
            &self.cancel,
            account_id,
            move |mut conn| async move {
                let result = async {
                    conn.select(from).await?;
                    conn.copy(uids, to).await?;
                    conn.delete(uids).await
                }
                .await;
                (conn, result)
            },
        )
        .await;

        let what = format!("move {}/{} -> {}", account_id, from, to);
        let outcome = self.remote_outcome(&what, result);
        if outcome.is_applied() {
            info!("Moved {} message(s) {} -> {}", uids.len(), from, to);
            self.refresh_destination(account_id, to).await;
        }

        self.events.emit(SyncEvent::MessagesMoved {
            account_id: account_id.to_string(),
            from_folder: from.to_string(),
            to_folder: to.to_string(),
            uids: uids.to_vec(),
        });
        Ok(outcome)
    }

    /// Delete locally, then expunge on the server
    pub async fn delete_messages(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
    ) -> Result<RemoteOutcome> {
        if uids.is_empty() {
            return Ok(RemoteOutcome::Applied);
        }

        self.store.delete_messages(account_id, folder, uids)?;

        let result = with_connection(
            self.orchestrator.pool(),
            &self.cancel,
            account_id,
            move |mut conn| async move {
                let result = match conn.select(folder).await {
                    Ok(_) => conn.delete(uids).await,
                    Err(e) => Err(e),
                };
                (conn, result)
            },
        )
        .await;

        let what = format!("delete in {}/{}", account_id, folder);
        Ok(self.remote_outcome(&what, result))
    }

    async fn refresh_destination(&self, account_id: &str, folder: &str) {
        let refresh = self.orchestrator.sync_scope(account_id, folder);
        match tokio::time::timeout(self.move_refresh_timeout, refresh).await {
            Ok(SyncOutcome::Completed(_)) => {}
            Ok(outcome) => debug!("Refresh of {}/{} ended as {:?}", account_id, folder, outcome),
            Err(_) => warn!(
                "Refresh of {}/{} timed out after {:?}",
                account_id, folder, self.move_refresh_timeout
            ),
        }

        // Best effort: a stale unread badge is not worth failing the move
        let unread = self
            .store
            .count_unread(account_id, folder)
            .and_then(|unread| self.store.set_unread_hint(account_id, folder, unread));
        if let Err(e) = unread {
            warn!("Failed to update unread count for {}/{}: {}", account_id, folder, e);
        }
    }

    fn remote_outcome(&self, what: &str, result: Result<()>) -> RemoteOutcome {
        match result {
            Ok(()) => RemoteOutcome::Applied,
            Err(error) => {
                warn!("{} not applied on server: {}", what, error);
                RemoteOutcome::Deferred { error }
            }
        }
    }
}
