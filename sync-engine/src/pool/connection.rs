//! A session lent out by the pool
//!
//! Every operation races the session call against two tokens: the pool's
//! kill token (account closed underneath the borrower) and the borrower's
//! interrupt token (its sync scope was cancelled). Either one ends the
//! call immediately and leaves the connection unhealthy, so the pool
//! discards it on return instead of handing a half-finished command to
//! the next borrower.

use std::future::Future;
use std::sync::Weak;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::PoolInner;
use crate::adapters::session::MailSession;
use crate::types::error::{Result, SyncError};
use crate::types::{Flag, FlagUpdate, MailboxStatus, MessageHeader};

/// Pool-side representation of an idle session
pub(crate) struct Slot {
    pub(crate) id: u64,
    pub(crate) session: Box<dyn MailSession>,
    pub(crate) created_at: Instant,
    pub(crate) last_used: Instant,
}

impl Slot {
    pub(crate) fn new(id: u64, session: Box<dyn MailSession>) -> Self {
        let now = Instant::now();
        Self {
            id,
            session,
            created_at: now,
            last_used: now,
        }
    }
}

/// A session borrowed from [`super::ConnectionPool`].
///
/// Hand it back with `release` or `discard`. Dropping it closes the
/// session and frees its slot.
pub struct PooledConnection {
    id: u64,
    account_id: String,
    session: Option<Box<dyn MailSession>>,
    created_at: Instant,
    last_used: Instant,
    healthy: bool,
    kill: CancellationToken,
    interrupt: Option<CancellationToken>,
    pool: Weak<PoolInner>,
}

fn detached() -> SyncError {
    SyncError::Connection("connection already returned to the pool".to_string())
}

async fn run_guarded<T>(
    kill: &CancellationToken,
    interrupt: Option<&CancellationToken>,
    op: impl Future<Output = Result<T>>,
) -> Result<T> {
    let interrupted = async {
        match interrupt {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = kill.cancelled() => Err(SyncError::Connection("connection force-closed".to_string())),
        _ = interrupted => Err(SyncError::Cancelled),
        result = op => result,
    }
}

macro_rules! guarded {
    ($self:ident, |$session:ident| $call:expr) => {{
        $self.preflight()?;
        let $session = $self.session.as_deref_mut().ok_or_else(detached)?;
        let result = run_guarded(&$self.kill, $self.interrupt.as_ref(), $call).await;
        $self.settle(result)
    }};
}

impl PooledConnection {
    pub(crate) fn new(
        account_id: &str,
        slot: Slot,
        kill: CancellationToken,
        interrupt: Option<CancellationToken>,
        pool: Weak<PoolInner>,
    ) -> Self {
        Self {
            id: slot.id,
            account_id: account_id.to_string(),
            session: Some(slot.session),
            created_at: slot.created_at,
            last_used: slot.last_used,
            healthy: true,
            kill,
            interrupt,
            pool,
        }
    }

    /// Take the session back for the pool. After this, Drop is a no-op.
    pub(crate) fn into_slot(mut self) -> Option<Slot> {
        self.session.take().map(|session| Slot {
            id: self.id,
            session,
            created_at: self.created_at,
            last_used: self.last_used,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Healthy, not force-closed, and the transport still looks usable
    pub fn is_healthy(&self) -> bool {
        self.healthy
            && !self.kill.is_cancelled()
            && self.session.as_ref().map(|s| s.is_alive()).unwrap_or(false)
    }

    fn preflight(&self) -> Result<()> {
        if self.kill.is_cancelled() {
            return Err(SyncError::Connection("connection force-closed".to_string()));
        }
        if self.interrupt.as_ref().map(|t| t.is_cancelled()).unwrap_or(false) {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        self.last_used = Instant::now();
        if let Err(e) = &result {
            if e.is_connection_error() || e.is_cancelled() {
                debug!(
                    connection_id = self.id,
                    account_id = %self.account_id,
                    error = %e,
                    "Marking pooled connection unhealthy"
                );
                self.healthy = false;
            }
        }
        result
    }

    pub async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus> {
        guarded!(self, |session| session.select(mailbox))
    }

    pub async fn fetch_headers(&mut self, after_uid: u32) -> Result<Vec<MessageHeader>> {
        guarded!(self, |session| session.fetch_headers(after_uid))
    }

    pub async fn fetch_flags(&mut self, up_to_uid: u32) -> Result<Vec<FlagUpdate>> {
        guarded!(self, |session| session.fetch_flags(up_to_uid))
    }

    pub async fn fetch_uids(&mut self) -> Result<Vec<u32>> {
        guarded!(self, |session| session.fetch_uids())
    }

    pub async fn fetch_body(&mut self, uid: u32) -> Result<Vec<u8>> {
        guarded!(self, |session| session.fetch_body(uid))
    }

    pub async fn copy(&mut self, uids: &[u32], target: &str) -> Result<()> {
        guarded!(self, |session| session.copy(uids, target))
    }

    pub async fn delete(&mut self, uids: &[u32]) -> Result<()> {
        guarded!(self, |session| session.delete(uids))
    }

    pub async fn append(&mut self, mailbox: &str, flags: &[Flag], content: &[u8]) -> Result<()> {
        guarded!(self, |session| session.append(mailbox, flags, content))
    }

    pub async fn add_flags(&mut self, uids: &[u32], flags: &[Flag]) -> Result<()> {
        guarded!(self, |session| session.add_flags(uids, flags))
    }

    pub async fn remove_flags(&mut self, uids: &[u32], flags: &[Flag]) -> Result<()> {
        guarded!(self, |session| session.remove_flags(uids, flags))
    }

    pub async fn noop(&mut self) -> Result<()> {
        guarded!(self, |session| session.noop())
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("account_id", &self.account_id)
            .field("healthy", &self.healthy)
            .finish()
    }
}

// Dropped without release/discard: close it and free the slot.
impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.force_close();
            if let Some(pool) = self.pool.upgrade() {
                debug!(
                    connection_id = self.id,
                    account_id = %self.account_id,
                    "Pooled connection dropped without release; discarding"
                );
                pool.forget(&self.account_id, self.id);
            }
        }
    }
}
