//! Local store seam
//!
//! The local database is the durable source of truth for user intent:
//! flag, move and delete writes land here before any remote mutation is
//! attempted. Implementations must be cheap to call from async tasks.

use chrono::{DateTime, Utc};

use crate::types::error::Result;
use crate::types::{DeltaSummary, Flag, FolderSyncState, HeaderDelta};

/// The local mail database. Calls are synchronous and short.
pub trait LocalStore: Send + Sync {
    /// Sync bookkeeping for a folder (default state if never synced)
    fn sync_state(&self, account_id: &str, folder: &str) -> Result<FolderSyncState>;

    /// Apply what a header sync learned and stamp the folder as synced
    fn apply_header_delta(
        &self,
        account_id: &str,
        folder: &str,
        delta: &HeaderDelta,
    ) -> Result<DeltaSummary>;

    /// Every UID cached for a folder, ascending
    fn known_uids(&self, account_id: &str, folder: &str) -> Result<Vec<u32>>;

    /// UIDs whose body has not been fetched yet, newest first
    fn pending_bodies(&self, account_id: &str, folder: &str, limit: usize) -> Result<Vec<u32>>;

    fn mark_body_fetched(&self, account_id: &str, folder: &str, uid: u32, body: &[u8])
        -> Result<()>;

    fn last_sync(&self, account_id: &str, folder: &str) -> Result<Option<DateTime<Utc>>>;

    fn count_unread(&self, account_id: &str, folder: &str) -> Result<u32>;

    fn message_count(&self, account_id: &str, folder: &str) -> Result<u32>;

    fn update_flags(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
        flags: &[Flag],
        add: bool,
    ) -> Result<()>;

    fn move_messages(&self, account_id: &str, from: &str, to: &str, uids: &[u32]) -> Result<()>;

    fn delete_messages(&self, account_id: &str, folder: &str, uids: &[u32]) -> Result<()>;

    /// Record a folder's unread count (secondary folders after a move)
    fn set_unread_hint(&self, account_id: &str, folder: &str, unread: u32) -> Result<()>;
}
