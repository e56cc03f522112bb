//! In-memory local store
//!
//! A complete `LocalStore` for tests and for embedders that keep their
//! own database elsewhere. Folders are keyed by (account, folder).

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::adapters::store::LocalStore;
use crate::types::error::{Result, SyncError};
use crate::types::{DeltaSummary, Flag, FolderSyncState, HeaderDelta, MessageHeader};

#[derive(Debug, Clone)]
struct StoredMessage {
    header: MessageHeader,
    body: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct FolderData {
    uid_validity: Option<u32>,
    last_sync: Option<DateTime<Utc>>,
    messages: BTreeMap<u32, StoredMessage>,
    unread_hint: Option<u32>,
}

impl FolderData {
    fn highest_uid(&self) -> u32 {
        self.messages.keys().next_back().copied().unwrap_or(0)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    folders: RwLock<HashMap<(String, String), FolderData>>,
}

fn key(account_id: &str, folder: &str) -> (String, String) {
    (account_id.to_string(), folder.to_string())
}

fn poisoned<T>(_: T) -> SyncError {
    SyncError::Store("memory store lock poisoned".to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a folder with headers, as if a previous sync stored them
    pub fn seed(
        &self,
        account_id: &str,
        folder: &str,
        uid_validity: u32,
        headers: Vec<MessageHeader>,
    ) {
        let mut folders = self.folders.write().unwrap_or_else(|e| e.into_inner());
        let data = folders.entry(key(account_id, folder)).or_default();
        data.uid_validity = Some(uid_validity);
        for header in headers {
            data.messages.insert(header.uid, StoredMessage { header, body: None });
        }
    }

    pub fn headers(&self, account_id: &str, folder: &str) -> Vec<MessageHeader> {
        let folders = self.folders.read().unwrap_or_else(|e| e.into_inner());
        folders
            .get(&key(account_id, folder))
            .map(|d| d.messages.values().map(|m| m.header.clone()).collect())
            .unwrap_or_default()
    }

    pub fn body(&self, account_id: &str, folder: &str, uid: u32) -> Option<Vec<u8>> {
        let folders = self.folders.read().unwrap_or_else(|e| e.into_inner());
        folders
            .get(&key(account_id, folder))
            .and_then(|d| d.messages.get(&uid))
            .and_then(|m| m.body.clone())
    }

    pub fn unread_hint(&self, account_id: &str, folder: &str) -> Option<u32> {
        let folders = self.folders.read().unwrap_or_else(|e| e.into_inner());
        folders.get(&key(account_id, folder)).and_then(|d| d.unread_hint)
    }

    /// Override the last-sync stamp (wake cooldown tests)
    pub fn set_last_sync(&self, account_id: &str, folder: &str, at: DateTime<Utc>) {
        let mut folders = self.folders.write().unwrap_or_else(|e| e.into_inner());
        folders.entry(key(account_id, folder)).or_default().last_sync = Some(at);
    }
}

impl LocalStore for MemoryStore {
    fn sync_state(&self, account_id: &str, folder: &str) -> Result<FolderSyncState> {
        let folders = self.folders.read().map_err(poisoned)?;
        Ok(folders
            .get(&key(account_id, folder))
            .map(|d| FolderSyncState {
                uid_validity: d.uid_validity,
                highest_uid: d.highest_uid(),
                message_count: d.messages.len() as u32,
                last_sync: d.last_sync,
            })
            .unwrap_or_default())
    }

    fn apply_header_delta(
        &self,
        account_id: &str,
        folder: &str,
        delta: &HeaderDelta,
    ) -> Result<DeltaSummary> {
        let mut folders = self.folders.write().map_err(poisoned)?;
        let data = folders.entry(key(account_id, folder)).or_default();
        let mut summary = DeltaSummary::default();

        if delta.reset {
            summary.removed += data.messages.len() as u32;
            data.messages.clear();
        }
        data.uid_validity = Some(delta.uid_validity);

        for uid in &delta.vanished {
            if data.messages.remove(uid).is_some() {
                summary.removed += 1;
            }
        }

        for update in &delta.flag_updates {
            if let Some(stored) = data.messages.get_mut(&update.uid) {
                if stored.header.flags != update.flags {
                    stored.header.flags = update.flags.clone();
                    summary.updated += 1;
                }
            }
        }

        for header in &delta.new_headers {
            let previous = data.messages.insert(
                header.uid,
                StoredMessage {
                    header: header.clone(),
                    body: None,
                },
            );
            match previous {
                Some(_) => summary.updated += 1,
                None => summary.added += 1,
            }
        }

        data.last_sync = Some(Utc::now());
        Ok(summary)
    }

    fn known_uids(&self, account_id: &str, folder: &str) -> Result<Vec<u32>> {
        let folders = self.folders.read().map_err(poisoned)?;
        Ok(folders
            .get(&key(account_id, folder))
            .map(|d| d.messages.keys().copied().collect())
            .unwrap_or_default())
    }

    fn pending_bodies(&self, account_id: &str, folder: &str, limit: usize) -> Result<Vec<u32>> {
        let folders = self.folders.read().map_err(poisoned)?;
        Ok(folders
            .get(&key(account_id, folder))
            .map(|d| {
                d.messages
                    .iter()
                    .rev()
                    .filter(|(_, m)| m.body.is_none())
                    .map(|(uid, _)| *uid)
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn mark_body_fetched(
        &self,
        account_id: &str,
        folder: &str,
        uid: u32,
        body: &[u8],
    ) -> Result<()> {
        let mut folders = self.folders.write().map_err(poisoned)?;
        let stored = folders
            .get_mut(&key(account_id, folder))
            .and_then(|d| d.messages.get_mut(&uid))
            .ok_or_else(|| SyncError::Store(format!("message {} not found in {}", uid, folder)))?;
        stored.body = Some(body.to_vec());
        Ok(())
    }

    fn last_sync(&self, account_id: &str, folder: &str) -> Result<Option<DateTime<Utc>>> {
        let folders = self.folders.read().map_err(poisoned)?;
        Ok(folders.get(&key(account_id, folder)).and_then(|d| d.last_sync))
    }

    fn count_unread(&self, account_id: &str, folder: &str) -> Result<u32> {
        let folders = self.folders.read().map_err(poisoned)?;
        Ok(folders
            .get(&key(account_id, folder))
            .map(|d| d.messages.values().filter(|m| m.header.is_unread()).count() as u32)
            .unwrap_or(0))
    }

    fn message_count(&self, account_id: &str, folder: &str) -> Result<u32> {
        let folders = self.folders.read().map_err(poisoned)?;
        Ok(folders
            .get(&key(account_id, folder))
            .map(|d| d.messages.len() as u32)
            .unwrap_or(0))
    }

    fn update_flags(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
        flags: &[Flag],
        add: bool,
    ) -> Result<()> {
        let mut folders = self.folders.write().map_err(poisoned)?;
        let data = folders
            .get_mut(&key(account_id, folder))
            .ok_or_else(|| SyncError::Store(format!("folder {} not found", folder)))?;

        for uid in uids {
            if let Some(stored) = data.messages.get_mut(uid) {
                let current = &mut stored.header.flags;
                for flag in flags {
                    if add {
                        if !current.contains(flag) {
                            current.push(flag.clone());
                        }
                    } else {
                        current.retain(|f| f != flag);
                    }
                }
            }
        }
        Ok(())
    }

    fn move_messages(&self, account_id: &str, from: &str, to: &str, uids: &[u32]) -> Result<()> {
        let mut folders = self.folders.write().map_err(poisoned)?;

        let moved: Vec<StoredMessage> = match folders.get_mut(&key(account_id, from)) {
            Some(source) => uids.iter().filter_map(|uid| source.messages.remove(uid)).collect(),
            None => return Err(SyncError::Store(format!("folder {} not found", from))),
        };

        // Destination UIDs are assigned by the server; the next sync of the
        // destination replaces these provisional entries.
        let target = folders.entry(key(account_id, to)).or_default();
        let mut next_uid = target.highest_uid();
        for mut message in moved {
            next_uid += 1;
            message.header.uid = next_uid;
            target.messages.insert(next_uid, message);
        }
        Ok(())
    }

    fn delete_messages(&self, account_id: &str, folder: &str, uids: &[u32]) -> Result<()> {
        let mut folders = self.folders.write().map_err(poisoned)?;
        if let Some(data) = folders.get_mut(&key(account_id, folder)) {
            for uid in uids {
                data.messages.remove(uid);
            }
        }
        Ok(())
    }

    fn set_unread_hint(&self, account_id: &str, folder: &str, unread: u32) -> Result<()> {
        let mut folders = self.folders.write().map_err(poisoned)?;
        folders.entry(key(account_id, folder)).or_default().unread_hint = Some(unread);
        Ok(())
    }
}
