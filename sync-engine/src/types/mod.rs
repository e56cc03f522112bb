pub mod error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use error::{Result, SyncError};

/// Identifies one sync scope: a folder of an account.
///
/// An empty `folder_id` is the account-wide scope and matches every
/// folder of the account when cancelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub account_id: String,
    pub folder_id: String,
}

impl ScopeKey {
    pub fn new(account_id: impl Into<String>, folder_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            folder_id: folder_id.into(),
        }
    }

    /// Scope covering every folder of an account
    pub fn account(account_id: impl Into<String>) -> Self {
        Self::new(account_id, "")
    }

    pub fn is_account_wide(&self) -> bool {
        self.folder_id.is_empty()
    }

    /// Prefix match used for bulk cancellation
    pub fn covers(&self, other: &ScopeKey) -> bool {
        self.account_id == other.account_id
            && (self.is_account_wide() || self.folder_id == other.folder_id)
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_account_wide() {
            write!(f, "{}/*", self.account_id)
        } else {
            write!(f, "{}/{}", self.account_id, self.folder_id)
        }
    }
}

/// Message flag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flag {
    Seen,
    Flagged,
    Answered,
    Deleted,
    Draft,
    Custom(String),
}

impl Flag {
    /// Wire spelling of the flag
    pub fn as_imap(&self) -> &str {
        match self {
            Self::Seen => "\\Seen",
            Self::Flagged => "\\Flagged",
            Self::Answered => "\\Answered",
            Self::Deleted => "\\Deleted",
            Self::Draft => "\\Draft",
            Self::Custom(name) => name,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "\\seen" => Self::Seen,
            "\\flagged" => Self::Flagged,
            "\\answered" => Self::Answered,
            "\\deleted" => Self::Deleted,
            "\\draft" => Self::Draft,
            _ => Self::Custom(raw.to_string()),
        }
    }
}

/// Result of selecting a mailbox
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStatus {
    pub name: String,
    pub exists: u32,
    pub uid_validity: u32,
    pub uid_next: Option<u32>,
    pub unseen: Option<u32>,
}

/// Envelope data fetched during header sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub uid: u32,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub flags: Vec<Flag>,
    pub size: Option<u32>,
}

impl MessageHeader {
    pub fn is_unread(&self) -> bool {
        !self.flags.contains(&Flag::Seen)
    }
}

/// Current flags of an already-known message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagUpdate {
    pub uid: u32,
    pub flags: Vec<Flag>,
}

/// Everything one header sync learned about a folder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderDelta {
    pub uid_validity: u32,
    /// UIDVALIDITY changed: cached UIDs are meaningless and must be dropped
    pub reset: bool,
    pub exists: u32,
    pub new_headers: Vec<MessageHeader>,
    pub flag_updates: Vec<FlagUpdate>,
    pub vanished: Vec<u32>,
}

/// What the local store changed when applying a [`HeaderDelta`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSummary {
    pub added: u32,
    pub updated: u32,
    pub removed: u32,
}

/// Per-folder sync bookkeeping kept by the local store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderSyncState {
    pub uid_validity: Option<u32>,
    pub highest_uid: u32,
    pub message_count: u32,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Kind of server-side change reported by a push session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    NewMail,
    Expunge,
    FlagsChanged,
}

/// New-mail / change notification handed to the orchestration layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMailInfo {
    pub account_id: String,
    pub kind: ChangeKind,
    pub mailbox: String,
    pub count: Option<u32>,
}
