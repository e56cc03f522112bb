//! Events emitted to the UI layer
//!
//! Fire-and-forget: the core never waits for acknowledgement.

use flume::{Receiver, Sender};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::types::NewMailInfo;

/// Phase reported in progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Connecting,
    Headers,
    Bodies,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    #[serde(rename_all = "camelCase")]
    SyncProgress {
        account_id: String,
        folder_id: String,
        phase: SyncPhase,
        current: u32,
        total: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    FolderSynced { account_id: String, folder_id: String },
    #[serde(rename_all = "camelCase")]
    FolderSyncError {
        account_id: String,
        folder_id: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    CertificateUntrusted {
        account_id: String,
        folder_id: String,
        host: String,
        fingerprint: String,
    },
    #[serde(rename_all = "camelCase")]
    AuthRequired { account_id: String, provider: String },
    NewMail(NewMailInfo),
    #[serde(rename_all = "camelCase")]
    FlagsChanged {
        account_id: String,
        folder_id: String,
        uids: Vec<u32>,
    },
    #[serde(rename_all = "camelCase")]
    MessagesMoved {
        account_id: String,
        from_folder: String,
        to_folder: String,
        uids: Vec<u32>,
    },
}

impl SyncEvent {
    /// Event name on the UI bus
    pub fn name(&self) -> &'static str {
        match self {
            Self::SyncProgress { .. } => "sync:progress",
            Self::FolderSynced { .. } => "folder:synced",
            Self::FolderSyncError { .. } => "folder:syncError",
            Self::CertificateUntrusted { .. } => "certificate:untrusted",
            Self::AuthRequired { .. } => "auth:required",
            Self::NewMail(_) => "mail:new",
            Self::FlagsChanged { .. } => "flags:changed",
            Self::MessagesMoved { .. } => "messages:moved",
        }
    }

    /// Terminal signals end a scope's "syncing" state in the UI
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::FolderSynced { .. }
                | Self::FolderSyncError { .. }
                | Self::CertificateUntrusted { .. }
        )
    }
}

/// Where engine signals go; the embedding app forwards them to its UI
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

/// Forwards events over a flume channel to the UI bridge
pub struct ChannelSink {
    tx: Sender<SyncEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<SyncEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: SyncEvent) {
        let name = event.name();
        if let Err(e) = self.tx.send(event) {
            warn!("Failed to emit {} event: {}", name, e);
        }
    }
}

/// Logs events; used when no UI is attached
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SyncEvent) {
        match &event {
            SyncEvent::SyncProgress { .. } => debug!(event = event.name(), ?event),
            _ => info!(event = event.name(), ?event),
        }
    }
}
