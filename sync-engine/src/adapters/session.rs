//! Mail session seam
//!
//! A session is one authenticated, stateful server connection. The command
//! grammar lives in the connector implementation; the sync core only needs
//! the operations below. Implementations must report transport failures
//! as `SyncError::Connection` (see `classify_transport_message`) so the
//! pool can tell a dead socket from a refused command.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapters::credentials::{ConnectionParams, CredentialProvider};
use crate::types::error::{Result, SyncError};
use crate::types::{Flag, FlagUpdate, MailboxStatus, MessageHeader};

/// Outcome of one blocking wait for server-pushed changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleWake {
    /// The wait hit its timeout without data; re-issue to keep NAT state alive
    Timeout,
    /// Raw untagged responses received while waiting, e.g. `* 42 EXISTS`
    Data(Vec<String>),
}

#[async_trait]
pub trait MailSession: Send {
    /// Select a mailbox read-write; later commands apply to it.
    async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus>;

    /// Headers of messages with a UID greater than `after_uid`
    async fn fetch_headers(&mut self, after_uid: u32) -> Result<Vec<MessageHeader>>;

    /// Current flags of messages with a UID up to and including `up_to_uid`
    async fn fetch_flags(&mut self, up_to_uid: u32) -> Result<Vec<FlagUpdate>>;

    /// Every UID currently in the selected mailbox
    async fn fetch_uids(&mut self) -> Result<Vec<u32>>;

    async fn fetch_body(&mut self, uid: u32) -> Result<Vec<u8>>;

    async fn copy(&mut self, uids: &[u32], target: &str) -> Result<()>;

    /// Mark deleted and expunge
    async fn delete(&mut self, uids: &[u32]) -> Result<()>;

    async fn append(&mut self, mailbox: &str, flags: &[Flag], content: &[u8]) -> Result<()>;

    async fn add_flags(&mut self, uids: &[u32], flags: &[Flag]) -> Result<()>;

    async fn remove_flags(&mut self, uids: &[u32], flags: &[Flag]) -> Result<()>;

    /// Cheap round-trip used as a liveness probe
    async fn noop(&mut self) -> Result<()>;

    /// Block until the server pushes changes for the selected mailbox or
    /// `timeout` elapses. Dropping the future abandons the wait.
    async fn idle_wait(&mut self, timeout: Duration) -> Result<IdleWake>;

    /// Graceful goodbye
    async fn logout(&mut self) -> Result<()>;

    /// Tear the transport down without a goodbye. Must not block.
    fn force_close(&mut self);

    /// Whether the transport still looks usable
    fn is_alive(&self) -> bool;
}

/// Opens a session from resolved parameters (TCP + TLS + login)
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn MailSession>>;
}

/// Combines the credential provider and the connector.
///
/// Shared by the connection pool and the push listener; neither touches
/// credentials directly.
pub struct SessionFactory {
    credentials: Arc<dyn CredentialProvider>,
    connector: Arc<dyn Connector>,
}

impl SessionFactory {
    pub fn new(credentials: Arc<dyn CredentialProvider>, connector: Arc<dyn Connector>) -> Self {
        Self {
            credentials,
            connector,
        }
    }

    /// Resolve credentials and open an authenticated session
    pub async fn open(&self, account_id: &str) -> Result<Box<dyn MailSession>> {
        let params = self.credentials.connection_params(account_id).await?;

        if params.account_id != account_id {
            warn!(
                requested = %account_id,
                resolved = %params.account_id,
                "Credential provider returned parameters for a different account"
            );
            return Err(SyncError::AccountNotFound(account_id.to_string()));
        }

        if params.secret.is_expired(Utc::now()) {
            info!(account_id = %account_id, provider = %params.provider, "Bearer token expired");
            return Err(SyncError::ReauthRequired {
                provider: params.provider.clone(),
                account: account_id.to_string(),
            });
        }

        debug!(
            account_id = %account_id,
            host = %params.host,
            port = params.port,
            "Opening mail session"
        );

        self.connector.connect(&params).await
    }
}
