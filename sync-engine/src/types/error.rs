//! Unified error types for the sync core
//!
//! Errors are classified by kind at the lowest layer that talks to the
//! transport, so the pool and orchestrator never inspect message text:
//! - connection-level failures are discarded and retried once
//! - authentication and trust failures surface as distinct signals
//! - cancellation means "superseded", never a user-visible failure

use serde::Serialize;
use thiserror::Error;

/// Sync core error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Server connection limit exceeded: {0}")]
    ConnectionLimit(String),

    #[error("Reauthorization required for account {account} ({provider})")]
    ReauthRequired { provider: String, account: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Untrusted certificate for {host} (fingerprint {fingerprint})")]
    UntrustedCertificate { host: String, fingerprint: String },

    #[error("Connection pool closed for account {0}")]
    PoolClosed(String),

    #[error("Timed out waiting for a pooled connection for account {0}")]
    PoolTimeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Transport-level failure: the borrowed session must be discarded.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, SyncError::Connection(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Worth another round-trip later. Authentication, trust, protocol
    /// and store failures are permanent until something else changes.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Connection(_)
                | SyncError::ConnectionLimit(_)
                | SyncError::PoolClosed(_)
                | SyncError::PoolTimeout(_)
                | SyncError::Timeout(_)
        )
    }
}

/// Substrings that mark a transport failure in collaborator error text.
const CONNECTION_SIGNATURES: &[&str] = &[
    "connection closed",
    "closed connection",
    "connection reset",
    "reset by peer",
    "broken pipe",
    "unexpected eof",
    "end of file",
    "end of stream",
    "timed out",
    "timeout",
    "connection refused",
    "no such host",
    "name resolution",
    "dns lookup",
    "dns error",
    "network is unreachable",
    "network unreachable",
];

const LIMIT_SIGNATURES: &[&str] = &[
    "too many connections",
    "maximum connections",
    "max connections",
    "connection limit",
];

/// Classify a raw error string coming out of a session implementation.
///
/// Meant for connector/session adapters only. Anything above the adapter
/// layer matches on [`SyncError`] variants instead.
pub fn classify_transport_message(message: &str) -> SyncError {
    let lower = message.to_lowercase();

    if LIMIT_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
        return SyncError::ConnectionLimit(message.to_string());
    }

    if CONNECTION_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
        return SyncError::Connection(message.to_string());
    }

    SyncError::Protocol(message.to_string())
}

// Serialize as a plain string to match what event consumers display.
impl Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::TimedOut => SyncError::Connection(err.to_string()),
            _ => classify_transport_message(&err.to_string()),
        }
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Other(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        SyncError::Timeout(err.to_string())
    }
}

/// Result type alias using SyncError
pub type Result<T> = std::result::Result<T, SyncError>;
