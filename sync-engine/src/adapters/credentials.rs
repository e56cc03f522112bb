//! Credential provider seam
//!
//! The sync core never stores secrets. It asks a provider for connection
//! parameters each time a session is opened; OAuth providers may refresh
//! tokens during that call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::error::Result;

/// Secret used to authenticate a session
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthSecret {
    Password(String),
    Bearer {
        token: String,
        expires_at: Option<DateTime<Utc>>,
    },
}

impl AuthSecret {
    /// A bearer token past its expiry cannot be used to log in
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            AuthSecret::Password(_) => false,
            AuthSecret::Bearer { expires_at, .. } => expires_at.map(|t| t <= now).unwrap_or(false),
        }
    }
}

// Never print secrets in logs.
impl std::fmt::Debug for AuthSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthSecret::Password(_) => f.write_str("Password(***)"),
            AuthSecret::Bearer { expires_at, .. } => f
                .debug_struct("Bearer")
                .field("token", &"***")
                .field("expires_at", expires_at)
                .finish(),
        }
    }
}

/// Everything a connector needs to open one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub account_id: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: String,
    /// Identifies the auth provider in reauthorization prompts
    pub provider: String,
    pub secret: AuthSecret,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Resolve connection parameters for an account.
    ///
    /// Bearer tokens are returned freshness-checked; a provider that cannot
    /// refresh must fail with `SyncError::ReauthRequired`.
    async fn connection_params(&self, account_id: &str) -> Result<ConnectionParams>;
}
