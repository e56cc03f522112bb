use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::types::error::SyncError;

/// Sync engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub flags: FlagRetryConfig,

    #[serde(default)]
    pub idle: IdleConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub power: PowerConfig,

    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Connection pool limits and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum live sessions per account
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// How long an acquirer may wait in the queue when the pool is exhausted
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,

    /// Idle sessions older than this are closed by the reaper
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Pause before the single retry after the server reports its own
    /// connection limit (it has not yet noticed our dead sessions)
    #[serde(default = "default_limit_retry_backoff_secs")]
    pub limit_retry_backoff_secs: u64,
}

/// Sync orchestration tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Requests for the same scope closer than this are dropped
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Upper bound on waiting for a superseded generation to exit
    #[serde(default = "default_prior_exit_grace_ms")]
    pub prior_exit_grace_ms: u64,

    /// Bound on the destination refresh after a move
    #[serde(default = "default_move_refresh_timeout_secs")]
    pub move_refresh_timeout_secs: u64,

    /// Bodies fetched per borrowed connection
    #[serde(default = "default_body_batch_size")]
    pub body_batch_size: usize,
}

/// Remote flag push retries (on top of the connection-level retry)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagRetryConfig {
    #[serde(default = "default_flag_max_retries")]
    pub max_retries: u32,

    /// Linear backoff step: retry N waits N * step
    #[serde(default = "default_flag_backoff_step_ms")]
    pub backoff_step_ms: u64,
}

/// Push (IDLE) session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleConfig {
    /// IDLE timeout in minutes (re-issue before NAT timeout)
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u64,

    #[serde(default = "default_reconnect_initial_secs")]
    pub reconnect_initial_secs: u64,

    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
}

/// Periodic polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Granularity of the scheduler loop
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,

    /// Poll interval for accounts that do not set their own
    #[serde(default = "default_poll_interval_seconds")]
    pub default_poll_interval_seconds: u64,
}

/// Sleep/wake handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConfig {
    #[serde(default = "default_wake_connectivity_timeout_secs")]
    pub wake_connectivity_timeout_secs: u64,

    /// Skip the wake resync for scopes synced more recently than this
    #[serde(default = "default_resync_cooldown_secs")]
    pub resync_cooldown_secs: u64,
}

/// Account configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,

    /// Display name for logs
    pub name: Option<String>,

    /// Scope polled by the scheduler and watched by the push session
    #[serde(default = "default_primary_folder")]
    pub primary_folder: String,

    pub poll_interval_seconds: Option<u64>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Keep a push (IDLE) session open for the primary folder
    #[serde(default = "default_true")]
    pub push: bool,
}

impl AccountConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            primary_folder: default_primary_folder(),
            poll_interval_seconds: None,
            enabled: true,
            push: true,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

fn default_max_connections() -> usize {
    4
}

fn default_wait_timeout_secs() -> u64 {
    120
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_limit_retry_backoff_secs() -> u64 {
    30
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_prior_exit_grace_ms() -> u64 {
    2_000
}

fn default_move_refresh_timeout_secs() -> u64 {
    300
}

fn default_body_batch_size() -> usize {
    25
}

fn default_flag_max_retries() -> u32 {
    3
}

fn default_flag_backoff_step_ms() -> u64 {
    1_000
}

fn default_idle_timeout_minutes() -> u64 {
    20 // Re-issue before 29-minute NAT timeout
}

fn default_reconnect_initial_secs() -> u64 {
    5
}

fn default_reconnect_max_secs() -> u64 {
    300
}

fn default_tick_seconds() -> u64 {
    15
}

fn default_poll_interval_seconds() -> u64 {
    300
}

fn default_wake_connectivity_timeout_secs() -> u64 {
    30
}

fn default_resync_cooldown_secs() -> u64 {
    120
}

fn default_primary_folder() -> String {
    "INBOX".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            wait_timeout_secs: default_wait_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            limit_retry_backoff_secs: default_limit_retry_backoff_secs(),
        }
    }
}

impl PoolConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn limit_retry_backoff(&self) -> Duration {
        Duration::from_secs(self.limit_retry_backoff_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            prior_exit_grace_ms: default_prior_exit_grace_ms(),
            move_refresh_timeout_secs: default_move_refresh_timeout_secs(),
            body_batch_size: default_body_batch_size(),
        }
    }
}

impl OrchestratorConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn prior_exit_grace(&self) -> Duration {
        Duration::from_millis(self.prior_exit_grace_ms)
    }

    pub fn move_refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.move_refresh_timeout_secs)
    }
}

impl Default for FlagRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_flag_max_retries(),
            backoff_step_ms: default_flag_backoff_step_ms(),
        }
    }
}

impl FlagRetryConfig {
    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_step_ms * u64::from(retry))
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: default_idle_timeout_minutes(),
            reconnect_initial_secs: default_reconnect_initial_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
        }
    }
}

impl IdleConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes * 60)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_secs(self.reconnect_initial_secs.max(1))
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs.max(self.reconnect_initial_secs))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
            default_poll_interval_seconds: default_poll_interval_seconds(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.max(1))
    }

    pub fn poll_interval_for(&self, account: &AccountConfig) -> Duration {
        Duration::from_secs(
            account
                .poll_interval_seconds
                .unwrap_or(self.default_poll_interval_seconds)
                .max(1),
        )
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            wake_connectivity_timeout_secs: default_wake_connectivity_timeout_secs(),
            resync_cooldown_secs: default_resync_cooldown_secs(),
        }
    }
}

impl PowerConfig {
    pub fn wake_connectivity_timeout(&self) -> Duration {
        Duration::from_secs(self.wake_connectivity_timeout_secs)
    }

    pub fn resync_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.resync_cooldown_secs as i64)
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // XDG config path
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("eddie.chat").join("sync.toml"));
    }

    // Home directory fallback
    if let Some(home_dir) = dirs::home_dir() {
        paths.push(
            home_dir
                .join(".config")
                .join("eddie.chat")
                .join("sync.toml"),
        );
    }

    paths
}

impl EngineConfig {
    /// Load configuration from the first default path that exists
    pub fn load() -> Result<Self, SyncError> {
        for path in default_config_paths() {
            if path.exists() {
                info!("Found sync config at: {:?}", path);
                return Self::from_path(&path);
            }
        }

        info!("No sync config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific path
    pub fn from_path(path: &Path) -> Result<Self, SyncError> {
        info!("Loading sync configuration from: {:?}", path);

        let content = fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("Failed to read config: {}", e)))?;

        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SyncError> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.pool.max_connections == 0 {
            return Err(SyncError::Config(
                "pool.max_connections must be at least 1".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.id.is_empty() {
                return Err(SyncError::Config("account id must not be empty".to_string()));
            }
            if !seen.insert(account.id.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate account id: {}",
                    account.id
                )));
            }
        }

        Ok(())
    }

    pub fn account(&self, account_id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.pool.wait_timeout(), Duration::from_secs(120));
        assert_eq!(config.orchestrator.debounce(), Duration::from_millis(500));
        assert_eq!(config.flags.backoff(1), Duration::from_secs(1));
        assert_eq!(config.flags.backoff(3), Duration::from_secs(3));
        assert_eq!(config.idle.idle_timeout(), Duration::from_secs(20 * 60));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [pool]
            max_connections = 2

            [[accounts]]
            id = "acct1"
            name = "Work"
            poll_interval_seconds = 60

            [[accounts]]
            id = "acct2"
            primary_folder = "Inbox"
            push = false
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.max_connections, 2);
        assert_eq!(config.pool.idle_timeout_secs, 300);
        assert_eq!(config.accounts.len(), 2);

        let work = config.account("acct1").unwrap();
        assert_eq!(work.primary_folder, "INBOX");
        assert!(work.enabled && work.push);
        assert_eq!(work.display_name(), "Work");
        assert_eq!(
            config.scheduler.poll_interval_for(work),
            Duration::from_secs(60)
        );

        let other = config.account("acct2").unwrap();
        assert_eq!(other.primary_folder, "Inbox");
        assert!(!other.push);
        assert_eq!(
            config.scheduler.poll_interval_for(other),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_rejects_invalid_config() {
        let err = EngineConfig::from_toml_str("[pool]\nmax_connections = 0\n").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));

        let err = EngineConfig::from_toml_str(
            "[[accounts]]\nid = \"a\"\n[[accounts]]\nid = \"a\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));

        assert!(EngineConfig::from_toml_str("pool = 3").is_err());
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[orchestrator]\ndebounce_ms = 250").unwrap();

        let config = EngineConfig::from_path(file.path()).unwrap();
        assert_eq!(config.orchestrator.debounce_ms, 250);

        let missing = EngineConfig::from_path(Path::new("/nonexistent/eddie/sync.toml"));
        assert!(matches!(missing, Err(SyncError::Config(_))));
    }
}
