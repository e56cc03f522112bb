//! System sleep/wake handling
//!
//! On sleep every socket is torn down right away. On wake we wait
//! (bounded) for the network, resume polling and push, then resync
//! primary folders that are not fresh already.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::adapters::connectivity::{wait_for_online, Connectivity};
use crate::adapters::store::LocalStore;
use crate::config::PowerConfig;
use crate::sync::idle::PushListener;
use crate::sync::orchestrator::{SyncOrchestrator, SyncOutcome};
use crate::sync::scheduler::Scheduler;
use crate::types::ScopeKey;

/// True if a scope last synced at `last_sync` is due again at `now`
pub fn cooldown_elapsed(
    last_sync: Option<DateTime<Utc>>,
    cooldown: chrono::Duration,
    now: DateTime<Utc>,
) -> bool {
    match last_sync {
        Some(last) => now - last >= cooldown,
        None => true,
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WakeReport {
    pub online: bool,
    pub resynced: Vec<ScopeKey>,
    /// Synced within the cooldown window
    pub skipped: Vec<ScopeKey>,
}

/// Reacts to system sleep and wake signals from the embedding app
pub struct PowerCoordinator {
    orchestrator: SyncOrchestrator,
    scheduler: Scheduler,
    push: PushListener,
    store: Arc<dyn LocalStore>,
    connectivity: Arc<dyn Connectivity>,
    config: PowerConfig,
    asleep: AtomicBool,
}

impl PowerCoordinator {
    pub fn new(
        orchestrator: SyncOrchestrator,
        scheduler: Scheduler,
        push: PushListener,
        store: Arc<dyn LocalStore>,
        connectivity: Arc<dyn Connectivity>,
        config: PowerConfig,
    ) -> Self {
        Self {
            orchestrator,
            scheduler,
            push,
            store,
            connectivity,
            config,
            asleep: AtomicBool::new(false),
        }
    }

    pub fn is_asleep(&self) -> bool {
        self.asleep.load(Ordering::SeqCst)
    }

    /// Stop polling and push, cancel every sync and close every pooled
    /// connection. Returns how many syncs were cancelled.
    pub fn on_sleep(&self) -> usize {
        self.asleep.store(true, Ordering::SeqCst);
        info!("System going to sleep, tearing down connections");

        self.scheduler.pause();
        self.push.pause();
        self.orchestrator.cancel_all()
    }

    /// Wait for the network, resume polling and push, then resync stale
    /// primary folders. Returns what was resynced and what was skipped.
    pub async fn on_wake(&self) -> WakeReport {
        let was_asleep = self.asleep.swap(false, Ordering::SeqCst);
        info!(was_asleep, "System woke up");

        let timeout = self.config.wake_connectivity_timeout();
        let online = wait_for_online(self.connectivity.as_ref(), timeout).await;
        if !online {
            warn!("Still offline {:?} after wake; resuming without a resync", timeout);
        }

        self.scheduler.resume();
        self.push.resume();

        let mut report = WakeReport {
            online,
            ..Default::default()
        };
        if !online {
            return report;
        }

        let now = Utc::now();
        let cooldown = self.config.resync_cooldown();
        for account_id in self.scheduler.account_ids() {
            let Some(folder) = self.scheduler.primary_folder(&account_id) else {
                continue;
            };
            let last_sync = self.store.last_sync(&account_id, &folder).unwrap_or_else(|e| {
                warn!("Failed to read last sync for {}/{}: {}", account_id, folder, e);
                None
            });

            let key = ScopeKey::new(account_id, folder);
            if cooldown_elapsed(last_sync, cooldown, now) {
                report.resynced.push(key);
            } else {
                debug!(scope = %key, "Synced recently, skipping wake resync");
                report.skipped.push(key);
            }
        }

        // Debounced, so a burst of wake signals collapses into one sync
        let syncs = report
            .resynced
            .iter()
            .map(|key| self.orchestrator.request_sync(&key.account_id, &key.folder_id));
        for (key, outcome) in report.resynced.iter().zip(join_all(syncs).await) {
            if let SyncOutcome::Failed(e) = outcome {
                warn!(scope = %key, "Wake resync failed: {}", e);
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::connectivity::ConnectivityMonitor;
    use crate::adapters::memory_store::MemoryStore;
    use crate::config::{AccountConfig, IdleConfig, OrchestratorConfig, PoolConfig, SchedulerConfig};
    use crate::pool::ConnectionPool;
    use crate::sync::registry::ScopeRegistry;
    use crate::testing::{header, settle, MockConnector, RecordingSink};
    use chrono::Duration;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_cooldown_elapsed() {
        let now = Utc::now();
        let cooldown = Duration::seconds(120);

        assert!(cooldown_elapsed(None, cooldown, now));
        assert!(!cooldown_elapsed(Some(now - Duration::seconds(30)), cooldown, now));
        assert!(cooldown_elapsed(Some(now - Duration::seconds(120)), cooldown, now));
        assert!(cooldown_elapsed(Some(now - Duration::hours(24)), cooldown, now));
    }

    struct Fixture {
        connector: MockConnector,
        connectivity: Arc<ConnectivityMonitor>,
        store: Arc<MemoryStore>,
        orchestrator: SyncOrchestrator,
        scheduler: Scheduler,
        push: PushListener,
        power: PowerCoordinator,
    }

    fn fixture() -> Fixture {
        let connector = MockConnector::new();
        connector.add_message("INBOX", header(1, &[]));

        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingSink::default());
        let connectivity = Arc::new(ConnectivityMonitor::new(true));
        let config = OrchestratorConfig::default();
        let orchestrator = SyncOrchestrator::new(
            ConnectionPool::new(PoolConfig::default(), connector.factory()),
            store.clone(),
            events.clone(),
            Arc::new(ScopeRegistry::new(config.debounce())),
            config,
            CancellationToken::new(),
        );

        let registry = orchestrator.registry().clone();
        let scheduler = Scheduler::new(
            orchestrator.clone(),
            store.clone(),
            events,
            connectivity.clone(),
            Arc::new(move |key: &ScopeKey| registry.is_active(key)),
            SchedulerConfig::default(),
        );
        scheduler.add_account(AccountConfig::new("acct1"));

        let (push, _rx) = PushListener::new(connector.factory(), IdleConfig::default());
        let power = PowerCoordinator::new(
            orchestrator.clone(),
            scheduler.clone(),
            push.clone(),
            store.clone(),
            connectivity.clone(),
            PowerConfig::default(),
        );

        Fixture {
            connector,
            connectivity,
            store,
            orchestrator,
            scheduler,
            push,
            power,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_tears_everything_down() {
        let fx = fixture();
        fx.push.start(&CancellationToken::new());
        fx.push.start_account("acct1", "Work", "INBOX");
        fx.orchestrator.sync_scope("acct1", "INBOX").await;
        settle().await;
        assert_eq!(fx.connector.open_sessions(), 2);

        fx.power.on_sleep();
        settle().await;

        assert!(fx.power.is_asleep());
        assert!(fx.scheduler.is_paused());
        assert!(fx.push.is_paused());
        assert_eq!(fx.orchestrator.pool().stats("acct1").live(), 0);
        assert_eq!(fx.connector.open_sessions(), 0);
        fx.push.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_waits_for_network_then_resyncs() {
        let fx = fixture();
        fx.push.start(&CancellationToken::new());
        fx.push.start_account("acct1", "Work", "INBOX");
        settle().await;

        fx.power.on_sleep();
        fx.connectivity.set_online(false);

        let connectivity = fx.connectivity.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            connectivity.set_online(true);
        });

        let report = fx.power.on_wake().await;
        assert!(report.online);
        assert_eq!(report.resynced, vec![ScopeKey::new("acct1", "INBOX")]);
        assert!(!fx.scheduler.is_paused());
        assert!(!fx.push.is_paused());
        assert_eq!(fx.store.headers("acct1", "INBOX").len(), 1);

        settle().await;
        assert!(fx.push.is_running("acct1"));
        fx.push.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_cooldown_skips_fresh_scope() {
        let fx = fixture();
        fx.orchestrator.sync_scope("acct1", "INBOX").await;
        let headers_before = fx.connector.op_count("fetch_headers");

        fx.power.on_sleep();
        let report = fx.power.on_wake().await;
        assert!(report.resynced.is_empty());
        assert_eq!(report.skipped, vec![ScopeKey::new("acct1", "INBOX")]);
        assert_eq!(fx.connector.op_count("fetch_headers"), headers_before);

        // Stale scope is resynced
        fx.store
            .set_last_sync("acct1", "INBOX", Utc::now() - Duration::minutes(10));
        let report = fx.power.on_wake().await;
        assert_eq!(report.resynced.len(), 1);
        assert_eq!(fx.connector.op_count("fetch_headers"), headers_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_while_offline_resumes_without_resync() {
        let fx = fixture();
        fx.power.on_sleep();
        fx.connectivity.set_online(false);

        let report = fx.power.on_wake().await;
        assert!(!report.online);
        assert!(report.resynced.is_empty());
        assert!(!fx.scheduler.is_paused());
        assert_eq!(fx.connector.connect_calls(), 0);
    }
}
