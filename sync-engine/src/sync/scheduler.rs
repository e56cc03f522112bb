//! Periodic polling
//!
//! One loop ticks every few seconds and syncs the primary folder of each
//! account whose poll interval has elapsed. A tick does nothing while
//! offline or paused, and skips any account whose primary scope is
//! already syncing.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::connectivity::Connectivity;
use crate::adapters::store::LocalStore;
use crate::config::{AccountConfig, SchedulerConfig};
use crate::events::{EventSink, SyncEvent};
use crate::sync::orchestrator::{SyncOrchestrator, SyncOutcome};
use crate::types::error::{Result, SyncError};
use crate::types::{ChangeKind, NewMailInfo, ScopeKey};

/// "Is a sync already running for this scope"
pub type ActiveCheck = Arc<dyn Fn(&ScopeKey) -> bool + Send + Sync>;

struct ScheduledAccount {
    config: AccountConfig,
    interval: Duration,
    next_due: Instant,
    /// Primary folder message count at the last completed sync
    last_count: Option<u32>,
}

struct SchedulerInner {
    orchestrator: SyncOrchestrator,
    store: Arc<dyn LocalStore>,
    events: Arc<dyn EventSink>,
    connectivity: Arc<dyn Connectivity>,
    is_active: ActiveCheck,
    config: SchedulerConfig,
    accounts: Mutex<HashMap<String, ScheduledAccount>>,
    paused: AtomicBool,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        orchestrator: SyncOrchestrator,
        store: Arc<dyn LocalStore>,
        events: Arc<dyn EventSink>,
        connectivity: Arc<dyn Connectivity>,
        is_active: ActiveCheck,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                orchestrator,
                store,
                events,
                connectivity,
                is_active,
                config,
                accounts: Mutex::new(HashMap::new()),
                paused: AtomicBool::new(false),
            }),
        }
    }

    fn accounts(&self) -> MutexGuard<'_, HashMap<String, ScheduledAccount>> {
        self.inner.accounts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Schedule an account; its first poll is due immediately
    pub fn add_account(&self, account: AccountConfig) {
        let interval = self.inner.config.poll_interval_for(&account);
        info!(
            "Scheduling {} every {:?} (primary folder {})",
            account.display_name(),
            interval,
            account.primary_folder
        );
        self.accounts().insert(
            account.id.clone(),
            ScheduledAccount {
                config: account,
                interval,
                next_due: Instant::now(),
                last_count: None,
            },
        );
    }

    pub fn remove_account(&self, account_id: &str) {
        self.accounts().remove(account_id);
    }

    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.accounts().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn primary_folder(&self, account_id: &str) -> Option<String> {
        self.accounts()
            .get(account_id)
            .map(|a| a.config.primary_folder.clone())
    }

    /// Skip ticks until [`Self::resume`]
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!("Scheduler paused");
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!("Scheduler resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Accounts whose interval has elapsed and whose primary scope is idle
    fn due_accounts(&self) -> Vec<String> {
        let now = Instant::now();
        let mut accounts = self.accounts();
        let mut due = Vec::new();

        for (id, account) in accounts.iter_mut() {
            if !account.config.enabled || account.next_due > now {
                continue;
            }
            account.next_due = now + account.interval;

            let key = ScopeKey::new(id.clone(), account.config.primary_folder.clone());
            if (self.inner.is_active)(&key) {
                debug!(scope = %key, "Sync already active, skipping scheduled poll");
                continue;
            }
            due.push(id.clone());
        }
        due.sort();
        due
    }

    /// Run one scheduling pass. Returns the accounts that were polled.
    pub async fn tick(&self) -> Vec<String> {
        if self.is_paused() {
            return Vec::new();
        }
        if !self.inner.connectivity.is_online() {
            debug!("Offline, skipping scheduled poll");
            return Vec::new();
        }

        let due = self.due_accounts();
        let polls = due.iter().map(|account_id| async move {
            if let Err(e) = self.sync_and_report(account_id).await {
                warn!("Scheduled sync failed for {}: {}", account_id, e);
            }
        });
        join_all(polls).await;
        due
    }

    /// Sync the account's primary folder now and report new mail.
    ///
    /// The first completed sync only records the message count; later
    /// ones emit `mail:new` when it grew.
    pub async fn sync_and_report(&self, account_id: &str) -> Result<Option<NewMailInfo>> {
        let folder = self
            .primary_folder(account_id)
            .ok_or_else(|| SyncError::AccountNotFound(account_id.to_string()))?;

        match self.inner.orchestrator.sync_scope(account_id, &folder).await {
            SyncOutcome::Completed(_) => {}
            SyncOutcome::Superseded | SyncOutcome::Debounced => return Ok(None),
            SyncOutcome::Failed(e) => return Err(e),
        }

        let count = self.inner.store.message_count(account_id, &folder)?;
        let previous = {
            let mut accounts = self.accounts();
            match accounts.get_mut(account_id) {
                Some(account) => account.last_count.replace(count),
                None => return Ok(None),
            }
        };

        let new_messages = match previous {
            Some(previous) if count > previous => count - previous,
            _ => return Ok(None),
        };

        info!("{} new message(s) in {}/{}", new_messages, account_id, folder);
        let info = NewMailInfo {
            account_id: account_id.to_string(),
            kind: ChangeKind::NewMail,
            mailbox: folder,
            count: Some(new_messages),
        };
        self.inner.events.emit(SyncEvent::NewMail(info.clone()));
        Ok(Some(info))
    }

    /// Tick until `shutdown` is cancelled
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        let period = self.inner.config.tick();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        scheduler.tick().await;
                    }
                }
            }
            debug!("Scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::connectivity::ConnectivityMonitor;
    use crate::adapters::memory_store::MemoryStore;
    use crate::config::{OrchestratorConfig, PoolConfig};
    use crate::pool::ConnectionPool;
    use crate::sync::registry::ScopeRegistry;
    use crate::testing::{header, MockConnector, RecordingSink};

    struct Fixture {
        connector: MockConnector,
        connectivity: Arc<ConnectivityMonitor>,
        events: Arc<RecordingSink>,
        scheduler: Scheduler,
    }

    fn fixture(is_active: ActiveCheck) -> Fixture {
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

        let scheduler = Scheduler::new(
            orchestrator,
            store,
            events.clone(),
            connectivity.clone(),
            is_active,
            SchedulerConfig::default(),
        );
        let mut account = AccountConfig::new("acct1");
        account.poll_interval_seconds = Some(60);
        scheduler.add_account(account);

        Fixture {
            connector,
            connectivity,
            events,
            scheduler,
        }
    }

    fn never_active() -> ActiveCheck {
        Arc::new(|_: &ScopeKey| false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_tick_is_skipped() {
        let fx = fixture(never_active());
        fx.connectivity.set_online(false);

        assert!(fx.scheduler.tick().await.is_empty());
        assert_eq!(fx.connector.connect_calls(), 0);

        fx.connectivity.set_online(true);
        assert_eq!(fx.scheduler.tick().await, vec!["acct1".to_string()]);
        assert_eq!(fx.connector.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_scope_is_not_raced() {
        let fx = fixture(Arc::new(|key: &ScopeKey| key.folder_id == "INBOX"));

        assert!(fx.scheduler.tick().await.is_empty());
        assert_eq!(fx.connector.connect_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_and_pause() {
        let fx = fixture(never_active());

        assert_eq!(fx.scheduler.tick().await.len(), 1);
        assert!(fx.scheduler.tick().await.is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        fx.scheduler.pause();
        assert!(fx.scheduler.tick().await.is_empty());

        fx.scheduler.resume();
        assert_eq!(fx.scheduler.tick().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_mail_delta() {
        let fx = fixture(never_active());

        // First observation only records the count
        assert_eq!(fx.scheduler.sync_and_report("acct1").await.unwrap(), None);
        assert_eq!(fx.scheduler.sync_and_report("acct1").await.unwrap(), None);

        fx.connector.add_message("INBOX", header(2, &[]));
        fx.connector.add_message("INBOX", header(3, &[]));
        let info = fx.scheduler.sync_and_report("acct1").await.unwrap().unwrap();
        assert_eq!(info.count, Some(2));
        assert_eq!(info.kind, ChangeKind::NewMail);
        assert_eq!(fx.events.count("mail:new"), 1);

        // Fewer messages is not new mail
        fx.connector.remove_message("INBOX", 3);
        assert_eq!(fx.scheduler.sync_and_report("acct1").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_account() {
        let fx = fixture(never_active());
        let err = fx.scheduler.sync_and_report("nobody").await.unwrap_err();
        assert_eq!(err, SyncError::AccountNotFound("nobody".to_string()));
    }
}
