//! Sync manager state
//!
//! Owns one instance of every sync component and the background tasks
//! that connect them: pool reaper, scheduler loop, push dispatcher and
//! connectivity watcher. All accounts share the same pool and registry.

use flume::Receiver;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::connectivity::Connectivity;
use crate::adapters::session::SessionFactory;
use crate::adapters::store::LocalStore;
use crate::config::{AccountConfig, EngineConfig};
use crate::events::EventSink;
use crate::pool::ConnectionPool;
use crate::sync::actions::MessageActions;
use crate::sync::idle::PushListener;
use crate::sync::orchestrator::{SyncOrchestrator, SyncOutcome};
use crate::sync::power::PowerCoordinator;
use crate::sync::registry::ScopeRegistry;
use crate::sync::scheduler::Scheduler;
use crate::types::error::{Result, SyncError};
use crate::types::{ChangeKind, NewMailInfo, ScopeKey};

/// Owns the engine: pool, orchestrator, scheduler, push listener,
/// message actions and the sleep/wake coordinator
pub struct SyncManager {
    config: EngineConfig,
    lifetime: CancellationToken,
    orchestrator: SyncOrchestrator,
    scheduler: Scheduler,
    push: PushListener,
    push_rx: Mutex<Option<Receiver<NewMailInfo>>>,
    actions: MessageActions,
    power: Arc<PowerCoordinator>,
    connectivity: Arc<dyn Connectivity>,
    accounts: RwLock<HashMap<String, AccountConfig>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncManager {
    /// Wire every component. Nothing runs until [`Self::start`].
    pub fn new(
        config: EngineConfig,
        factory: Arc<SessionFactory>,
        store: Arc<dyn LocalStore>,
        events: Arc<dyn EventSink>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        let lifetime = CancellationToken::new();
        let pool = ConnectionPool::new(config.pool.clone(), factory.clone());
        let registry = Arc::new(ScopeRegistry::new(config.orchestrator.debounce()));

        let orchestrator = SyncOrchestrator::new(
            pool,
            store.clone(),
            events.clone(),
            registry.clone(),
            config.orchestrator.clone(),
            lifetime.clone(),
        );

        let scheduler = Scheduler::new(
            orchestrator.clone(),
            store.clone(),
            events.clone(),
            connectivity.clone(),
            Arc::new(move |key: &ScopeKey| registry.is_active(key)),
            config.scheduler.clone(),
        );

        let (push, push_rx) = PushListener::new(factory, config.idle.clone());

        let actions = MessageActions::new(
            orchestrator.clone(),
            store.clone(),
            events,
            config.flags.clone(),
            config.orchestrator.move_refresh_timeout(),
            lifetime.clone(),
        );

        let power = Arc::new(PowerCoordinator::new(
            orchestrator.clone(),
            scheduler.clone(),
            push.clone(),
            store,
            connectivity.clone(),
            config.power.clone(),
        ));

        Self {
            config,
            lifetime,
            orchestrator,
            scheduler,
            push,
            push_rx: Mutex::new(Some(push_rx)),
            actions,
            power,
            connectivity,
            accounts: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn push(&self) -> &PushListener {
        &self.push
    }

    pub fn actions(&self) -> &MessageActions {
        &self.actions
    }

    pub fn power(&self) -> &PowerCoordinator {
        &self.power
    }

    pub fn pool(&self) -> &ConnectionPool {
        self.orchestrator.pool()
    }

    /// Spawn the background tasks and register the configured accounts.
    /// Fails if called twice.
    pub async fn start(&self) -> Result<()> {
        let push_rx = self
            .push_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| SyncError::Other("sync manager already started".to_string()))?;

        info!("Starting sync manager");

        self.push.start(&self.lifetime);
        if !self.connectivity.is_online() {
            self.push.pause();
        }

        for account in self.config.accounts.clone() {
            self.add_account(account).await;
        }

        let handles = vec![
            self.pool().spawn_reaper(self.lifetime.child_token()),
            self.scheduler.spawn(self.lifetime.child_token()),
            self.spawn_dispatcher(push_rx),
            self.spawn_connectivity_watcher(),
        ];
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);
        Ok(())
    }

    /// Start polling and push for an account (replaces an existing entry)
    pub async fn add_account(&self, account: AccountConfig) {
        if !account.enabled {
            info!("Account {} is disabled, not scheduling", account.display_name());
            self.accounts.write().await.insert(account.id.clone(), account);
            return;
        }

        self.scheduler.add_account(account.clone());
        if account.push {
            self.push
                .start_account(&account.id, account.display_name(), &account.primary_folder);
        }

        let mut accounts = self.accounts.write().await;
        accounts.insert(account.id.clone(), account);
    }

    /// Stop everything for an account and close its connections
    pub async fn remove_account(&self, account_id: &str) {
        self.push.stop_account(account_id);
        self.scheduler.remove_account(account_id);
        let cancelled = self.orchestrator.cancel_account(account_id);
        self.orchestrator.registry().forget_account(account_id);
        self.pool().close_account(account_id);

        if self.accounts.write().await.remove(account_id).is_some() {
            info!("Removed account {} ({} sync(s) cancelled)", account_id, cancelled);
        }
    }

    pub async fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.accounts.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// UI entry point for "refresh this folder"
    pub async fn request_sync(&self, account_id: &str, folder_id: &str) -> Result<SyncOutcome> {
        if !self.accounts.read().await.contains_key(account_id) {
            return Err(SyncError::AccountNotFound(account_id.to_string()));
        }
        Ok(self.orchestrator.request_sync(account_id, folder_id).await)
    }

    /// Cancel everything and wait for the background tasks to exit
    pub async fn shutdown(&self) {
        info!("Shutting down sync manager");
        self.lifetime.cancel();
        self.push.stop();
        self.orchestrator.cancel_all();

        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }

    /// Drain push notifications. Every trigger is handed off as its own
    /// task so this loop never waits on pool contention.
    fn spawn_dispatcher(&self, rx: Receiver<NewMailInfo>) -> JoinHandle<()> {
        let shutdown = self.lifetime.child_token();
        let scheduler = self.scheduler.clone();
        let orchestrator = self.orchestrator.clone();

        tokio::spawn(async move {
            loop {
                let info = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv_async() => match received {
                        Ok(info) => info,
                        Err(_) => break,
                    },
                };
                dispatch_push(&scheduler, &orchestrator, info);
            }
            debug!("Push dispatcher stopped");
        })
    }

    /// Pause push sessions while offline, resume them when back online
    fn spawn_connectivity_watcher(&self) -> JoinHandle<()> {
        let shutdown = self.lifetime.child_token();
        let push = self.push.clone();
        let power = self.power.clone();
        let mut rx = self.connectivity.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *rx.borrow_and_update();
                        if !online {
                            push.pause();
                        } else if !power.is_asleep() {
                            push.resume();
                        }
                    }
                }
            }
            debug!("Connectivity watcher stopped");
        })
    }
}

/// New mail in a primary folder goes through the scheduler so it is
/// reported; anything else is a plain debounced sync request.
fn dispatch_push(scheduler: &Scheduler, orchestrator: &SyncOrchestrator, info: NewMailInfo) {
    let is_primary =
        scheduler.primary_folder(&info.account_id).as_deref() == Some(info.mailbox.as_str());
    debug!(
        account_id = %info.account_id,
        mailbox = %info.mailbox,
        kind = ?info.kind,
        "Push notification"
    );

    if info.kind == ChangeKind::NewMail && is_primary {
        let key = ScopeKey::new(info.account_id.clone(), info.mailbox.clone());
        if !orchestrator.registry().try_accept(&key) {
            return;
        }
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.sync_and_report(&info.account_id).await {
                warn!("Push-triggered sync failed for {}: {}", info.account_id, e);
            }
        });
    } else {
        orchestrator.spawn_request(&info.account_id, &info.mailbox);
    }
}
