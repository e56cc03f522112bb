//! Sync orchestrator
//!
//! The only place a header-sync + body-fetch generation is started. Per
//! scope key there is at most one live generation: a new one cancels the
//! old one and waits (bounded) for it to exit before contending for the
//! pool. Every generation ends in exactly one terminal event, including
//! when it is superseded or panics.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::store::LocalStore;
use crate::config::OrchestratorConfig;
use crate::events::{EventSink, SyncEvent};
use crate::pool::ConnectionPool;
use crate::sync::folder::{fetch_bodies, sync_headers, HeaderSyncReport, SyncContext};
use crate::sync::registry::{Generation, ScopeRegistry};
use crate::types::error::SyncError;
use crate::types::ScopeKey;

/// How a sync request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Dropped: the same scope was requested moments ago
    Debounced,
    /// Headers are current; the body fetch continues in the background
    Completed(HeaderSyncReport),
    /// Cancelled by a newer generation or an explicit cancel
    Superseded,
    Failed(SyncError),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&HeaderSyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Ends a generation's registration when its last phase exits
struct GenerationGuard {
    registry: Arc<ScopeRegistry>,
    generation: Generation,
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        let removed = self
            .registry
            .finish(&self.generation.key, self.generation.id);
        debug!(
            scope = %self.generation.key,
            generation = self.generation.id,
            removed,
            "Sync generation finished"
        );
        self.generation.finished.cancel();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct OrchestratorInner {
    pool: ConnectionPool,
    store: Arc<dyn LocalStore>,
    events: Arc<dyn EventSink>,
    registry: Arc<ScopeRegistry>,
    config: OrchestratorConfig,
    lifetime: CancellationToken,
}

/// Starts and cancels sync generations. Cheap to clone; clones share
/// the pool, registry and lifetime token.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl SyncOrchestrator {
    pub fn new(
        pool: ConnectionPool,
        store: Arc<dyn LocalStore>,
        events: Arc<dyn EventSink>,
        registry: Arc<ScopeRegistry>,
        config: OrchestratorConfig,
        lifetime: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                pool,
                store,
                events,
                registry,
                config,
                lifetime,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ScopeRegistry> {
        &self.inner.registry
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Debounced sync request, the entry point for UI and push triggers
    pub async fn request_sync(&self, account_id: &str, folder_id: &str) -> SyncOutcome {
        let key = ScopeKey::new(account_id, folder_id);
        if !self.inner.registry.try_accept(&key) {
            return SyncOutcome::Debounced;
        }
        self.run_generation(key).await
    }

    /// Sync a scope now, bypassing the debounce window
    pub async fn sync_scope(&self, account_id: &str, folder_id: &str) -> SyncOutcome {
        self.run_generation(ScopeKey::new(account_id, folder_id)).await
    }

    /// Fire-and-forget [`Self::request_sync`] for long-lived loops that
    /// must never wait on pool contention.
    pub fn spawn_request(&self, account_id: &str, folder_id: &str) -> JoinHandle<SyncOutcome> {
        let orchestrator = self.clone();
        let (account_id, folder_id) = (account_id.to_string(), folder_id.to_string());
        tokio::spawn(async move { orchestrator.request_sync(&account_id, &folder_id).await })
    }

    /// Whether a generation for the scope is registered, body phase included
    pub fn is_syncing(&self, account_id: &str, folder_id: &str) -> bool {
        self.inner
            .registry
            .is_active(&ScopeKey::new(account_id, folder_id))
    }

    /// Cancel one scope (an empty folder id means every folder)
    pub fn cancel_scope(&self, account_id: &str, folder_id: &str) -> usize {
        self.inner
            .registry
            .cancel_scope(&ScopeKey::new(account_id, folder_id))
    }

    /// Cancel every folder of an account. Returns how many were running.
    pub fn cancel_account(&self, account_id: &str) -> usize {
        self.inner.registry.cancel_account(account_id)
    }

    /// Cancel every generation and force-close every pooled connection.
    /// Cooperative cancellation cannot unblock a read on a dead socket.
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.inner.registry.cancel_all();
        self.inner.pool.close_all();
        info!("Cancelled {} sync(s) and closed all pooled connections", cancelled);
        cancelled
    }

    async fn run_generation(&self, key: ScopeKey) -> SyncOutcome {
        let inner = &self.inner;
        let (generation, prior) = inner.registry.begin(&key, &inner.lifetime);

        // Built before the first await so a dropped caller still unregisters
        let guard = GenerationGuard {
            registry: inner.registry.clone(),
            generation: generation.clone(),
        };

        if let Some(prior_finished) = prior {
            let grace = inner.config.prior_exit_grace();
            tokio::select! {
                _ = prior_finished.cancelled() => {}
                _ = generation.token.cancelled() => {
                    debug!(
                        scope = %key,
                        generation = generation.id,
                        "Cancelled while waiting for prior generation"
                    );
                }
                _ = tokio::time::sleep(grace) => {
                    warn!(scope = %key, ?grace, "Prior sync generation still running; proceeding");
                }
            }
        }

        let result = {
            let ctx = SyncContext {
                pool: &inner.pool,
                store: inner.store.as_ref(),
                events: inner.events.as_ref(),
                cancel: &generation.token,
            };
            AssertUnwindSafe(sync_headers(&ctx, &key.account_id, &key.folder_id))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    error!(scope = %key, "Header sync panicked: {}", message);
                    Err(SyncError::Other(format!("header sync panicked: {}", message)))
                })
        };

        self.emit_terminal(&key, &result);

        match result {
            Ok(report) => {
                inner.registry.set_body_phase(&key, generation.id, true);
                self.spawn_body_fetch(guard);
                SyncOutcome::Completed(report)
            }
            Err(e) if e.is_cancelled() => {
                debug!(scope = %key, generation = generation.id, "Sync superseded");
                SyncOutcome::Superseded
            }
            Err(e) => SyncOutcome::Failed(e),
        }
    }

    /// Background phase; owns the guard so the registration ends when
    /// this task does, however it ends.
    fn spawn_body_fetch(&self, guard: GenerationGuard) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let key = guard.generation.key.clone();
            let ctx = SyncContext {
                pool: &inner.pool,
                store: inner.store.as_ref(),
                events: inner.events.as_ref(),
                cancel: &guard.generation.token,
            };

            let result = AssertUnwindSafe(fetch_bodies(
                &ctx,
                &key.account_id,
                &key.folder_id,
                inner.config.body_batch_size,
            ))
            .catch_unwind()
            .await;

            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.is_cancelled() => {
                    debug!(scope = %key, "Body fetch cancelled");
                }
                Ok(Err(e)) => {
                    warn!(scope = %key, "Body fetch failed: {}", e);
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(scope = %key, "Body fetch panicked: {}", message);
                    inner.events.emit(SyncEvent::FolderSyncError {
                        account_id: key.account_id.clone(),
                        folder_id: key.folder_id.clone(),
                        message: format!("body fetch panicked: {}", message),
                    });
                }
            }

            inner
                .registry
                .set_body_phase(&key, guard.generation.id, false);
            drop(guard);
        });
    }

    fn emit_terminal(&self, key: &ScopeKey, result: &Result<HeaderSyncReport, SyncError>) {
        let events = &self.inner.events;
        let account_id = key.account_id.clone();
        let folder_id = key.folder_id.clone();

        match result {
            Ok(_) => events.emit(SyncEvent::FolderSynced { account_id, folder_id }),
            // Superseded is not a failure
            Err(SyncError::Cancelled) => {
                events.emit(SyncEvent::FolderSynced { account_id, folder_id })
            }
            Err(SyncError::UntrustedCertificate { host, fingerprint }) => {
                warn!(scope = %key, host = %host, "Untrusted certificate");
                events.emit(SyncEvent::CertificateUntrusted {
                    account_id,
                    folder_id,
                    host: host.clone(),
                    fingerprint: fingerprint.clone(),
                });
            }
            Err(e @ SyncError::ReauthRequired { provider, .. }) => {
                warn!(scope = %key, "Reauthorization required");
                events.emit(SyncEvent::AuthRequired {
                    account_id: account_id.clone(),
                    provider: provider.clone(),
                });
                events.emit(SyncEvent::FolderSyncError {
                    account_id,
                    folder_id,
                    message: e.to_string(),
                });
            }
            Err(e) => {
                warn!(scope = %key, "Sync failed: {}", e);
                events.emit(SyncEvent::FolderSyncError {
                    account_id,
                    folder_id,
                    message: e.to_string(),
                });
            }
        }
    }
}
