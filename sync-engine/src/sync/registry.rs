//! Scope registry: the single source of truth for "is this scope syncing"
//!
//! Holds one entry per active (account, folder) generation plus the
//! debounce timestamps. Every component that needs to know or change
//! which scopes are syncing gets the same `Arc<ScopeRegistry>`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::ScopeKey;

struct ScopeEntry {
    generation: u64,
    token: CancellationToken,
    /// Cancelled when the generation's last phase has exited
    finished: CancellationToken,
    body_phase_pending: bool,
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<ScopeKey, ScopeEntry>,
    last_request: HashMap<ScopeKey, Instant>,
    next_generation: u64,
}

/// Handle for one registered sync generation
#[derive(Debug, Clone)]
pub struct Generation {
    pub key: ScopeKey,
    pub id: u64,
    pub token: CancellationToken,
    pub finished: CancellationToken,
}

/// Active sync generations and debounce history, shared by every
/// component that starts or cancels syncs
pub struct ScopeRegistry {
    debounce: Duration,
    state: Mutex<RegistryState>,
}

impl ScopeRegistry {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a request for `key` should run. Requests inside the debounce
    /// window of the last accepted one are dropped and not recorded.
    pub fn try_accept(&self, key: &ScopeKey) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        if let Some(last) = state.last_request.get(key) {
            if now.duration_since(*last) < self.debounce {
                debug!(scope = %key, "Debounced sync request");
                return false;
            }
        }
        state.last_request.insert(key.clone(), now);
        true
    }

    /// Register a new generation for `key` under `parent`.
    ///
    /// Any prior generation for the same key is cancelled and its
    /// `finished` token returned so the caller can wait for it to exit.
    pub fn begin(
        &self,
        key: &ScopeKey,
        parent: &CancellationToken,
    ) -> (Generation, Option<CancellationToken>) {
        let mut state = self.lock();
        state.next_generation += 1;
        let id = state.next_generation;

        let generation = Generation {
            key: key.clone(),
            id,
            token: parent.child_token(),
            finished: CancellationToken::new(),
        };

        let prior = state.active.insert(
            key.clone(),
            ScopeEntry {
                generation: id,
                token: generation.token.clone(),
                finished: generation.finished.clone(),
                body_phase_pending: false,
            },
        );

        let prior_finished = prior.map(|entry| {
            debug!(
                scope = %key,
                superseded = entry.generation,
                generation = id,
                "Cancelling prior sync generation"
            );
            entry.token.cancel();
            entry.finished
        });

        (generation, prior_finished)
    }

    /// Remove `key` only if it still belongs to `generation`
    pub fn finish(&self, key: &ScopeKey, generation: u64) -> bool {
        let mut state = self.lock();
        match state.active.get(key) {
            Some(entry) if entry.generation == generation => {
                state.active.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn set_body_phase(&self, key: &ScopeKey, generation: u64, pending: bool) {
        let mut state = self.lock();
        if let Some(entry) = state.active.get_mut(key) {
            if entry.generation == generation {
                entry.body_phase_pending = pending;
            }
        }
    }

    pub fn body_phase_pending(&self, key: &ScopeKey) -> bool {
        self.lock()
            .active
            .get(key)
            .map(|e| e.body_phase_pending)
            .unwrap_or(false)
    }

    /// Cancel and unregister every generation covered by `key`, and clear
    /// their debounce window so the next request runs.
    /// An account-wide key matches all of the account's folders.
    pub fn cancel_scope(&self, key: &ScopeKey) -> usize {
        let mut state = self.lock();
        state.last_request.retain(|k, _| !key.covers(k));
        let matching: Vec<ScopeKey> = state
            .active
            .keys()
            .filter(|k| key.covers(k))
            .cloned()
            .collect();

        for k in &matching {
            if let Some(entry) = state.active.remove(k) {
                entry.token.cancel();
            }
        }
        if !matching.is_empty() {
            debug!(scope = %key, cancelled = matching.len(), "Cancelled sync scope");
        }
        matching.len()
    }

    pub fn cancel_account(&self, account_id: &str) -> usize {
        self.cancel_scope(&ScopeKey::account(account_id))
    }

    pub fn cancel_all(&self) -> usize {
        let mut state = self.lock();
        state.last_request.clear();
        let count = state.active.len();
        for (_, entry) in state.active.drain() {
            entry.token.cancel();
        }
        count
    }

    /// Whether `key` has a registered generation
    pub fn is_active(&self, key: &ScopeKey) -> bool {
        self.lock().active.contains_key(key)
    }

    pub fn active_scopes(&self) -> Vec<ScopeKey> {
        let mut keys: Vec<ScopeKey> = self.lock().active.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Forget debounce history for an account that was removed
    pub fn forget_account(&self, account_id: &str) {
        self.lock()
            .last_request
            .retain(|k, _| k.account_id != account_id);
    }
}
