//! Per-account connection pool
//!
//! Live sessions per account = idle + lent + being created, never more
//! than `max_connections`. Borrowers that find the pool full queue up in
//! FIFO order; a returned healthy connection goes straight to the oldest
//! waiter. A borrower that fails to create a connection passes its turn
//! to the oldest waiter so nobody sleeps until the wait deadline on a slot
//! that is actually free.
//!
//! The state lock is a plain mutex and is never held across an await.

mod connection;

pub use connection::PooledConnection;
pub(crate) use connection::Slot;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::session::{MailSession, SessionFactory};
use crate::config::PoolConfig;
use crate::logging::fmt_ms;
use crate::types::error::{Result, SyncError};

/// What a queued borrower receives
enum Handoff {
    Connection(Slot, CancellationToken),
    Closed,
    /// A slot may be free; try again
    Retry,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Handoff>,
}

#[derive(Default)]
struct AccountPool {
    idle: Vec<Slot>,
    /// Lent connections and their kill tokens
    busy: HashMap<u64, CancellationToken>,
    pending: usize,
    waiters: VecDeque<Waiter>,
    /// Bumped on close; creations started under an older epoch are dropped
    epoch: u64,
}

impl AccountPool {
    fn live(&self) -> usize {
        self.idle.len() + self.busy.len() + self.pending
    }

    /// Give `slot` to the oldest waiter still listening; returns it if none.
    fn hand_off(&mut self, mut slot: Slot) -> Option<Slot> {
        while let Some(waiter) = self.waiters.pop_front() {
            let kill = CancellationToken::new();
            let id = slot.id;
            self.busy.insert(id, kill.clone());
            match waiter.tx.send(Handoff::Connection(slot, kill)) {
                Ok(()) => {
                    debug!(connection_id = id, waiter = waiter.id, "Handed connection to waiter");
                    return None;
                }
                Err(Handoff::Connection(returned, _)) => {
                    self.busy.remove(&id);
                    slot = returned;
                }
                Err(_) => return None,
            }
        }
        Some(slot)
    }

    fn wake_one(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.send(Handoff::Retry).is_ok() {
                return;
            }
        }
    }
}

/// Pool occupancy for one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
    pub pending: usize,
    pub waiters: usize,
}

impl PoolStats {
    pub fn live(&self) -> usize {
        self.idle + self.busy + self.pending
    }
}

#[derive(Default)]
struct PoolState {
    accounts: HashMap<String, AccountPool>,
    next_waiter: u64,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    factory: Arc<SessionFactory>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

enum Checkout {
    Ready(Slot, CancellationToken),
    Create(u64),
    Wait(u64, oneshot::Receiver<Handoff>),
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Every critical section leaves the state consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// With `fresh` set, idle sessions are closed instead of reused.
    fn checkout(&self, account_id: &str, fresh: bool) -> Checkout {
        let mut state = self.lock();
        state.next_waiter += 1;
        let waiter_id = state.next_waiter;
        let pool = state.accounts.entry(account_id.to_string()).or_default();

        if fresh && !pool.idle.is_empty() {
            debug!(
                account_id,
                closed = pool.idle.len(),
                "Closing idle connections for a fresh one"
            );
            for mut slot in pool.idle.drain(..) {
                slot.session.force_close();
            }
        }

        while let Some(mut slot) = pool.idle.pop() {
            if !slot.session.is_alive() {
                debug!(connection_id = slot.id, account_id, "Dropping dead idle connection");
                slot.session.force_close();
                continue;
            }
            let kill = CancellationToken::new();
            pool.busy.insert(slot.id, kill.clone());
            return Checkout::Ready(slot, kill);
        }

        if pool.live() < self.config.max_connections {
            pool.pending += 1;
            return Checkout::Create(pool.epoch);
        }

        let (tx, rx) = oneshot::channel();
        pool.waiters.push_back(Waiter { id: waiter_id, tx });
        debug!(
            account_id,
            waiters = pool.waiters.len(),
            "Pool full, waiting for a connection"
        );
        Checkout::Wait(waiter_id, rx)
    }

    /// Return a session lent as `slot.id`. Healthy sessions go to the
    /// oldest waiter or back to idle; anything else is closed.
    fn checkin(&self, account_id: &str, mut slot: Slot, healthy: bool) {
        let mut state = self.lock();
        let Some(pool) = state.accounts.get_mut(account_id) else {
            drop(state);
            slot.session.force_close();
            return;
        };

        let kill = pool.busy.remove(&slot.id);
        let usable = healthy && slot.session.is_alive();
        match kill {
            Some(kill) if usable && !kill.is_cancelled() => {
                slot.last_used = Instant::now();
                if let Some(slot) = pool.hand_off(slot) {
                    pool.idle.push(slot);
                }
            }
            Some(_) => {
                pool.wake_one();
                drop(state);
                debug!(connection_id = slot.id, account_id, "Closing unhealthy connection");
                slot.session.force_close();
            }
            None => {
                // The account was closed while this was lent out
                drop(state);
                slot.session.force_close();
            }
        }
    }

    /// Drop a lent connection from the live set and let a waiter retry
    pub(crate) fn forget(&self, account_id: &str, connection_id: u64) {
        let mut state = self.lock();
        if let Some(pool) = state.accounts.get_mut(account_id) {
            if pool.busy.remove(&connection_id).is_some() {
                pool.wake_one();
            }
        }
    }

    fn finish_pending(&self, account_id: &str) {
        let mut state = self.lock();
        if let Some(pool) = state.accounts.get_mut(account_id) {
            pool.pending = pool.pending.saturating_sub(1);
            pool.wake_one();
        }
    }

    /// Called when a waiter gives up; takes it out of the queue, or
    /// returns whatever was already handed to it.
    fn abandon_wait(&self, account_id: &str, waiter_id: u64, rx: &mut oneshot::Receiver<Handoff>) {
        {
            let mut state = self.lock();
            if let Some(pool) = state.accounts.get_mut(account_id) {
                if let Some(pos) = pool.waiters.iter().position(|w| w.id == waiter_id) {
                    pool.waiters.remove(pos);
                    return;
                }
            }
        }

        match rx.try_recv() {
            Ok(Handoff::Connection(slot, _)) => self.checkin(account_id, slot, true),
            Ok(Handoff::Retry) => {
                let mut state = self.lock();
                if let Some(pool) = state.accounts.get_mut(account_id) {
                    pool.wake_one();
                }
            }
            Ok(Handoff::Closed) | Err(_) => {}
        }
    }
}

/// Removes a waiter from the queue if its future is dropped or times out
struct WaitGuard<'a> {
    inner: &'a PoolInner,
    account_id: &'a str,
    waiter_id: u64,
    rx: oneshot::Receiver<Handoff>,
    done: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.inner
                .abandon_wait(self.account_id, self.waiter_id, &mut self.rx);
        }
    }
}

/// Counts an in-flight creation until it resolves or is abandoned
struct PendingGuard<'a> {
    inner: &'a PoolInner,
    account_id: &'a str,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.finish_pending(self.account_id);
        }
    }
}

/// Connection pool shared by the orchestrator, actions and scheduler
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: Arc<SessionFactory>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                state: Mutex::new(PoolState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrow a session for `account_id`.
    ///
    /// Reuses an idle session, creates one if under the limit, or waits in
    /// line up to the configured wait timeout. `cancel` aborts the wait
    /// and interrupts operations on the returned connection.
    pub async fn acquire(
        &self,
        account_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection> {
        self.checkout_connection(account_id, cancel, false).await
    }

    /// Borrow a newly opened session for `account_id`.
    ///
    /// Idle sessions for the account are closed first, and a session
    /// handed over by a releasing borrower is closed and replaced. Used
    /// after a transport failure, when pooled sessions are suspect too.
    pub async fn acquire_fresh(
        &self,
        account_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection> {
        self.checkout_connection(account_id, cancel, true).await
    }

    async fn checkout_connection(
        &self,
        account_id: &str,
        cancel: &CancellationToken,
        fresh: bool,
    ) -> Result<PooledConnection> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let started = Instant::now();
        let deadline = started + self.inner.config.wait_timeout();

        loop {
            match self.inner.checkout(account_id, fresh) {
                Checkout::Ready(slot, kill) => {
                    debug!(connection_id = slot.id, account_id, "Reusing idle connection");
                    return Ok(self.lend(account_id, slot, kill, cancel));
                }
                Checkout::Create(epoch) => return self.create(account_id, epoch, cancel).await,
                Checkout::Wait(waiter_id, rx) => {
                    let mut guard = WaitGuard {
                        inner: &self.inner,
                        account_id,
                        waiter_id,
                        rx,
                        done: false,
                    };

                    let handoff = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep_until(deadline) => {
                            warn!(
                                account_id,
                                waited = %fmt_ms(started.elapsed()),
                                "Timed out waiting for a pooled connection"
                            );
                            return Err(SyncError::PoolTimeout(account_id.to_string()));
                        }
                        handoff = &mut guard.rx => handoff,
                    };
                    guard.done = true;

                    match handoff {
                        Ok(Handoff::Connection(mut slot, _)) if fresh => {
                            debug!(
                                connection_id = slot.id,
                                account_id,
                                "Closing handed-over connection"
                            );
                            slot.session.force_close();
                            self.inner.forget(account_id, slot.id);
                        }
                        Ok(Handoff::Connection(slot, kill)) => {
                            return Ok(self.lend(account_id, slot, kill, cancel));
                        }
                        Ok(Handoff::Closed) => {
                            return Err(SyncError::PoolClosed(account_id.to_string()));
                        }
                        Ok(Handoff::Retry) | Err(_) => continue,
                    }
                }
            }
        }
    }

    fn lend(
        &self,
        account_id: &str,
        slot: Slot,
        kill: CancellationToken,
        cancel: &CancellationToken,
    ) -> PooledConnection {
        PooledConnection::new(
            account_id,
            slot,
            kill,
            Some(cancel.clone()),
            Arc::downgrade(&self.inner),
        )
    }

    async fn create(
        &self,
        account_id: &str,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection> {
        let mut pending = PendingGuard {
            inner: &self.inner,
            account_id,
            armed: true,
        };

        let mut session = self.open_session(account_id, cancel).await?;

        let mut state = self.inner.lock();
        let pool = state.accounts.entry(account_id.to_string()).or_default();
        pool.pending = pool.pending.saturating_sub(1);
        pending.armed = false;

        if pool.epoch != epoch {
            pool.wake_one();
            drop(state);
            info!(account_id, "Pool closed while connecting; dropping new session");
            session.force_close();
            return Err(SyncError::PoolClosed(account_id.to_string()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let kill = CancellationToken::new();
        pool.busy.insert(id, kill.clone());
        drop(state);

        debug!(connection_id = id, account_id, "Opened pooled connection");
        Ok(self.lend(account_id, Slot::new(id, session), kill, cancel))
    }

    /// Connect with the connect timeout; a server-side connection limit
    /// is retried exactly once after the limit backoff.
    async fn open_session(
        &self,
        account_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn MailSession>> {
        let config = &self.inner.config;
        let mut limit_retried = false;

        loop {
            let started = Instant::now();
            let attempt = tokio::time::timeout(
                config.connect_timeout(),
                self.inner.factory.open(account_id),
            );

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                result = attempt => result,
            };

            match result {
                Ok(Ok(session)) => return Ok(session),
                Ok(Err(SyncError::ConnectionLimit(msg))) if !limit_retried => {
                    limit_retried = true;
                    warn!(
                        account_id,
                        backoff = ?config.limit_retry_backoff(),
                        "Server connection limit hit ({}), retrying once",
                        msg
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(config.limit_retry_backoff()) => {}
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(account_id, elapsed = %fmt_ms(started.elapsed()), "Connect timed out");
                    return Err(SyncError::Timeout(format!(
                        "connecting account {} took longer than {:?}",
                        account_id,
                        config.connect_timeout()
                    )));
                }
            }
        }
    }

    /// Return a connection. Unhealthy connections are closed instead.
    pub fn release(&self, conn: PooledConnection) {
        let account_id = conn.account_id().to_string();
        let healthy = conn.is_healthy();
        if let Some(slot) = conn.into_slot() {
            self.inner.checkin(&account_id, slot, healthy);
        }
    }

    /// Close a connection and remove it from the live set
    pub fn discard(&self, conn: PooledConnection) {
        let account_id = conn.account_id().to_string();
        if let Some(mut slot) = conn.into_slot() {
            debug!(connection_id = slot.id, account_id = %account_id, "Discarding connection");
            slot.session.force_close();
            self.inner.forget(&account_id, slot.id);
        }
    }

    /// Close everything for an account: idle sessions now, lent ones as
    /// soon as their borrower touches them. Waiters fail with `PoolClosed`.
    pub fn close_account(&self, account_id: &str) {
        let (idle, lent, waiters) = {
            let mut state = self.inner.lock();
            let Some(pool) = state.accounts.get_mut(account_id) else {
                return;
            };
            pool.epoch += 1;

            let lent = pool.busy.len();
            for (_, kill) in pool.busy.drain() {
                kill.cancel();
            }
            let waiters: Vec<Waiter> = pool.waiters.drain(..).collect();
            (std::mem::take(&mut pool.idle), lent, waiters)
        };

        let waiter_count = waiters.len();
        for waiter in waiters {
            let _ = waiter.tx.send(Handoff::Closed);
        }
        let idle_count = idle.len();
        for mut slot in idle {
            slot.session.force_close();
        }

        info!(
            account_id,
            idle = idle_count,
            lent,
            waiters = waiter_count,
            "Closed connection pool"
        );
    }

    /// [`Self::close_account`] for every account the pool has seen
    pub fn close_all(&self) {
        let accounts: Vec<String> = self.inner.lock().accounts.keys().cloned().collect();
        for account_id in accounts {
            self.close_account(&account_id);
        }
    }

    /// Close idle sessions unused for longer than the idle timeout.
    /// Returns how many were closed.
    pub fn reap_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout();
        let now = Instant::now();

        let expired: Vec<(String, Slot)> = {
            let mut state = self.inner.lock();
            let mut expired = Vec::new();
            for (account_id, pool) in state.accounts.iter_mut() {
                let (stale, fresh): (Vec<Slot>, Vec<Slot>) =
                    std::mem::take(&mut pool.idle).into_iter().partition(|slot| {
                        now.duration_since(slot.last_used) >= idle_timeout
                            || !slot.session.is_alive()
                    });
                pool.idle = fresh;
                expired.extend(stale.into_iter().map(|slot| (account_id.clone(), slot)));
                if !pool.waiters.is_empty() && pool.live() < self.inner.config.max_connections {
                    pool.wake_one();
                }
            }
            expired
        };

        let count = expired.len();
        for (account_id, mut slot) in expired {
            debug!(connection_id = slot.id, account_id = %account_id, "Reaping idle connection");
            slot.session.force_close();
        }
        count
    }

    /// Run [`Self::reap_idle`] every reap interval until `shutdown`
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        let period = self.inner.config.reap_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = pool.reap_idle();
                        if reaped > 0 {
                            info!("Reaped {} idle connection(s)", reaped);
                        }
                    }
                }
            }
            debug!("Pool reaper stopped");
        })
    }

    /// Current occupancy for `account_id`; zeros for an unknown account
    pub fn stats(&self, account_id: &str) -> PoolStats {
        let state = self.inner.lock();
        state
            .accounts
            .get(account_id)
            .map(|pool| PoolStats {
                idle: pool.idle.len(),
                busy: pool.busy.len(),
                pending: pool.pending,
                waiters: pool.waiters.len(),
            })
            .unwrap_or_default()
    }
}
