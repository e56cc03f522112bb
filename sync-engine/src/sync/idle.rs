//! IMAP IDLE push listener
//!
//! Keeps one dedicated, long-lived session per account parked in IDLE and
//! turns the untagged responses it receives into `NewMailInfo` events on a
//! shared channel. It never syncs anything itself: whoever drains the
//! channel decides what to do, so this loop is never blocked by pool
//! contention.
//!
//! Dead sessions reconnect with exponential backoff. IDLE is re-issued
//! every `idle_timeout_minutes` to stay under typical NAT timeouts.

use flume::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::session::{IdleWake, MailSession, SessionFactory};
use crate::config::IdleConfig;
use crate::types::error::{Result, SyncError};
use crate::types::{ChangeKind, NewMailInfo};

const LOGOUT_TIMEOUT: Duration = Duration::from_secs(2);

/// Parse an IMAP untagged response into a change notification
pub fn parse_untagged_response(line: &str, account_id: &str, mailbox: &str) -> Option<NewMailInfo> {
    let line = line.trim();
    debug!("Parsing IMAP response: {}", line);

    let notification = |kind, count| NewMailInfo {
        account_id: account_id.to_string(),
        kind,
        mailbox: mailbox.to_string(),
        count,
    };

    // "* 42 EXISTS"
    if let Some(count) = line
        .strip_prefix("* ")
        .and_then(|s| s.strip_suffix(" EXISTS"))
        .and_then(|s| s.parse::<u32>().ok())
    {
        info!("Detected EXISTS response for folder '{}'", mailbox);
        return Some(notification(ChangeKind::NewMail, Some(count)));
    }

    // "* 42 EXPUNGE"
    if line
        .strip_prefix("* ")
        .and_then(|s| s.strip_suffix(" EXPUNGE"))
        .map(|s| s.parse::<u32>().is_ok())
        .unwrap_or(false)
    {
        info!("Detected EXPUNGE response for folder '{}'", mailbox);
        return Some(notification(ChangeKind::Expunge, None));
    }

    // "* 42 FETCH (FLAGS (...))"
    if line.starts_with("* ") && line.contains(" FETCH ") && line.contains("FLAGS") {
        info!("Detected FLAGS change for folder '{}'", mailbox);
        return Some(notification(ChangeKind::FlagsChanged, None));
    }

    None
}

/// Collapse one wake's responses into at most one event per kind.
/// For new mail the highest EXISTS count wins.
fn coalesce(lines: &[String], account_id: &str, mailbox: &str) -> Vec<NewMailInfo> {
    let mut events: Vec<NewMailInfo> = Vec::new();
    for info in lines
        .iter()
        .filter_map(|line| parse_untagged_response(line, account_id, mailbox))
    {
        match events.iter_mut().find(|e| e.kind == info.kind) {
            Some(existing) => existing.count = existing.count.max(info.count),
            None => events.push(info),
        }
    }
    events
}

struct RunningSession {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct PushAccount {
    name: String,
    mailbox: String,
    session: Option<RunningSession>,
}

impl PushAccount {
    fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| !s.handle.is_finished())
            .unwrap_or(false)
    }

    fn halt(&mut self) {
        if let Some(session) = self.session.take() {
            session.token.cancel();
        }
    }
}

struct ListenerInner {
    factory: Arc<SessionFactory>,
    config: IdleConfig,
    tx: Sender<NewMailInfo>,
    accounts: Mutex<HashMap<String, PushAccount>>,
    /// Set by `start`; account sessions run under child tokens of it
    root: Mutex<Option<CancellationToken>>,
    paused: AtomicBool,
}

#[derive(Clone)]
pub struct PushListener {
    inner: Arc<ListenerInner>,
}

impl PushListener {
    /// Create a stopped listener and the receiving end of its
    /// notification channel
    pub fn new(factory: Arc<SessionFactory>, config: IdleConfig) -> (Self, Receiver<NewMailInfo>) {
        let (tx, rx) = flume::unbounded();
        let listener = Self {
            inner: Arc::new(ListenerInner {
                factory,
                config,
                tx,
                accounts: Mutex::new(HashMap::new()),
                root: Mutex::new(None),
                paused: AtomicBool::new(false),
            }),
        };
        (listener, rx)
    }

    fn accounts(&self) -> MutexGuard<'_, HashMap<String, PushAccount>> {
        self.inner.accounts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn root(&self) -> Option<CancellationToken> {
        self.inner
            .root
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Start listening for every registered account under `parent`
    pub fn start(&self, parent: &CancellationToken) {
        let root = parent.child_token();
        *self.inner.root.lock().unwrap_or_else(|e| e.into_inner()) = Some(root.clone());
        info!("Push listener started");

        if self.is_paused() {
            return;
        }
        let mut accounts = self.accounts();
        for (id, account) in accounts.iter_mut() {
            self.spawn_session(&root, id, account);
        }
    }

    /// Register an account and start its push session.
    /// A no-op if the account already has a live session.
    pub fn start_account(&self, account_id: &str, name: &str, mailbox: &str) {
        let root = self.root();
        let mut accounts = self.accounts();
        let account = accounts
            .entry(account_id.to_string())
            .or_insert_with(|| PushAccount {
                name: name.to_string(),
                mailbox: mailbox.to_string(),
                session: None,
            });

        if account.is_running() {
            debug!("IDLE: session for {} already running", account.name);
            return;
        }
        account.name = name.to_string();
        account.mailbox = mailbox.to_string();

        match root {
            Some(root) if !self.is_paused() => self.spawn_session(&root, account_id, account),
            _ => debug!("IDLE: registered {} (not started)", name),
        }
    }

    /// Stop and forget an account
    pub fn stop_account(&self, account_id: &str) {
        if let Some(mut account) = self.accounts().remove(account_id) {
            account.halt();
            info!("IDLE: stopped session for {}", account.name);
        }
    }

    /// Drop every session but keep the registered accounts for `resume`
    pub fn pause(&self) {
        if self.inner.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut accounts = self.accounts();
        for account in accounts.values_mut() {
            account.halt();
        }
        info!("Push listener paused ({} account(s))", accounts.len());
    }

    /// Restart sessions for every registered account
    pub fn resume(&self) {
        if !self.inner.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(root) = self.root() else {
            return;
        };
        let mut accounts = self.accounts();
        for (id, account) in accounts.iter_mut() {
            if !account.is_running() {
                self.spawn_session(&root, id, account);
            }
        }
        info!("Push listener resumed ({} account(s))", accounts.len());
    }

    /// Stop every session and forget all accounts
    pub fn stop(&self) {
        if let Some(root) = self
            .inner
            .root
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            root.cancel();
        }
        let mut accounts = self.accounts();
        for account in accounts.values_mut() {
            account.halt();
        }
        accounts.clear();
        info!("Push listener stopped");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_running(&self, account_id: &str) -> bool {
        self.accounts()
            .get(account_id)
            .map(|a| a.is_running())
            .unwrap_or(false)
    }

    pub fn registered_accounts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.accounts().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn spawn_session(&self, root: &CancellationToken, account_id: &str, account: &mut PushAccount) {
        account.halt();
        let token = root.child_token();
        let handle = tokio::spawn(run_account(
            self.inner.clone(),
            account_id.to_string(),
            account.name.clone(),
            account.mailbox.clone(),
            token.clone(),
        ));
        account.session = Some(RunningSession { token, handle });
    }
}

/// Reconnect loop for one account
async fn run_account(
    inner: Arc<ListenerInner>,
    account_id: String,
    name: String,
    mailbox: String,
    token: CancellationToken,
) {
    let mut attempt = 0;

    info!("IDLE: starting session for {} ({})", name, mailbox);

    while !token.is_cancelled() {
        let mut connected = false;
        let result = watch_mailbox(&inner, &account_id, &mailbox, &token, &mut connected).await;
        if connected {
            attempt = 0;
        }

        match result {
            Ok(()) => break,
            Err(e @ (SyncError::ReauthRequired { .. } | SyncError::Auth(_))) => {
                error!("IDLE: giving up on {}: {}", name, e);
                break;
            }
            Err(e) => {
                let delay = reconnect_delay(&inner.config, attempt);
                attempt = attempt.saturating_add(1);
                warn!("IDLE: session for {} failed: {}; reconnecting in {:?}", name, e, delay);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    info!("IDLE: session loop ended for {}", name);
}

/// One session lifetime: connect, select, IDLE until error or cancel.
/// `Ok` means cancelled or nobody is listening any more.
async fn watch_mailbox(
    inner: &ListenerInner,
    account_id: &str,
    mailbox: &str,
    token: &CancellationToken,
    connected: &mut bool,
) -> Result<()> {
    let mut session = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        session = inner.factory.open(account_id) => session?,
    };

    let result = idle_loop(inner, session.as_mut(), account_id, mailbox, token, connected).await;

    // Paused means the machine is going to sleep; skip the goodbye
    if result.is_ok() && session.is_alive() && !inner.paused.load(Ordering::SeqCst) {
        match tokio::time::timeout(LOGOUT_TIMEOUT, session.logout()).await {
            Ok(Ok(())) => debug!("IDLE: logged out of {}", account_id),
            Ok(Err(e)) => debug!("IDLE: logout for {} failed: {}", account_id, e),
            Err(_) => debug!("IDLE: logout for {} timed out", account_id),
        }
    }
    session.force_close();
    result
}

async fn idle_loop(
    inner: &ListenerInner,
    session: &mut dyn MailSession,
    account_id: &str,
    mailbox: &str,
    token: &CancellationToken,
    connected: &mut bool,
) -> Result<()> {
    tokio::select! {
        _ = token.cancelled() => return Ok(()),
        status = session.select(mailbox) => {
            let status = status?;
            debug!("IDLE: selected {} ({} messages)", mailbox, status.exists);
        }
    }
    *connected = true;
    let idle_timeout = inner.config.idle_timeout();

    loop {
        let wake = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            wake = session.idle_wait(idle_timeout) => wake?,
        };

        match wake {
            IdleWake::Timeout => debug!("IDLE: re-issuing for {}/{}", account_id, mailbox),
            IdleWake::Data(lines) => {
                for info in coalesce(&lines, account_id, mailbox) {
                    if inner.tx.send(info).is_err() {
                        debug!("IDLE: no dispatcher listening, stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Delay before reconnect attempt `attempt` (0-based): doubles from the
/// initial delay up to the cap
fn reconnect_delay(config: &IdleConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    config
        .reconnect_initial()
        .saturating_mul(factor)
        .min(config.reconnect_max())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{settle, MockConnector};
    use tokio::time::Instant;

    #[test]
    fn test_parse_exists() {
        let info = parse_untagged_response("* 42 EXISTS", "acct1", "INBOX").unwrap();
        assert_eq!(info.kind, ChangeKind::NewMail);
        assert_eq!(info.count, Some(42));
        assert_eq!(info.mailbox, "INBOX");
        assert_eq!(info.account_id, "acct1");
    }

    #[test]
    fn test_parse_expunge() {
        let info = parse_untagged_response("* 15 EXPUNGE", "acct1", "INBOX").unwrap();
        assert_eq!(info.kind, ChangeKind::Expunge);
        assert_eq!(info.count, None);
    }

    #[test]
    fn test_parse_fetch_flags() {
        let info =
            parse_untagged_response("* 42 FETCH (FLAGS (\\Seen \\Flagged))", "acct1", "INBOX")
                .unwrap();
        assert_eq!(info.kind, ChangeKind::FlagsChanged);
    }

    #[test]
    fn test_parse_ignores_noise() {
        assert!(parse_untagged_response("* OK Still here", "acct1", "INBOX").is_none());
        assert!(parse_untagged_response("* many EXISTS", "acct1", "INBOX").is_none());
        assert!(parse_untagged_response("+ idling", "acct1", "INBOX").is_none());
    }

    #[test]
    fn test_coalesce() {
        let lines = vec![
            "* 3 EXISTS".to_string(),
            "* 4 EXISTS".to_string(),
            "* 1 EXPUNGE".to_string(),
            "* 2 EXPUNGE".to_string(),
        ];
        let events = coalesce(&lines, "acct1", "INBOX");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].count, Some(4));
        assert_eq!(events[1].kind, ChangeKind::Expunge);
    }

    #[test]
    fn test_reconnect_delay() {
        let config = IdleConfig::default();
        assert_eq!(reconnect_delay(&config, 0), Duration::from_secs(5));
        assert_eq!(reconnect_delay(&config, 3), Duration::from_secs(40));
        assert_eq!(reconnect_delay(&config, 30), Duration::from_secs(300));
    }

    fn listener(connector: &MockConnector) -> (PushListener, Receiver<NewMailInfo>) {
        PushListener::new(connector.factory(), IdleConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_events_are_delivered() {
        let connector = MockConnector::new();
        let (listener, rx) = listener(&connector);
        let root = CancellationToken::new();

        listener.start(&root);
        listener.start_account("acct1", "Work", "INBOX");
        settle().await;

        connector.push_idle(IdleWake::Data(vec!["* 7 EXISTS".to_string()]));
        let info = rx.recv_async().await.unwrap();
        assert_eq!(info.kind, ChangeKind::NewMail);
        assert_eq!(info.count, Some(7));

        listener.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_account_is_idempotent() {
        let connector = MockConnector::new();
        let (listener, _rx) = listener(&connector);
        let root = CancellationToken::new();

        listener.start(&root);
        listener.start_account("acct1", "Work", "INBOX");
        settle().await;
        listener.start_account("acct1", "Work", "INBOX");
        settle().await;

        assert_eq!(connector.connect_calls(), 1);
        assert!(listener.is_running("acct1"));
        listener.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_is_reissued_after_timeout() {
        let connector = MockConnector::new();
        let (listener, _rx) = listener(&connector);
        let root = CancellationToken::new();

        listener.start(&root);
        listener.start_account("acct1", "Work", "INBOX");
        settle().await;
        assert_eq!(connector.op_count("idle"), 1);

        tokio::time::sleep(IdleConfig::default().idle_timeout() + Duration::from_secs(1)).await;
        assert_eq!(connector.op_count("idle"), 2);
        assert_eq!(connector.connect_calls(), 1);
        listener.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_session_reconnects_with_backoff() {
        let connector = MockConnector::new();
        connector.fail_op("idle", SyncError::Connection("connection reset".to_string()));
        let (listener, _rx) = listener(&connector);
        let root = CancellationToken::new();

        let started = Instant::now();
        listener.start(&root);
        listener.start_account("acct1", "Work", "INBOX");

        while connector.connect_calls() < 2 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(started.elapsed() >= IdleConfig::default().reconnect_initial());
        assert_eq!(connector.closed_count(), 1);
        listener.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_keep_accounts() {
        let connector = MockConnector::new();
        let (listener, _rx) = listener(&connector);
        let root = CancellationToken::new();

        listener.start(&root);
        listener.start_account("acct1", "Work", "INBOX");
        listener.start_account("acct2", "Home", "INBOX");
        settle().await;
        assert_eq!(connector.open_sessions(), 2);

        listener.pause();
        settle().await;
        assert_eq!(connector.open_sessions(), 0);
        assert!(!listener.is_running("acct1"));

        listener.resume();
        settle().await;
        assert_eq!(connector.open_sessions(), 2);
        assert_eq!(
            listener.registered_accounts(),
            vec!["acct1".to_string(), "acct2".to_string()]
        );

        listener.stop();
        settle().await;
        assert_eq!(connector.open_sessions(), 0);
        assert!(listener.registered_accounts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_before_start() {
        let connector = MockConnector::new();
        let (listener, _rx) = listener(&connector);

        listener.start_account("acct1", "Work", "INBOX");
        settle().await;
        assert_eq!(connector.connect_calls(), 0);

        listener.start(&CancellationToken::new());
        settle().await;
        assert_eq!(connector.connect_calls(), 1);
        listener.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_logs_out_but_pause_does_not() {
        let connector = MockConnector::new();
        let (listener, _rx) = listener(&connector);

        listener.start(&CancellationToken::new());
        listener.start_account("acct1", "Work", "INBOX");
        settle().await;
        listener.stop_account("acct1");
        settle().await;
        assert!(connector.log().contains(&"logout 1".to_string()));

        listener.start_account("acct1", "Work", "INBOX");
        settle().await;
        listener.pause();
        settle().await;
        assert!(connector.log().contains(&"close 2".to_string()));
        assert!(!connector.log().contains(&"logout 2".to_string()));
        listener.stop();
    }
}
