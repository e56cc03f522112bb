//! Scriptable in-process mail server for unit tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};

use crate::adapters::credentials::{AuthSecret, ConnectionParams, CredentialProvider};
use crate::adapters::session::{Connector, IdleWake, MailSession, SessionFactory};
use crate::events::{EventSink, SyncEvent};
use crate::types::error::{Result, SyncError};
use crate::types::{Flag, FlagUpdate, MailboxStatus, MessageHeader};

pub fn header(uid: u32, flags: &[Flag]) -> MessageHeader {
    MessageHeader {
        uid,
        message_id: Some(format!("<{}@example.com>", uid)),
        subject: Some(format!("Message {}", uid)),
        from: Some("sender@example.com".to_string()),
        date: None,
        flags: flags.to_vec(),
        size: Some(1024),
    }
}

#[derive(Debug, Default)]
struct MockMailbox {
    uid_validity: u32,
    messages: BTreeMap<u32, MessageHeader>,
}

impl MockMailbox {
    fn next_uid(&self) -> u32 {
        self.messages.keys().next_back().copied().unwrap_or(0) + 1
    }
}

#[derive(Default)]
struct ServerState {
    mailboxes: HashMap<String, MockMailbox>,
    connect_failures: VecDeque<SyncError>,
    connect_delay: Option<Duration>,
    op_failures: Vec<(&'static str, SyncError)>,
    op_delays: HashMap<&'static str, Duration>,
    op_counts: HashMap<&'static str, usize>,
    idle_queue: VecDeque<IdleWake>,
    connect_calls: usize,
    next_session: u64,
    open_sessions: usize,
    closed: usize,
    log: Vec<String>,
}

/// Connector backed by a shared fake server
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<ServerState>>,
    headers_gate: watch::Sender<bool>,
    idle_signal: Arc<Notify>,
}

impl MockConnector {
    /// Server with an empty INBOX (UIDVALIDITY 1)
    pub fn new() -> Self {
        let (headers_gate, _) = watch::channel(true);
        let connector = Self {
            state: Arc::new(Mutex::new(ServerState::default())),
            headers_gate,
            idle_signal: Arc::new(Notify::new()),
        };
        connector.set_uid_validity("INBOX", 1);
        connector
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn factory(&self) -> Arc<SessionFactory> {
        Arc::new(SessionFactory::new(
            Arc::new(StaticCredentials::password()),
            Arc::new(self.clone()),
        ))
    }

    pub fn set_uid_validity(&self, mailbox: &str, uid_validity: u32) {
        self.lock()
            .mailboxes
            .entry(mailbox.to_string())
            .or_default()
            .uid_validity = uid_validity;
    }

    pub fn add_message(&self, mailbox: &str, header: MessageHeader) {
        let mut state = self.lock();
        let mb = state.mailboxes.entry(mailbox.to_string()).or_insert_with(|| MockMailbox {
            uid_validity: 1,
            ..Default::default()
        });
        mb.messages.insert(header.uid, header);
    }

    pub fn remove_message(&self, mailbox: &str, uid: u32) {
        if let Some(mb) = self.lock().mailboxes.get_mut(mailbox) {
            mb.messages.remove(&uid);
        }
    }

    pub fn mailbox_uids(&self, mailbox: &str) -> Vec<u32> {
        self.lock()
            .mailboxes
            .get(mailbox)
            .map(|mb| mb.messages.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn flags_of(&self, mailbox: &str, uid: u32) -> Vec<Flag> {
        self.lock()
            .mailboxes
            .get(mailbox)
            .and_then(|mb| mb.messages.get(&uid))
            .map(|h| h.flags.clone())
            .unwrap_or_default()
    }

    /// Next connects fail with these errors, in order
    pub fn fail_connects(&self, errors: Vec<SyncError>) {
        self.lock().connect_failures.extend(errors);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = Some(delay);
    }

    /// Next call of `op` on any session fails with `error`. A connection
    /// error also kills that session's transport.
    pub fn fail_op(&self, op: &'static str, error: SyncError) {
        self.lock().op_failures.push((op, error));
    }

    pub fn set_op_delay(&self, op: &'static str, delay: Duration) {
        self.lock().op_delays.insert(op, delay);
    }

    /// Hold every `fetch_headers` call until [`Self::release_headers`]
    pub fn block_headers(&self) {
        self.headers_gate.send_replace(false);
    }

    pub fn release_headers(&self) {
        self.headers_gate.send_replace(true);
    }

    /// Queue a wake for whichever session is idling
    pub fn push_idle(&self, wake: IdleWake) {
        self.lock().idle_queue.push_back(wake);
        self.idle_signal.notify_waiters();
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    pub fn closed_count(&self) -> usize {
        self.lock().closed
    }

    pub fn op_count(&self, op: &str) -> usize {
        self.lock().op_counts.get(op).copied().unwrap_or(0)
    }

    /// Session lifecycle and mutation log, e.g. `open 1`, `copy 1 INBOX->Archive`
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn MailSession>> {
        let (failure, delay) = {
            let mut state = self.lock();
            state.connect_calls += 1;
            (state.connect_failures.pop_front(), state.connect_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let id = {
            let mut state = self.lock();
            state.next_session += 1;
            state.open_sessions += 1;
            let id = state.next_session;
            state.log.push(format!("open {} {}", id, params.account_id));
            id
        };

        Ok(Box::new(MockSession {
            id,
            server: self.clone(),
            selected: None,
            alive: true,
            closed: false,
        }))
    }
}

pub struct MockSession {
    id: u64,
    server: MockConnector,
    selected: Option<String>,
    alive: bool,
    closed: bool,
}

impl MockSession {
    async fn enter(&mut self, op: &'static str) -> Result<()> {
        if !self.alive {
            return Err(SyncError::Connection("connection closed".to_string()));
        }

        let (failure, delay) = {
            let mut state = self.server.lock();
            *state.op_counts.entry(op).or_insert(0) += 1;
            let failure = state
                .op_failures
                .iter()
                .position(|(name, _)| *name == op)
                .map(|i| state.op_failures.remove(i).1);
            (failure, state.op_delays.get(op).copied())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = failure {
            if err.is_connection_error() {
                self.alive = false;
            }
            return Err(err);
        }
        Ok(())
    }

    fn selected(&self) -> Result<String> {
        self.selected
            .clone()
            .ok_or_else(|| SyncError::Protocol("no mailbox selected".to_string()))
    }

    fn mark_closed(&mut self, how: &str) {
        self.alive = false;
        if !self.closed {
            self.closed = true;
            let mut state = self.server.lock();
            state.closed += 1;
            state.open_sessions = state.open_sessions.saturating_sub(1);
            state.log.push(format!("{} {}", how, self.id));
        }
    }
}

#[async_trait]
impl MailSession for MockSession {
    async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus> {
        self.enter("select").await?;
        let state = self.server.lock();
        let mb = state
            .mailboxes
            .get(mailbox)
            .ok_or_else(|| SyncError::Protocol(format!("NO Mailbox {} doesn't exist", mailbox)))?;
        let status = MailboxStatus {
            name: mailbox.to_string(),
            exists: mb.messages.len() as u32,
            uid_validity: mb.uid_validity,
            uid_next: Some(mb.next_uid()),
            unseen: Some(mb.messages.values().filter(|h| h.is_unread()).count() as u32),
        };
        drop(state);
        self.selected = Some(mailbox.to_string());
        Ok(status)
    }

    async fn fetch_headers(&mut self, after_uid: u32) -> Result<Vec<MessageHeader>> {
        self.enter("fetch_headers").await?;
        let mut gate = self.server.headers_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let mailbox = self.selected()?;
        let state = self.server.lock();
        Ok(state
            .mailboxes
            .get(&mailbox)
            .map(|mb| mb.messages.range(after_uid + 1..).map(|(_, h)| h.clone()).collect())
            .unwrap_or_default())
    }

    async fn fetch_flags(&mut self, up_to_uid: u32) -> Result<Vec<FlagUpdate>> {
        self.enter("fetch_flags").await?;
        let mailbox = self.selected()?;
        let state = self.server.lock();
        Ok(state
            .mailboxes
            .get(&mailbox)
            .map(|mb| {
                mb.messages
                    .range(..=up_to_uid)
                    .map(|(uid, h)| FlagUpdate {
                        uid: *uid,
                        flags: h.flags.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_uids(&mut self) -> Result<Vec<u32>> {
        self.enter("fetch_uids").await?;
        let mailbox = self.selected()?;
        Ok(self.server.mailbox_uids(&mailbox))
    }

    async fn fetch_body(&mut self, uid: u32) -> Result<Vec<u8>> {
        self.enter("fetch_body").await?;
        let mailbox = self.selected()?;
        let state = self.server.lock();
        state
            .mailboxes
            .get(&mailbox)
            .and_then(|mb| mb.messages.get(&uid))
            .map(|_| format!("body of {}", uid).into_bytes())
            .ok_or_else(|| SyncError::Protocol(format!("NO message {} not found", uid)))
    }

    async fn copy(&mut self, uids: &[u32], target: &str) -> Result<()> {
        self.enter("copy").await?;
        let mailbox = self.selected()?;
        let mut state = self.server.lock();
        let copied: Vec<MessageHeader> = state
            .mailboxes
            .get(&mailbox)
            .map(|mb| uids.iter().filter_map(|uid| mb.messages.get(uid).cloned()).collect())
            .unwrap_or_default();
        let dest = state
            .mailboxes
            .get_mut(target)
            .ok_or_else(|| SyncError::Protocol(format!("NO [TRYCREATE] {}", target)))?;
        for mut h in copied {
            h.uid = dest.next_uid();
            dest.messages.insert(h.uid, h);
        }
        state
            .log
            .push(format!("copy {} {}->{} {:?}", self.id, mailbox, target, uids));
        Ok(())
    }

    async fn delete(&mut self, uids: &[u32]) -> Result<()> {
        self.enter("delete").await?;
        let mailbox = self.selected()?;
        let mut state = self.server.lock();
        if let Some(mb) = state.mailboxes.get_mut(&mailbox) {
            for uid in uids {
                mb.messages.remove(uid);
            }
        }
        state.log.push(format!("delete {} {} {:?}", self.id, mailbox, uids));
        Ok(())
    }

    async fn append(&mut self, mailbox: &str, flags: &[Flag], content: &[u8]) -> Result<()> {
        self.enter("append").await?;
        let mut state = self.server.lock();
        let mb = state
            .mailboxes
            .get_mut(mailbox)
            .ok_or_else(|| SyncError::Protocol(format!("NO [TRYCREATE] {}", mailbox)))?;
        let mut h = header(mb.next_uid(), flags);
        h.size = Some(content.len() as u32);
        mb.messages.insert(h.uid, h);
        Ok(())
    }

    async fn add_flags(&mut self, uids: &[u32], flags: &[Flag]) -> Result<()> {
        self.enter("add_flags").await?;
        let mailbox = self.selected()?;
        let mut state = self.server.lock();
        if let Some(mb) = state.mailboxes.get_mut(&mailbox) {
            for uid in uids {
                if let Some(h) = mb.messages.get_mut(uid) {
                    for flag in flags {
                        if !h.flags.contains(flag) {
                            h.flags.push(flag.clone());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn remove_flags(&mut self, uids: &[u32], flags: &[Flag]) -> Result<()> {
        self.enter("remove_flags").await?;
        let mailbox = self.selected()?;
        let mut state = self.server.lock();
        if let Some(mb) = state.mailboxes.get_mut(&mailbox) {
            for uid in uids {
                if let Some(h) = mb.messages.get_mut(uid) {
                    h.flags.retain(|f| !flags.contains(f));
                }
            }
        }
        Ok(())
    }

    async fn noop(&mut self) -> Result<()> {
        self.enter("noop").await
    }

    async fn idle_wait(&mut self, timeout: Duration) -> Result<IdleWake> {
        self.enter("idle").await?;
        let signal = self.server.idle_signal.clone();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let queued = self.server.lock().idle_queue.pop_front();
            if let Some(wake) = queued {
                return Ok(wake);
            }

            tokio::select! {
                _ = &mut notified => continue,
                _ = tokio::time::sleep_until(deadline) => return Ok(IdleWake::Timeout),
            }
        }
    }

    async fn logout(&mut self) -> Result<()> {
        self.mark_closed("logout");
        Ok(())
    }

    fn force_close(&mut self) {
        self.mark_closed("close");
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}

/// Credential provider that answers for any account id
pub struct StaticCredentials {
    secret: AuthSecret,
}

impl StaticCredentials {
    pub fn password() -> Self {
        Self::with_secret(AuthSecret::Password("secret".to_string()))
    }

    pub fn with_secret(secret: AuthSecret) -> Self {
        Self { secret }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn connection_params(&self, account_id: &str) -> Result<ConnectionParams> {
        Ok(ConnectionParams {
            account_id: account_id.to_string(),
            host: "imap.example.com".to_string(),
            port: 993,
            tls: true,
            username: format!("{}@example.com", account_id),
            provider: "example".to_string(),
            secret: self.secret.clone(),
        })
    }
}

/// Sink that keeps every event for assertions
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: SyncEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Let spawned tasks run; with paused time this also advances the clock
/// only when every task is idle.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
