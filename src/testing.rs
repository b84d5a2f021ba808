//! In-memory fakes of the transport, control API and terminal capabilities.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use russh::client;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};

use crate::auth::AuthStrategy;
use crate::conn::{BoxReader, BoxWriter, NopCloser, VirtualConnection};
use crate::control::{ControlClient, ControlConnector, NodeRecord, SessionRecord};
use crate::error::{Error, Result};
use crate::hostkey::HostKeyPolicy;
use crate::terminal::LocalTerminal;
use crate::transport::ssh::ClientHandler;
use crate::transport::{Connector, Dialer, HandshakeTarget, RemoteSession, TerminalSize, Transport};

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serializes every test that reads or writes the process environment.
///
/// Opening a session reads the locale variables, so session tests take it
/// too. Poisoning left by a panicked test is ignored.
pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct SessionState {
    stdin: Option<BoxWriter>,
    stdout: Option<BoxReader>,
    stderr: Option<BoxReader>,
    keep_alive: Vec<DuplexStream>,
    subsystems: Vec<String>,
    env: Vec<(String, String)>,
    ptys: Vec<(String, TerminalSize)>,
    window_changes: Vec<TerminalSize>,
    execs: Vec<String>,
    shells: usize,
    failing_subsystem: Option<String>,
    failing_env: HashSet<String>,
    failing_pty: bool,
    failing_shell: bool,
    failing_exec: bool,
    held_open: bool,
    stderr_drained: Option<watch::Receiver<bool>>,
    exit: Option<u32>,
}

struct SessionInner {
    state: Mutex<SessionState>,
    closed: watch::Sender<bool>,
    close_count: AtomicUsize,
}

/// A scripted session that records every request made on it.
#[derive(Clone)]
pub struct FakeSession {
    inner: Arc<SessionInner>,
}

impl FakeSession {
    pub fn new() -> Self {
        let state = SessionState {
            stdin: Some(Box::new(tokio::io::sink())),
            stdout: Some(Box::new(tokio::io::empty())),
            stderr: Some(Box::new(tokio::io::empty())),
            exit: Some(0),
            ..Default::default()
        };
        Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(state),
                closed: watch::channel(false).0,
                close_count: AtomicUsize::new(0),
            }),
        }
    }

    fn update(self, apply: impl FnOnce(&mut SessionState)) -> Self {
        apply(&mut self.inner.state.lock().unwrap());
        self
    }

    pub fn with_stdout(self, bytes: Vec<u8>) -> Self {
        self.update(|s| s.stdout = Some(Box::new(io::Cursor::new(bytes))))
    }

    pub fn with_stderr(self, bytes: Vec<u8>) -> Self {
        self.update(|s| s.stderr = Some(Box::new(io::Cursor::new(bytes))))
    }

    /// Stderr that has to be read before the session can finish, like a
    /// channel whose window is full.
    pub fn with_stderr_flood(self, bytes: Vec<u8>) -> Self {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let (done_tx, done_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = theirs.write_all(&bytes).await;
            let _ = theirs.shutdown().await;
            done_tx.send_replace(true);
        });
        self.update(|s| {
            s.stderr = Some(Box::new(ours));
            s.stderr_drained = Some(done_rx);
        })
    }

    /// Stdout that never reaches end-of-stream.
    pub fn with_open_stdout(self) -> Self {
        let (ours, theirs) = tokio::io::duplex(64);
        self.update(|s| {
            s.stdout = Some(Box::new(ours));
            s.keep_alive.push(theirs);
        })
    }

    /// Stdin and stdout wired to the returned peer stream.
    pub fn with_piped_stdio(self) -> (Self, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(ours);
        let session = self.update(|s| {
            s.stdout = Some(Box::new(reader));
            s.stdin = Some(Box::new(writer));
        });
        (session, theirs)
    }

    /// A session whose stdout was already handed out.
    pub fn without_stdout(self) -> Self {
        self.update(|s| s.stdout = None)
    }

    pub fn failing_subsystem(self, reason: &str) -> Self {
        let reason = reason.to_string();
        self.update(|s| s.failing_subsystem = Some(reason))
    }

    pub fn failing_env(self, name: &str) -> Self {
        let name = name.to_string();
        self.update(|s| {
            s.failing_env.insert(name);
        })
    }

    pub fn failing_pty(self) -> Self {
        self.update(|s| s.failing_pty = true)
    }

    pub fn failing_shell(self) -> Self {
        self.update(|s| s.failing_shell = true)
    }

    pub fn failing_exec(self) -> Self {
        self.update(|s| s.failing_exec = true)
    }

    /// Exit status reported by `wait`; `None` means the session closes
    /// without one.
    pub fn with_exit(self, exit: Option<u32>) -> Self {
        self.update(|s| s.exit = exit)
    }

    /// Make `wait` block until the session is closed.
    pub fn held_open(self) -> Self {
        self.update(|s| s.held_open = true)
    }

    pub fn subsystems(&self) -> Vec<String> {
        self.inner.state.lock().unwrap().subsystems.clone()
    }

    pub fn env(&self) -> Vec<(String, String)> {
        self.inner.state.lock().unwrap().env.clone()
    }

    pub fn ptys(&self) -> Vec<(String, TerminalSize)> {
        self.inner.state.lock().unwrap().ptys.clone()
    }

    pub fn window_changes(&self) -> Vec<TerminalSize> {
        self.inner.state.lock().unwrap().window_changes.clone()
    }

    pub fn execs(&self) -> Vec<String> {
        self.inner.state.lock().unwrap().execs.clone()
    }

    pub fn shells(&self) -> usize {
        self.inner.state.lock().unwrap().shells
    }

    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }
}

fn rejected(request: &str) -> Error {
    Error::Transport(format!("{} request rejected by server", request))
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn take_stdin(&self) -> Option<BoxWriter> {
        self.inner.state.lock().unwrap().stdin.take()
    }

    fn take_stdout(&self) -> Option<BoxReader> {
        self.inner.state.lock().unwrap().stdout.take()
    }

    fn take_stderr(&self) -> Option<BoxReader> {
        self.inner.state.lock().unwrap().stderr.take()
    }

    async fn request_subsystem(&self, name: &str) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.subsystems.push(name.to_string());
        match &state.failing_subsystem {
            Some(reason) => Err(Error::Transport(reason.clone())),
            None => Ok(()),
        }
    }

    async fn set_env(&self, name: &str, value: &str) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.failing_env.contains(name) {
            return Err(rejected("env"));
        }
        state.env.push((name.to_string(), value.to_string()));
        Ok(())
    }

    async fn request_pty(&self, term: &str, size: TerminalSize) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.failing_pty {
            return Err(rejected("pty-req"));
        }
        state.ptys.push((term.to_string(), size));
        Ok(())
    }

    async fn shell(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.failing_shell {
            return Err(rejected("shell"));
        }
        state.shells += 1;
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.failing_exec {
            return Err(rejected("exec"));
        }
        state.execs.push(command.to_string());
        Ok(())
    }

    async fn window_change(&self, size: TerminalSize) -> Result<()> {
        self.inner.state.lock().unwrap().window_changes.push(size);
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let (held_open, exit, drained) = {
            let state = self.inner.state.lock().unwrap();
            (state.held_open, state.exit, state.stderr_drained.clone())
        };
        if let Some(mut drained) = drained {
            let _ = drained.wait_for(|done| *done).await;
        }
        if held_open {
            let mut closed = self.inner.closed.subscribe();
            let _ = closed.wait_for(|closed| *closed).await;
        }
        match exit {
            Some(0) => Ok(()),
            Some(code) => Err(Error::ExitStatus(code)),
            None => Err(Error::ExitMissing),
        }
    }

    fn close(&self) -> Result<()> {
        self.inner.close_count.fetch_add(1, Ordering::SeqCst);
        self.inner.closed.send_replace(true);
        Ok(())
    }
}

struct TransportInner {
    sessions: Mutex<VecDeque<FakeSession>>,
    opened: AtomicUsize,
    dial_failures: AtomicU32,
    dial_attempts: AtomicU32,
    dial_peers: Mutex<Option<mpsc::UnboundedSender<DuplexStream>>>,
    close_count: AtomicUsize,
}

/// A transport handing out queued sessions and scripted dials.
///
/// Successful dials are answered by an echo peer unless
/// [`FakeTransport::with_piped_dials`] routes them to the test instead.
#[derive(Clone)]
pub struct FakeTransport {
    inner: Arc<TransportInner>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TransportInner {
                sessions: Mutex::new(VecDeque::new()),
                opened: AtomicUsize::new(0),
                dial_failures: AtomicU32::new(0),
                dial_attempts: AtomicU32::new(0),
                dial_peers: Mutex::new(None),
                close_count: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_session(self, session: FakeSession) -> Self {
        self.inner.sessions.lock().unwrap().push_back(session);
        self
    }

    /// Fail the next `count` dials.
    pub fn with_dial_failures(self, count: u32) -> Self {
        self.inner.dial_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_piped_dials(self) -> (Self, DialPeers) {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.dial_peers.lock().unwrap() = Some(tx);
        (self, DialPeers { rx })
    }

    pub fn opened_sessions(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn dial_attempts(&self) -> u32 {
        self.inner.dial_attempts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::SeqCst)
    }
}

/// Far ends of the connections dialed through a [`FakeTransport`].
pub struct DialPeers {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl DialPeers {
    pub async fn recv_peer(&mut self) -> DuplexStream {
        self.rx.recv().await.unwrap()
    }
}

async fn echo(mut peer: DuplexStream) {
    let mut buf = [0u8; 1024];
    loop {
        match peer.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if peer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_session(&self) -> Result<Arc<dyn RemoteSession>> {
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        let session = self
            .inner
            .sessions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Transport("no session available".to_string()))?;
        Ok(Arc::new(session))
    }

    async fn dial(&self, address: &str) -> Result<VirtualConnection> {
        self.inner.dial_attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .inner
            .dial_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Transport(format!("connect to {}: connection refused", address)));
        }

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let piped = self.inner.dial_peers.lock().unwrap().clone();
        match piped {
            Some(tx) => {
                let _ = tx.send(theirs);
            }
            None => {
                tokio::spawn(echo(theirs));
            }
        }
        Ok(VirtualConnection::from_stream(ours, NopCloser, "127.0.0.1:0", address))
    }

    async fn close(&self) -> Result<()> {
        self.inner.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What a [`FakeConnector`] does with one handshake.
#[derive(Debug, Clone)]
pub enum Handshake {
    Accept,
    Reject,
    Fail(String),
}

struct ConnectorInner {
    script: Mutex<VecDeque<Handshake>>,
    attempts: Mutex<Vec<(String, String, String)>>,
    policies: Mutex<Vec<HostKeyPolicy>>,
    node: FakeTransport,
}

/// A connector that plays back a scripted handshake per call.
#[derive(Clone)]
pub struct FakeConnector {
    inner: Arc<ConnectorInner>,
}

impl FakeConnector {
    pub fn new(script: impl IntoIterator<Item = Handshake>) -> Self {
        Self::with_node(script, FakeTransport::new())
    }

    /// Accepted handshakes yield `node`.
    pub fn with_node(script: impl IntoIterator<Item = Handshake>, node: FakeTransport) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                script: Mutex::new(script.into_iter().collect()),
                attempts: Mutex::new(Vec::new()),
                policies: Mutex::new(Vec::new()),
                node,
            }),
        }
    }

    /// Method labels in the order they were tried.
    pub fn methods(&self) -> Vec<String> {
        self.inner
            .attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(method, _, _)| method.clone())
            .collect()
    }

    /// `(address, login)` of every handshake.
    pub fn targets(&self) -> Vec<(String, String)> {
        self.inner
            .attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, address, login)| (address.clone(), login.clone()))
            .collect()
    }

    /// Host-key policy handed to every handshake.
    pub fn policies(&self) -> Vec<HostKeyPolicy> {
        self.inner.policies.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        _conn: VirtualConnection,
        target: &HandshakeTarget<'_>,
        method: &dyn AuthStrategy,
    ) -> Result<Arc<dyn Transport>> {
        self.inner.attempts.lock().unwrap().push((
            method.label(),
            target.address.to_string(),
            target.login.to_string(),
        ));
        self.inner
            .policies
            .lock()
            .unwrap()
            .push(target.host_key_policy.clone());
        let step = self
            .inner
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Handshake::Reject);
        match step {
            Handshake::Accept => Ok(Arc::new(self.inner.node.clone())),
            Handshake::Reject => Err(Error::AuthRejected {
                method: method.label(),
            }),
            Handshake::Fail(reason) => Err(Error::Transport(reason)),
        }
    }
}

/// Authentication method that is only ever handed to fake connectors.
pub struct NamedAuth(pub &'static str);

#[async_trait]
impl AuthStrategy for NamedAuth {
    async fn authenticate(
        &self,
        _handle: &mut client::Handle<ClientHandler>,
        _username: &str,
    ) -> Result<bool> {
        Ok(false)
    }

    fn name(&self) -> &'static str {
        "named"
    }

    fn label(&self) -> String {
        self.0.to_string()
    }
}

struct ControlInner {
    nodes: Vec<NodeRecord>,
    sessions: Mutex<VecDeque<Option<SessionRecord>>>,
    last: Mutex<Option<SessionRecord>>,
    polls: AtomicUsize,
    dialers: AtomicUsize,
}

/// Control API answering from fixed data. Session polls play back a script;
/// once it runs out the last answer repeats.
#[derive(Clone)]
pub struct FakeControl {
    inner: Arc<ControlInner>,
}

impl FakeControl {
    pub fn new(nodes: Vec<NodeRecord>) -> Self {
        Self::with_sessions(nodes, Vec::new())
    }

    pub fn with_sessions(nodes: Vec<NodeRecord>, sessions: Vec<Option<SessionRecord>>) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                nodes,
                sessions: Mutex::new(sessions.into_iter().collect()),
                last: Mutex::new(None),
                polls: AtomicUsize::new(0),
                dialers: AtomicUsize::new(0),
            }),
        }
    }

    pub fn polls(&self) -> usize {
        self.inner.polls.load(Ordering::SeqCst)
    }

    /// How many times a client was built through [`ControlConnector`].
    pub fn connections(&self) -> usize {
        self.inner.dialers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlClient for FakeControl {
    async fn nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.inner.nodes.clone())
    }

    async fn session(&self, _id: &str) -> Result<Option<SessionRecord>> {
        self.inner.polls.fetch_add(1, Ordering::SeqCst);
        let mut last = self.inner.last.lock().unwrap();
        if let Some(next) = self.inner.sessions.lock().unwrap().pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }
}

impl ControlConnector for FakeControl {
    fn connect(&self, _dialer: Dialer) -> Arc<dyn ControlClient> {
        self.inner.dialers.fetch_add(1, Ordering::SeqCst);
        Arc::new(self.clone())
    }
}

#[derive(Default)]
struct TerminalState {
    size: TerminalSize,
    set_sizes: Vec<TerminalSize>,
    echoed: Vec<u8>,
    subscribers: Vec<mpsc::Sender<()>>,
}

/// A terminal that records what was done to it.
///
/// Like a real one, changing its size (by the user or through `set_size`)
/// raises a window-change notification.
#[derive(Clone, Default)]
pub struct FakeTerminal {
    state: Arc<Mutex<TerminalState>>,
}

impl FakeTerminal {
    pub fn new(size: TerminalSize) -> Self {
        let terminal = Self::default();
        terminal.state.lock().unwrap().size = size;
        terminal
    }

    /// Simulate the user resizing the window.
    pub fn resize(&self, size: TerminalSize) {
        let mut state = self.state.lock().unwrap();
        state.size = size;
        notify(&state.subscribers);
    }

    /// Raise a notification without changing the size.
    pub fn notify_resize(&self) {
        notify(&self.state.lock().unwrap().subscribers);
    }

    pub fn set_sizes(&self) -> Vec<TerminalSize> {
        self.state.lock().unwrap().set_sizes.clone()
    }

    pub fn echoed(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().unwrap().echoed).into_owned()
    }

    pub fn subscribers(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }
}

fn notify(subscribers: &[mpsc::Sender<()>]) {
    for subscriber in subscribers {
        let _ = subscriber.try_send(());
    }
}

impl LocalTerminal for FakeTerminal {
    fn size(&self) -> io::Result<TerminalSize> {
        Ok(self.state.lock().unwrap().size)
    }

    fn set_size(&self, size: TerminalSize) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.size = size;
        state.set_sizes.push(size);
        notify(&state.subscribers);
        Ok(())
    }

    fn echo(&self, bytes: &[u8]) -> io::Result<()> {
        self.state.lock().unwrap().echoed.extend_from_slice(bytes);
        Ok(())
    }

    fn subscribe_resize(&self) -> io::Result<mpsc::Receiver<()>> {
        let (tx, rx) = mpsc::channel(8);
        self.state.lock().unwrap().subscribers.push(tx);
        Ok(rx)
    }
}
