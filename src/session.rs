//! Interactive sessions on a node.
//!
//! A [`NodeSession`] is one remote terminal or command: its id, the
//! environment handed to the remote end, the terminal geometry and the
//! server-side session backing it. Sessions are either new (fresh id, local
//! terminal size) or joined (id and geometry adopted from an existing shared
//! session).
//!
//! # Lifecycle
//!
//! ```text
//! Created ──shell/exec──▶ Running ──server closed / cancel──▶ Closed
//! ```
//!
//! # Resize synchronization
//!
//! While a shell runs on an attached terminal, [`ResizeLoop`] reconciles
//! three sources through one `select!`:
//!
//! - local window-change notifications, forwarded to the remote end unless
//!   the size equals the last one we sent or applied;
//! - a periodic poll of the control API, so a size set by another party on
//!   the same session is applied to our terminal;
//! - the session's cancellation token.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::resolve_session_refresh;
use crate::control::{ControlClient, SessionRecord};
use crate::error::Result;
use crate::node::NodeClient;
use crate::terminal::{LocalTerminal, resize_escape};
use crate::transport::{RemoteSession, TerminalSize};

/// Environment variable carrying the session id to the remote end.
pub const SESSION_ENV_VAR: &str = "TELEPORT_SESSION";

/// Local environment variables passed through to the remote end when set.
const FORWARDED_ENV_VARS: &[&str] = &["LANG", "LANGUAGE"];

/// Terminal type requested for the remote pseudo-terminal.
pub const TERMINAL_TYPE: &str = "xterm";

/// How to set up a session.
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Join this existing session instead of starting a new one.
    pub join: Option<SessionRecord>,
    /// Extra environment for the remote end.
    pub env: HashMap<String, String>,
    /// The terminal controlling this session, if any.
    pub terminal: Option<Arc<dyn LocalTerminal>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Created,
    Running,
    Closed,
}

pub struct NodeSession {
    id: String,
    env: HashMap<String, String>,
    terminal: Option<Arc<dyn LocalTerminal>>,
    size: Arc<watch::Sender<TerminalSize>>,
    server: Arc<dyn RemoteSession>,
    node: Arc<NodeClient>,
    status: Arc<watch::Sender<SessionStatus>>,
    cancel: CancellationToken,
    refresh: Duration,
}

impl NodeSession {
    pub(crate) async fn open(node: Arc<NodeClient>, options: SessionOptions) -> Result<Self> {
        let SessionOptions {
            join,
            mut env,
            terminal,
        } = options;

        let mut size = TerminalSize::default();
        if let Some(terminal) = &terminal {
            match terminal.size() {
                Ok(local) => size = local,
                Err(e) => error!("Failed to read terminal size: {}", e),
            }
        }

        let id = match join {
            Some(joined) => {
                size = joined.terminal_params.size();
                if let Some(terminal) = &terminal {
                    if let Err(e) = terminal.set_size(size) {
                        error!("Failed to resize terminal: {}", e);
                    }
                    if let Err(e) = terminal.echo(resize_escape(size).as_bytes()) {
                        warn!("Failed to write resize sequence: {}", e);
                    }
                }
                joined.id
            }
            None => Uuid::new_v4().to_string(),
        };
        env.insert(SESSION_ENV_VAR.to_string(), id.clone());

        let server = node.transport().open_session().await?;

        for name in FORWARDED_ENV_VARS {
            if let Ok(value) = env::var(name)
                && !value.is_empty()
                && let Err(e) = server.set_env(name, &value).await
            {
                warn!("Failed to pass {} to session {}: {}", name, id, e);
            }
        }
        for (name, value) in &env {
            if let Err(e) = server.set_env(name, value).await {
                warn!("Failed to set {} on session {}: {}", name, id, e);
            }
        }

        let refresh = node
            .proxy()
            .map(|proxy| proxy.settings().session_refresh)
            .unwrap_or_else(|| resolve_session_refresh(None));

        debug!("Session {} created ({}x{})", id, size.width, size.height);
        Ok(Self {
            id,
            env,
            terminal,
            size: Arc::new(watch::channel(size).0),
            server,
            node,
            status: Arc::new(watch::channel(SessionStatus::Created).0),
            cancel: CancellationToken::new(),
            refresh,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Current terminal geometry, kept up to date by the resize loop.
    pub fn size(&self) -> TerminalSize {
        *self.size.borrow()
    }

    pub fn is_attached(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn node(&self) -> &Arc<NodeClient> {
        &self.node
    }

    pub(crate) fn server(&self) -> &Arc<dyn RemoteSession> {
        &self.server
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Start synchronizing terminal size, if a terminal is attached.
    pub(crate) fn start_resize_loop(&self) -> Result<()> {
        let Some(terminal) = self.terminal.clone() else {
            return Ok(());
        };
        let resized = terminal.subscribe_resize()?;

        let resize = ResizeLoop {
            session_id: self.id.clone(),
            server: self.server.clone(),
            terminal,
            size: self.size.clone(),
            refresh: self.refresh,
            cancel: self.cancel.clone(),
        };
        let proxy = self.node.proxy();

        tokio::spawn(async move {
            let control = match proxy {
                Some(proxy) => tokio::select! {
                    _ = resize.cancel.cancelled() => return,
                    connected = proxy.connect_to_site() => match connected {
                        Ok(control) => Some(control),
                        Err(e) => {
                            error!("Failed to reach control API for session {}: {}", resize.session_id, e);
                            None
                        }
                    },
                },
                None => None,
            };
            resize.run(control, resized).await;
        });
        Ok(())
    }

    /// Mark the session running and watch for the server side to end.
    pub(crate) fn mark_running(&self) {
        self.status.send_replace(SessionStatus::Running);

        let server = self.server.clone();
        let cancel = self.cancel.clone();
        let status = self.status.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = server.wait() => debug!("Session {} ended on the server", id),
                _ = cancel.cancelled() => debug!("Session {} cancelled", id),
            }
            cancel.cancel();
            status.send_replace(SessionStatus::Closed);
        });
    }

    /// Stop the resize loop and close the server-side session.
    pub fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.status.send_replace(SessionStatus::Closed);
        self.server.close()
    }
}

/// Background reconciliation of local and remote terminal sizes.
pub(crate) struct ResizeLoop {
    pub(crate) session_id: String,
    pub(crate) server: Arc<dyn RemoteSession>,
    pub(crate) terminal: Arc<dyn LocalTerminal>,
    pub(crate) size: Arc<watch::Sender<TerminalSize>>,
    pub(crate) refresh: Duration,
    pub(crate) cancel: CancellationToken,
}

impl ResizeLoop {
    pub(crate) async fn run(
        self,
        control: Option<Arc<dyn ControlClient>>,
        mut resized: mpsc::Receiver<()>,
    ) {
        // The size the remote end was last told about, or that we last
        // applied locally. Notifications for this size are our own echo.
        let mut last_sent = *self.size.borrow();
        let mut previous: Option<TerminalSize> = None;

        let mut tick = tokio::time::interval_at(Instant::now() + self.refresh, self.refresh);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                signal = resized.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    let size = match self.terminal.size() {
                        Ok(size) => size,
                        Err(e) => {
                            warn!("Failed to read terminal size: {}", e);
                            continue;
                        }
                    };
                    if size == last_sent {
                        continue;
                    }
                    match self.server.window_change(size).await {
                        Ok(()) => {
                            debug!("Sent window change {}x{}", size.width, size.height);
                            last_sent = size;
                            self.size.send_replace(size);
                        }
                        Err(e) => warn!("Failed to send window change: {}", e),
                    }
                }

                _ = tick.tick(), if control.is_some() => {
                    let Some(control) = &control else { continue };
                    let record = match control.session(&self.session_id).await {
                        Ok(Some(record)) => record,
                        Ok(None) => {
                            previous = None;
                            continue;
                        }
                        Err(e) => {
                            error!("Failed to poll session {}: {}", self.session_id, e);
                            continue;
                        }
                    };
                    let remote = record.terminal_params.size();
                    let Some(prev) = previous.replace(remote) else {
                        continue;
                    };
                    info!(
                        "Updating session {} with {} parties",
                        record.id,
                        record.parties.len()
                    );
                    if prev == remote {
                        continue;
                    }

                    let local = self.terminal.size().unwrap_or(last_sent);
                    last_sent = remote;
                    self.size.send_replace(remote);
                    if local == remote {
                        continue;
                    }
                    if let Err(e) = self.terminal.set_size(remote) {
                        error!("Failed to resize terminal: {}", e);
                    }
                    if let Err(e) = self.terminal.echo(resize_escape(remote).as_bytes()) {
                        warn!("Failed to write resize sequence: {}", e);
                    }
                }
            }
        }
        debug!("Resize loop for session {} stopped", self.session_id);
    }
}
