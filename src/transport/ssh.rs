//! russh binding for the transport capabilities.
//!
//! ## Relay connection
//!
//! 1. **Address Parsing**: `host:port`, default port 22.
//! 2. **Client Configuration**: keepalive, optional zlib compression, no
//!    inactivity timeout (sessions through the relay are long-lived).
//! 3. **Connection Establishment**: TCP connect with timeout, retried with
//!    exponential backoff and jitter via `backon` on transient errors only.
//! 4. **Authentication**: the configured [`AuthChain`] is walked on the one
//!    connection until a method succeeds.
//!
//! ## Sessions
//!
//! Every [`SshSession`] is driven by a background task that owns the russh
//! channel. The task pumps `Data` into the stdout pipe, extended data into the
//! stderr pipe, and the stdin pipe into the channel. Want-reply requests are
//! answered by the server in order, so pending replies sit in a FIFO and are
//! resolved by `Success`/`Failure` messages as they arrive.
//!
//! ## Node handshake
//!
//! [`SshConnector`] runs `client::connect_stream` over a
//! [`VirtualConnection`] and authenticates with exactly one method.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg, keys};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::auth::{AuthChain, AuthStrategy};
use crate::config::MAX_RETRY_DELAY;
use crate::conn::{BoxReader, BoxWriter, NopCloser, VirtualConnection};
use crate::error::{Error, Result};
use crate::hostkey::HostKeyPolicy;

use super::{
    Connector, HandshakeTarget, RemoteSession, TerminalSize, Transport, cluster_name,
    is_cluster_endpoint, strip_cluster,
};

/// Buffer size of the in-memory pipes between a session task and its users.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Largest chunk read from a session's stdin pipe at once.
const STDIN_CHUNK: usize = 32 * 1024;

/// Default SSH port when an address carries none.
const DEFAULT_SSH_PORT: u16 = 22;

/// Build russh client configuration.
///
/// Keepalive every 30 seconds, at most 3 missed. Compression preference is
/// zlib-then-none when `compress` is set, none otherwise.
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Parse `host:port` or `host` (port 22).
///
/// Uses `rsplit_once` so bracketed IPv6 addresses keep their colons.
pub(crate) fn parse_address(address: &str) -> Result<(String, u16)> {
    if let Some((host, port_str)) = address.rsplit_once(':')
        && !host.ends_with(':')
    {
        let port = port_str
            .parse::<u16>()
            .map_err(|e| Error::InvalidAddress(format!("{}: invalid port: {}", address, e)))?;
        Ok((host.to_string(), port))
    } else {
        Ok((address.to_string(), DEFAULT_SSH_PORT))
    }
}

/// Host and port a node's host key is checked against.
///
/// Relay routing suffixes are dropped, so `db01:3022@east` is checked as
/// `db01` port 3022. A control endpoint `@east` is checked under the
/// cluster name, `east` port 22.
pub(crate) fn parse_node_address(address: &str) -> Result<(String, u16)> {
    if is_cluster_endpoint(address) {
        return Ok((cluster_name(address).to_string(), DEFAULT_SSH_PORT));
    }
    parse_address(strip_cluster(address))
}

/// russh handler applying a [`HostKeyPolicy`].
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(host: impl Into<String>, port: u16, policy: HostKeyPolicy) -> Self {
        Self {
            host: host.into(),
            port,
            policy,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        if self
            .policy
            .verify(&self.host, self.port, server_public_key)?
        {
            Ok(true)
        } else {
            Err(Error::HostKey {
                host: format!("{}:{}", self.host, self.port),
                reason: "key not trusted".to_string(),
            })
        }
    }
}

/// Settings for the initial relay connection.
pub struct RelayConnectOptions<'a> {
    pub address: &'a str,
    pub login: &'a str,
    pub auth: &'a AuthChain,
    pub host_key_policy: &'a HostKeyPolicy,
    pub timeout: Duration,
    pub max_retries: u32,
    pub min_delay: Duration,
    pub compress: bool,
}

/// Connect and authenticate to the relay, retrying transient failures.
///
/// Returns the transport and the number of retries that were needed.
pub async fn connect_relay(options: &RelayConnectOptions<'_>) -> Result<(SshTransport, u32)> {
    let attempt_counter = AtomicU32::new(0);

    let backoff = ExponentialBuilder::default()
        .with_min_delay(options.min_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(options.max_retries as usize)
        .with_jitter();

    let result = (|| async {
        let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
        if current_attempt > 0 {
            warn!(
                "Relay connection retry attempt {} to {}@{}",
                current_attempt, options.login, options.address
            );
        }
        connect_relay_once(options).await
    })
    .retry(backoff)
    .when(|e| {
        let retryable = e.is_retryable();
        if !retryable {
            warn!(
                "Relay connection to {}@{} failed with non-retryable error: {}",
                options.login, options.address, e
            );
        }
        retryable
    })
    .notify(|err, dur| {
        warn!("Relay connection failed: {}. Retrying in {:?}", err, dur);
    })
    .await;

    let total_attempts = attempt_counter.load(Ordering::SeqCst);
    let retry_count = total_attempts.saturating_sub(1);

    match result {
        Ok(transport) => {
            if retry_count > 0 {
                info!(
                    "Relay connection to {}@{} succeeded after {} retry attempt(s)",
                    options.login, options.address, retry_count
                );
            }
            Ok((transport, retry_count))
        }
        Err(e) => {
            error!(
                "Relay connection to {}@{} failed after {} attempt(s): {}",
                options.login, options.address, total_attempts, e
            );
            Err(e)
        }
    }
}

async fn connect_relay_once(options: &RelayConnectOptions<'_>) -> Result<SshTransport> {
    let (host, port) = parse_address(options.address)?;
    let config = build_client_config(options.compress);
    let handler = ClientHandler::new(host.as_str(), port, options.host_key_policy.clone());

    let mut handle = tokio::time::timeout(
        options.timeout,
        client::connect(config, (host.as_str(), port), handler),
    )
    .await
    .map_err(|_| Error::Timeout(format!("connecting to relay {}", options.address)))??;

    options.auth.authenticate(&mut handle, options.login).await?;

    info!("Connected to relay {} as {}", options.address, options.login);
    Ok(SshTransport::new(handle, options.address))
}

/// An authenticated russh connection.
pub struct SshTransport {
    handle: client::Handle<ClientHandler>,
    remote: String,
}

impl SshTransport {
    pub fn new(handle: client::Handle<ClientHandler>, remote: impl Into<String>) -> Self {
        Self {
            handle,
            remote: remote.into(),
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_session(&self) -> Result<Arc<dyn RemoteSession>> {
        let channel = self.handle.channel_open_session().await?;
        Ok(Arc::new(SshSession::spawn(channel)))
    }

    async fn dial(&self, address: &str) -> Result<VirtualConnection> {
        let (host, port) = parse_address(address)?;
        let channel = self
            .handle
            .channel_open_direct_tcpip(host.as_str(), port as u32, "127.0.0.1", 0)
            .await?;
        debug!("Opened direct-tcpip channel via {} to {}", self.remote, address);
        Ok(VirtualConnection::from_stream(
            channel.into_stream(),
            NopCloser,
            "127.0.0.1:0",
            address,
        ))
    }

    async fn close(&self) -> Result<()> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }
}

/// Requests the session task sends on behalf of callers.
enum Request {
    Subsystem(String),
    Env { name: String, value: String },
    Pty { term: String, size: TerminalSize },
    Shell,
    Exec(String),
    WindowChange(TerminalSize),
}

enum Command {
    Request {
        request: Request,
        reply: oneshot::Sender<Result<()>>,
    },
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionExit {
    Running,
    Exited(u32),
    Closed,
}

/// A session channel driven by a background task.
pub struct SshSession {
    commands: mpsc::UnboundedSender<Command>,
    stdin: Mutex<Option<BoxWriter>>,
    stdout: Mutex<Option<BoxReader>>,
    stderr: Mutex<Option<BoxReader>>,
    exit: watch::Receiver<SessionExit>,
}

impl SshSession {
    fn spawn(channel: Channel<Msg>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (stdin_user, stdin_task) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_task, stdout_user) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_task, stderr_user) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(SessionExit::Running);

        tokio::spawn(drive_session(
            channel,
            commands_rx,
            stdin_task,
            stdout_task,
            stderr_task,
            exit_tx,
        ));

        Self {
            commands: commands_tx,
            stdin: Mutex::new(Some(Box::new(stdin_user))),
            stdout: Mutex::new(Some(Box::new(stdout_user))),
            stderr: Mutex::new(Some(Box::new(stderr_user))),
            exit: exit_rx,
        }
    }

    async fn request(&self, request: Request) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                request,
                reply: reply_tx,
            })
            .map_err(|_| Error::Transport("session closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Transport("session closed".to_string()))?
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().ok().and_then(|mut guard| guard.take())
}

#[async_trait]
impl RemoteSession for SshSession {
    fn take_stdin(&self) -> Option<BoxWriter> {
        take(&self.stdin)
    }

    fn take_stdout(&self) -> Option<BoxReader> {
        take(&self.stdout)
    }

    fn take_stderr(&self) -> Option<BoxReader> {
        take(&self.stderr)
    }

    async fn request_subsystem(&self, name: &str) -> Result<()> {
        self.request(Request::Subsystem(name.to_string())).await
    }

    async fn set_env(&self, name: &str, value: &str) -> Result<()> {
        self.request(Request::Env {
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
    }

    async fn request_pty(&self, term: &str, size: TerminalSize) -> Result<()> {
        self.request(Request::Pty {
            term: term.to_string(),
            size,
        })
        .await
    }

    async fn shell(&self) -> Result<()> {
        self.request(Request::Shell).await
    }

    async fn exec(&self, command: &str) -> Result<()> {
        self.request(Request::Exec(command.to_string())).await
    }

    async fn window_change(&self, size: TerminalSize) -> Result<()> {
        self.request(Request::WindowChange(size)).await
    }

    async fn wait(&self) -> Result<()> {
        let mut exit = self.exit.clone();
        let outcome = exit
            .wait_for(|state| *state != SessionExit::Running)
            .await
            .map(|state| *state)
            .unwrap_or(SessionExit::Closed);
        match outcome {
            SessionExit::Exited(0) => Ok(()),
            SessionExit::Exited(code) => Err(Error::ExitStatus(code)),
            SessionExit::Running | SessionExit::Closed => Err(Error::ExitMissing),
        }
    }

    fn close(&self) -> Result<()> {
        // The task may already be gone; closing twice is fine.
        let _ = self.commands.send(Command::Close);
        Ok(())
    }
}

/// Send a request on the channel. Returns whether a reply is expected.
async fn send_request(channel: &Channel<Msg>, request: Request) -> Result<bool> {
    match request {
        Request::Subsystem(name) => channel.request_subsystem(true, name).await?,
        Request::Env { name, value } => channel.set_env(true, name, value).await?,
        Request::Pty { term, size } => {
            channel
                .request_pty(
                    true,
                    &term,
                    u32::from(size.width),
                    u32::from(size.height),
                    0,
                    0,
                    &[],
                )
                .await?
        }
        Request::Shell => channel.request_shell(true).await?,
        Request::Exec(command) => channel.exec(true, command).await?,
        Request::WindowChange(size) => {
            channel
                .window_change(u32::from(size.width), u32::from(size.height), 0, 0)
                .await?;
            return Ok(false);
        }
    }
    Ok(true)
}

/// Write to a pipe, dropping it once nobody reads the other end.
async fn forward(pipe: &mut Option<DuplexStream>, data: &[u8]) {
    if let Some(writer) = pipe
        && writer.write_all(data).await.is_err()
    {
        *pipe = None;
    }
}

async fn drive_session(
    mut channel: Channel<Msg>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
    exit: watch::Sender<SessionExit>,
) {
    let mut stdout = Some(stdout);
    let mut stderr = Some(stderr);
    let mut pending: VecDeque<oneshot::Sender<Result<()>>> = VecDeque::new();
    let mut buf = vec![0u8; STDIN_CHUNK];
    let mut stdin_open = true;
    let mut exit_status = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Request { request, reply }) => {
                    match send_request(&channel, request).await {
                        Ok(true) => pending.push_back(reply),
                        Ok(false) => {
                            let _ = reply.send(Ok(()));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                Some(Command::Close) | None => {
                    let _ = channel.close().await;
                    break;
                }
            },

            read = stdin.read(&mut buf), if stdin_open => match read {
                Ok(0) | Err(_) => {
                    stdin_open = false;
                    let _ = channel.eof().await;
                }
                Ok(n) => {
                    if let Err(e) = channel.data(&buf[..n]).await {
                        debug!("Failed to write to session channel: {}", e);
                        stdin_open = false;
                    }
                }
            },

            message = channel.wait() => match message {
                Some(ChannelMsg::Data { data }) => forward(&mut stdout, &data).await,
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    forward(&mut stderr, &data).await
                }
                Some(ChannelMsg::Success) => {
                    if let Some(reply) = pending.pop_front() {
                        let _ = reply.send(Ok(()));
                    }
                }
                Some(ChannelMsg::Failure) => {
                    if let Some(reply) = pending.pop_front() {
                        let _ = reply.send(Err(Error::Transport(
                            "request rejected by server".to_string(),
                        )));
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                    exit_status = Some(status);
                }
                Some(ChannelMsg::Eof) => {
                    stdout = None;
                    stderr = None;
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    for reply in pending.drain(..) {
        let _ = reply.send(Err(Error::Transport("session closed".to_string())));
    }

    let _ = exit.send(match exit_status {
        Some(status) => SessionExit::Exited(status),
        None => SessionExit::Closed,
    });
    debug!("Session channel task finished");
}

/// Runs the node handshake over a virtual connection with russh.
pub struct SshConnector {
    config: Arc<client::Config>,
    timeout: Duration,
}

impl SshConnector {
    pub fn new(compress: bool, timeout: Duration) -> Self {
        Self {
            config: build_client_config(compress),
            timeout,
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        conn: VirtualConnection,
        target: &HandshakeTarget<'_>,
        method: &dyn AuthStrategy,
    ) -> Result<Arc<dyn Transport>> {
        let (host, port) = parse_node_address(target.address)?;
        let handler = ClientHandler::new(host, port, target.host_key_policy.clone());

        let mut handle = tokio::time::timeout(
            self.timeout,
            client::connect_stream(self.config.clone(), conn, handler),
        )
        .await
        .map_err(|_| Error::Timeout(format!("handshake with {}", target.address)))??;

        if !method.authenticate(&mut handle, target.login).await? {
            return Err(Error::AuthRejected {
                method: method.label(),
            });
        }

        debug!(
            "Authenticated to {} as {} with {}",
            target.address,
            target.login,
            method.label()
        );
        Ok(Arc::new(SshTransport::new(handle, target.address)))
    }
}
