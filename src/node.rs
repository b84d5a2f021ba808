//! Connection to one node reached through the relay.
//!
//! A [`NodeClient`] wraps the transport negotiated by the credential trial
//! loop and offers what can be done on a node: interactive shells, commands,
//! file transfers and (see [`crate::forward`]) TCP tunnels.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::conn::{BoxReader, BoxWriter, MultiCloser, VirtualConnection};
use crate::error::{Error, Result};
use crate::proxy::ProxyClient;
use crate::scp::{ScpCommand, TransferProtocol};
use crate::session::{NodeSession, SessionOptions, TERMINAL_TYPE};
use crate::transport::{RemoteSession, SessionCloser, Transport};

/// Placeholder endpoint of shell and transfer connections.
const SESSION_ADDR: &str = "0.0.0.0:0";

pub struct NodeClient {
    transport: Arc<dyn Transport>,
    proxy: Weak<ProxyClient>,
}

/// Take the three pipes of a freshly opened session.
///
/// The session is closed when any of them is unavailable.
pub(crate) fn take_pipes(session: &dyn RemoteSession) -> Result<(BoxWriter, BoxReader, BoxReader)> {
    let pipes = session
        .take_stdin()
        .zip(session.take_stdout())
        .zip(session.take_stderr());
    match pipes {
        Some(((stdin, stdout), stderr)) => Ok((stdin, stdout, stderr)),
        None => {
            let _ = session.close();
            Err(Error::Transport("session pipes unavailable".to_string()))
        }
    }
}

impl NodeClient {
    pub fn new(transport: Arc<dyn Transport>, proxy: Weak<ProxyClient>) -> Self {
        Self { transport, proxy }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The relay client this node was reached through, if still alive.
    pub fn proxy(&self) -> Option<Arc<ProxyClient>> {
        self.proxy.upgrade()
    }

    /// Create a new session or join an existing one.
    pub async fn new_session(self: &Arc<Self>, options: SessionOptions) -> Result<NodeSession> {
        NodeSession::open(self.clone(), options).await
    }

    /// Start an interactive shell on `session`.
    ///
    /// A pseudo-terminal of the session's size is allocated first; if that
    /// fails the shell is never started and the allocation error is
    /// returned. The returned connection carries the shell's input and
    /// output; its error stream is copied to local stderr. Closing the
    /// connection closes the session and stops the resize loop.
    pub async fn shell(&self, session: &NodeSession) -> Result<VirtualConnection> {
        let server = session.server().clone();

        server.request_pty(TERMINAL_TYPE, session.size()).await?;
        let (stdin, stdout, mut stderr) = take_pipes(server.as_ref())?;

        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut stderr, &mut tokio::io::stderr()).await;
        });

        if let Err(e) = session.start_resize_loop() {
            warn!("Terminal resize tracking unavailable: {}", e);
        }

        if let Err(e) = server.shell().await {
            let _ = session.close();
            return Err(e);
        }
        session.mark_running();
        info!("Shell started for session {}", session.id());

        let closer = MultiCloser::new()
            .with(SessionCloser(server))
            .with(session.cancellation());
        Ok(VirtualConnection::new(
            stdout,
            stdin,
            closer,
            SESSION_ADDR,
            SESSION_ADDR,
        ))
    }

    /// Run a command to completion.
    ///
    /// `argv` is joined with single spaces. Environment variables are set
    /// best-effort. Returns once the command has exited and its output has
    /// been copied; stdin is abandoned at that point.
    pub async fn run<R, W, E>(
        &self,
        argv: &[String],
        stdin: R,
        stdout: &mut W,
        stderr: &mut E,
        env: &HashMap<String, String>,
    ) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin,
        E: AsyncWrite + Send + Unpin,
    {
        let server = self.transport.open_session().await?;
        for (name, value) in env {
            if let Err(e) = server.set_env(name, value).await {
                warn!("Failed to set {}: {}", name, e);
            }
        }

        let (mut remote_in, mut remote_out, mut remote_err) = take_pipes(server.as_ref())?;
        let command = argv.join(" ");
        if let Err(e) = server.exec(&command).await {
            let _ = server.close();
            return Err(e);
        }
        debug!("Running: {}", command);

        let input = tokio::spawn(async move {
            let mut stdin = stdin;
            let _ = tokio::io::copy(&mut stdin, &mut remote_in).await;
            let _ = remote_in.shutdown().await;
        });

        let (out, err, exit) = tokio::join!(
            tokio::io::copy(&mut remote_out, stdout),
            tokio::io::copy(&mut remote_err, stderr),
            server.wait(),
        );
        input.abort();
        let _ = server.close();

        if let Err(e) = out {
            debug!("Command output copy ended: {}", e);
        }
        if let Err(e) = err {
            debug!("Command error copy ended: {}", e);
        }
        let _ = stdout.flush().await;
        let _ = stderr.flush().await;
        exit
    }

    /// Upload a local file or directory to `remote`.
    pub async fn upload(
        &self,
        local: &Path,
        remote: &str,
        protocol: &dyn TransferProtocol,
    ) -> Result<()> {
        let is_dir = tokio::fs::metadata(local).await?.is_dir();
        let command = ScpCommand::upload(local, is_dir);
        let shell_command = command.remote_command(remote);
        self.scp(&command, &shell_command, protocol).await
    }

    /// Download `remote` into a local file or directory.
    pub async fn download(
        &self,
        remote: &str,
        local: &Path,
        is_dir: bool,
        protocol: &dyn TransferProtocol,
    ) -> Result<()> {
        let command = ScpCommand::download(local, is_dir);
        let shell_command = command.remote_command(remote);
        self.scp(&command, &shell_command, protocol).await
    }

    /// Run the remote half of a transfer while `protocol` drives the local
    /// half over the same session.
    ///
    /// Remote diagnostics go to the local stderr. A protocol error wins over
    /// the remote exit status, except end-of-stream which counts as a
    /// completed transfer.
    async fn scp(
        &self,
        command: &ScpCommand,
        shell_command: &str,
        protocol: &dyn TransferProtocol,
    ) -> Result<()> {
        let server = self.transport.open_session().await?;
        let (stdin, stdout, mut stderr) = take_pipes(server.as_ref())?;
        tokio::spawn(async move {
            let mut local = tokio::io::stderr();
            let _ = tokio::io::copy(&mut stderr, &mut local).await;
        });
        let conn = VirtualConnection::new(
            stdout,
            stdin,
            MultiCloser::new(),
            SESSION_ADDR,
            SESSION_ADDR,
        );

        let transfer = async {
            let result = protocol.execute(command, conn).await;
            if let Err(e) = &result {
                error!("Transfer failed: {}", e);
            }
            result
        };
        let remote = async {
            server.exec(shell_command).await?;
            server.wait().await
        };

        let (transfer_result, remote_result) = tokio::join!(transfer, remote);
        let _ = server.close();

        let outcome = match transfer_result {
            Ok(()) => remote_result,
            Err(e) => Err(e),
        };
        match outcome {
            Err(e) if e.is_eof() => Ok(()),
            outcome => outcome,
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}
