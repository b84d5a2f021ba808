//! Capabilities the client needs from the secured transport.
//!
//! The relay and node clients never talk to russh directly. They depend on
//! three small traits:
//!
//! - [`Transport`]: an established, authenticated connection that can open
//!   logical sessions and dial TCP targets.
//! - [`RemoteSession`]: one logical session channel with its three byte
//!   streams and the requests defined on it.
//! - [`Connector`]: runs the secured handshake over an arbitrary
//!   [`VirtualConnection`] with exactly one authentication method.
//!
//! [`ssh`] binds them to russh. Tests substitute in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::AuthStrategy;
use crate::conn::{BoxReader, BoxWriter, Closer, VirtualConnection};
use crate::error::Result;
use crate::hostkey::HostKeyPolicy;

pub mod ssh;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

impl TerminalSize {
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(80, 25)
    }
}

/// An established secured connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new logical session channel.
    async fn open_session(&self) -> Result<Arc<dyn RemoteSession>>;

    /// Open a TCP tunnel to `address` (`host:port`) from the far end.
    async fn dial(&self, address: &str) -> Result<VirtualConnection>;

    /// Tear down the connection and every channel derived from it.
    async fn close(&self) -> Result<()>;
}

/// One logical session channel.
///
/// The three streams can each be taken once. Requests are answered in the
/// order they were sent.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn take_stdin(&self) -> Option<BoxWriter>;

    fn take_stdout(&self) -> Option<BoxReader>;

    fn take_stderr(&self) -> Option<BoxReader>;

    /// Start a named sub-service on this session.
    async fn request_subsystem(&self, name: &str) -> Result<()>;

    async fn set_env(&self, name: &str, value: &str) -> Result<()>;

    /// Allocate a server-side pseudo-terminal.
    async fn request_pty(&self, term: &str, size: TerminalSize) -> Result<()>;

    async fn shell(&self) -> Result<()>;

    async fn exec(&self, command: &str) -> Result<()>;

    /// Tell the remote pseudo-terminal its window changed.
    async fn window_change(&self, size: TerminalSize) -> Result<()>;

    /// Wait for the session to end and report the remote exit status.
    async fn wait(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Closes a session as part of a [`crate::conn::MultiCloser`].
pub struct SessionCloser(pub Arc<dyn RemoteSession>);

impl Closer for SessionCloser {
    fn close(&self) -> std::io::Result<()> {
        self.0.close().map_err(std::io::Error::other)
    }
}

/// Everything the handshake needs to know about the destination.
pub struct HandshakeTarget<'a> {
    /// Address as the relay knows it: `host[:port]` or `@cluster`.
    pub address: &'a str,
    pub login: &'a str,
    pub host_key_policy: &'a HostKeyPolicy,
}

/// Runs the secured handshake over a virtual connection.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Negotiate using only `method`.
    ///
    /// Returns [`crate::Error::AuthRejected`] (or
    /// [`crate::Error::Credential`]) when the method itself was refused, and
    /// any other error for transport or protocol failures.
    async fn connect(
        &self,
        conn: VirtualConnection,
        target: &HandshakeTarget<'_>,
        method: &dyn AuthStrategy,
    ) -> Result<Arc<dyn Transport>>;
}

/// Opens tunnelled connections on behalf of an external client.
///
/// Holding a dialer keeps the underlying transport alive.
#[derive(Clone)]
pub struct Dialer {
    transport: Arc<dyn Transport>,
}

impl Dialer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn dial(&self, address: &str) -> Result<VirtualConnection> {
        self.transport.dial(address).await
    }
}

/// Cluster named by a destination address: whatever follows the last `@`.
pub(crate) fn cluster_name(address: &str) -> &str {
    address.rsplit('@').next().unwrap_or(address)
}

/// A destination address without its `@cluster` suffix.
///
/// A bare `@cluster` control endpoint is returned unchanged.
pub(crate) fn strip_cluster(address: &str) -> &str {
    match address.split('@').next() {
        Some(host) if !host.is_empty() => host,
        _ => address,
    }
}

/// Whether `address` names a cluster control endpoint rather than a node.
pub(crate) fn is_cluster_endpoint(address: &str) -> bool {
    address.starts_with('@')
}
