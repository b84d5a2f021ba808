//! Local port forwarding through a node.
//!
//! # Architecture
//!
//! 1. **Accept loop**: [`serve_forwarding`] accepts local TCP connections
//!    until the listener fails, then releases the listener and closes the
//!    node connection.
//!
//! 2. **Per-connection task**: every accepted connection dials the remote
//!    address through the node's transport, retrying with a linear backoff
//!    (100ms, 200ms, ...) for at most [`FORWARD_DIAL_ATTEMPTS`] attempts. A
//!    connection that cannot be dialed is dropped on its own; the accept loop
//!    keeps serving.
//!
//! 3. **Bidirectional copy**: both directions run concurrently and each one
//!    half-closes its destination when its source ends. The connection is
//!    torn down only after both directions have finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{BackoffBuilder, Retryable};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

use crate::config::{FORWARD_BACKOFF_STEP, FORWARD_DIAL_ATTEMPTS};
use crate::conn::VirtualConnection;
use crate::error::Result;
use crate::node::NodeClient;
use crate::transport::Transport;

/// Delays of `step × n` between attempts `n` and `n + 1`.
#[derive(Debug, Clone, Copy)]
pub struct LinearBuilder {
    step: Duration,
    max_times: u32,
}

impl LinearBuilder {
    pub fn new(step: Duration, max_times: u32) -> Self {
        Self { step, max_times }
    }
}

#[derive(Debug)]
pub struct LinearBackoff {
    step: Duration,
    attempt: u32,
    max_times: u32,
}

impl Iterator for LinearBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_times {
            return None;
        }
        self.attempt += 1;
        Some(self.step * self.attempt)
    }
}

impl BackoffBuilder for LinearBuilder {
    type Backoff = LinearBackoff;

    fn build(self) -> Self::Backoff {
        LinearBackoff {
            step: self.step,
            attempt: 0,
            max_times: self.max_times,
        }
    }
}

/// Accept local connections and forward each one to `remote` through `node`.
///
/// Returns when the listener fails; the node connection is closed on the way
/// out.
pub async fn serve_forwarding(listener: TcpListener, node: Arc<NodeClient>, remote: String) {
    let transport = node.transport().clone();
    let remote: Arc<str> = Arc::from(remote);

    if let Ok(local) = listener.local_addr() {
        debug!("Forwarding {} -> {}", local, remote);
    }

    loop {
        match listener.accept().await {
            Ok((incoming, peer)) => {
                debug!("New connection from {} to forwarded port", peer);
                let transport = transport.clone();
                let remote = remote.clone();
                tokio::spawn(async move {
                    forward_connection(transport, incoming, &remote).await;
                });
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                break;
            }
        }
    }

    drop(listener);
    if let Err(e) = node.close().await {
        debug!("Closing node connection: {}", e);
    }
}

/// Dial `remote`, retrying with a linear backoff.
pub(crate) async fn dial_with_retry(
    transport: &dyn Transport,
    remote: &str,
) -> Result<VirtualConnection> {
    let attempt_counter = AtomicU32::new(0);

    let result = (|| async {
        attempt_counter.fetch_add(1, Ordering::SeqCst);
        transport.dial(remote).await
    })
    .retry(LinearBuilder::new(
        FORWARD_BACKOFF_STEP,
        FORWARD_DIAL_ATTEMPTS.saturating_sub(1),
    ))
    .notify(|err, dur| {
        warn!("Dial to {} failed: {}. Retrying in {:?}", remote, err, dur);
    })
    .await;

    if let Err(e) = &result {
        warn!(
            "Dial to {} failed after {} attempt(s): {}",
            remote,
            attempt_counter.load(Ordering::SeqCst),
            e
        );
    }
    result
}

async fn forward_connection(transport: Arc<dyn Transport>, incoming: TcpStream, remote: &str) {
    let peer = incoming
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    debug!("Forwarding {} -> {} started", peer, remote);

    let outgoing = match dial_with_retry(transport.as_ref(), remote).await {
        Ok(conn) => conn,
        Err(e) => {
            error!("Failed to connect to {}: {}", remote, e);
            return;
        }
    };

    let (local_read, local_write) = incoming.into_split();
    let (remote_read, remote_write, closer) = outgoing.into_parts();

    tokio::join!(
        pipe(local_read, remote_write, "local to remote"),
        pipe(remote_read, local_write, "remote to local"),
    );

    if let Err(e) = closer.close() {
        debug!("Closing forwarded channel: {}", e);
    }
    debug!("Forwarding {} -> {} exited", peer, remote);
}

/// Copy until `from` ends, then half-close `to`.
async fn pipe<R, W>(mut from: R, mut to: W, direction: &str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Err(e) = tokio::io::copy(&mut from, &mut to).await {
        debug!("{} copy ended: {}", direction, e);
    }
    let _ = to.shutdown().await;
}
