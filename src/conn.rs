//! Virtual connections over pairs of pipes.
//!
//! Higher layers (the node handshake, HTTP to the control endpoint, the
//! port-forward relay) want "a connection": something that reads, writes,
//! closes and reports its endpoints. What a logical SSH session actually hands
//! us is a read pipe, a write pipe and a way to tear the session down.
//! [`VirtualConnection`] glues those together without buffering or framing.
//!
//! The endpoint addresses are placeholders for logging only. Nothing may route
//! on them.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

/// Boxed read half of a virtual connection.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a virtual connection.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Something that releases a resource when a connection is closed.
pub trait Closer: Send + Sync {
    fn close(&self) -> io::Result<()>;
}

/// A closer that does nothing.
pub struct NopCloser;

impl Closer for NopCloser {
    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

impl Closer for CancellationToken {
    fn close(&self) -> io::Result<()> {
        self.cancel();
        Ok(())
    }
}

/// Closes several resources in sequence.
///
/// Every closer runs even if an earlier one fails; the first error is
/// returned.
#[derive(Default)]
pub struct MultiCloser {
    closers: Vec<Box<dyn Closer>>,
}

impl MultiCloser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, closer: impl Closer + 'static) -> Self {
        self.closers.push(Box::new(closer));
        self
    }

    pub fn len(&self) -> usize {
        self.closers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closers.is_empty()
    }
}

impl Closer for MultiCloser {
    fn close(&self) -> io::Result<()> {
        let mut first_error = None;
        for closer in &self.closers {
            if let Err(e) = closer.close()
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A duplex connection assembled from a reader, a writer and a closer.
pub struct VirtualConnection {
    reader: BoxReader,
    writer: BoxWriter,
    closer: Box<dyn Closer>,
    local_addr: String,
    remote_addr: String,
}

impl VirtualConnection {
    pub fn new(
        reader: BoxReader,
        writer: BoxWriter,
        closer: impl Closer + 'static,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            reader,
            writer,
            closer: Box::new(closer),
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
        }
    }

    /// Wrap an existing duplex stream. Closing only shuts down the stream's
    /// write side when dropped; the supplied closer handles the rest.
    pub fn from_stream<S>(
        stream: S,
        closer: impl Closer + 'static,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(
            Box::new(reader),
            Box::new(writer),
            closer,
            local_addr,
            remote_addr,
        )
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Release the underlying resources.
    pub fn close(&self) -> io::Result<()> {
        self.closer.close()
    }

    /// Split into independently owned halves plus the closer.
    pub fn into_parts(self) -> (BoxReader, BoxWriter, Box<dyn Closer>) {
        (self.reader, self.writer, self.closer)
    }
}

impl fmt::Debug for VirtualConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualConnection")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for VirtualConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for VirtualConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}
