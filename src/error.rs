//! Error taxonomy for relay, node and session operations.
//!
//! Errors fall into a handful of categories that callers branch on:
//!
//! 1. **Rejections** ([`Error::AuthRejected`], [`Error::Credential`]): a single
//!    credential did not get us in. The credential trial loop moves on to the
//!    next method; these are never shown to the user directly.
//!
//! 2. **Terminal outcomes** ([`Error::AccessDenied`], [`Error::Routing`],
//!    [`Error::NotFound`], [`Error::Timeout`]): surfaced as-is to the user.
//!
//! 3. **Transport failures** ([`Error::Transport`], [`Error::Io`]): anything
//!    else that went wrong opening sessions, sub-services or dialing. Fatal and
//!    propagated immediately. Only the initial relay dial inspects them with
//!    [`Error::is_retryable`] to decide whether another attempt makes sense.
//!
//! # Priority
//!
//! Authentication failures take precedence over connection failures when
//! classifying a transport message: an error mentioning both is never retried,
//! to avoid hammering the relay with bad credentials.

use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The relay refused to route to the destination.
    #[error("failed connecting to cluster {cluster}: {reason}")]
    Routing { cluster: String, reason: String },

    /// The node refused one specific authentication method.
    #[error("{method} authentication rejected")]
    AuthRejected { method: String },

    /// A credential could not even be offered (unreadable key, empty agent).
    #[error("{method} credential unusable: {reason}")]
    Credential { method: String, reason: String },

    /// Every configured authentication method was rejected.
    #[error("access denied to login \"{login}\" when connecting to {target}")]
    AccessDenied { login: String, target: String },

    #[error("{0}")]
    NotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("host key verification failed for {host}: {reason}")]
    HostKey { host: String, reason: String },

    #[error("remote command exited with status {0}")]
    ExitStatus(u32),

    #[error("remote command exited without reporting a status")]
    ExitMissing,

    #[error("control API error: {0}")]
    Control(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed response: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<russh::keys::Error> for Error {
    fn from(err: russh::keys::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Message fragments that identify an authentication failure.
///
/// A transport message containing any of these is never retried.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "authentication rejected",
    "permission denied",
    "access denied",
    "publickey",
    "no authentication",
    "all authentication methods failed",
];

/// Message fragments that identify transient connection failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "failed to connect",
    "broken pipe",
];

impl Error {
    /// Whether this error means "this credential did not work, try the next one".
    ///
    /// Anything else aborts the credential trial loop.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::AuthRejected { .. } | Error::Credential { .. })
    }

    /// Whether a failed relay dial is worth another attempt.
    ///
    /// Authentication outcomes, host-key mismatches and malformed input are
    /// permanent. I/O and timeouts are transient. Transport messages are
    /// matched against known patterns, auth patterns first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput
            ),
            Error::Transport(message) => is_retryable_message(message),
            _ => false,
        }
    }

    /// Whether this error is a clean end-of-stream.
    pub fn is_eof(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

/// Classify a free-form transport message as transient or permanent.
fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();

    if AUTH_ERRORS.iter().any(|pattern| lower.contains(pattern)) {
        return false;
    }

    RETRYABLE_ERRORS.iter().any(|pattern| lower.contains(pattern))
}
