//! File transfer command shape.
//!
//! The byte-level copy protocol lives outside this crate behind
//! [`TransferProtocol`]. What is defined here is the local half of the
//! conversation ([`ScpCommand`]) and the remote invocation that pairs with it.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::conn::VirtualConnection;
use crate::error::Result;

/// Program the remote end runs to take part in a transfer.
pub const REMOTE_SCP: &str = "/usr/bin/scp";

/// The local side of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScpCommand {
    /// We send files (upload).
    pub source: bool,
    /// We receive files (download).
    pub sink: bool,
    pub recursive: bool,
    pub target_is_dir: bool,
    /// Local path read from or written to.
    pub target: PathBuf,
}

impl ScpCommand {
    pub fn upload(local: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self {
            source: true,
            recursive: is_dir,
            target_is_dir: is_dir,
            target: local.into(),
            ..Default::default()
        }
    }

    pub fn download(local: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self {
            sink: true,
            recursive: is_dir,
            target_is_dir: is_dir,
            target: local.into(),
            ..Default::default()
        }
    }

    /// The remote command that talks to this one over the session.
    ///
    /// When we are the source the remote end receives (`-t`), otherwise it
    /// sends (`-f`).
    pub fn remote_command(&self, remote_path: &str) -> String {
        let mut command = String::from(REMOTE_SCP);
        command.push_str(if self.source { " -t" } else { " -f" });
        if self.recursive {
            command.push_str(" -r");
        }
        command.push(' ');
        command.push_str(remote_path);
        command
    }
}

/// Drives the copy protocol over an established session stream.
#[async_trait]
pub trait TransferProtocol: Send + Sync {
    async fn execute(&self, command: &ScpCommand, conn: VirtualConnection) -> Result<()>;
}
