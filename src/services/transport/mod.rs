//! Remote transport to an archive host.
//!
//! One SSH session serves three protocols, each behind its own trait:
//! - [`CommandClient`]: shell command execution
//! - [`DirClient`]: SFTP, used only for `mkdir -p`
//! - [`TransferClient`]: SCP file copy
//!
//! Sessions are never shared between jobs; every job connects through a
//! [`Connector`] and must [`Remote::close`] the session on every exit path.

pub mod scp;
pub mod ssh;

use crate::{
    errors::{ArchiveError, ArchiveResult},
    models::archive::Archive,
};
use async_trait::async_trait;
use std::path::Path;

/// Exit status and captured output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: u32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a nonzero exit into [`ArchiveError::CommandFailed`].
    pub fn check(self, command: &str) -> ArchiveResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(ArchiveError::CommandFailed {
                command: command.to_string(),
                status: self.status,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

#[async_trait]
pub trait CommandClient: Send {
    async fn exec(&mut self, command: &str) -> ArchiveResult<CommandOutput>;
}

#[async_trait]
pub trait DirClient: Send {
    /// Create `path` and any missing ancestors.
    async fn mkdir_p(&mut self, path: &str) -> ArchiveResult<()>;
}

#[async_trait]
pub trait TransferClient: Send {
    /// Copy a local file to `remote`. Returns bytes sent.
    async fn upload(&mut self, local: &Path, remote: &str) -> ArchiveResult<u64>;

    /// Copy `remote` to a local file. Returns bytes received.
    async fn download(&mut self, remote: &str, local: &Path) -> ArchiveResult<u64>;
}

/// A full session: all three clients plus teardown.
#[async_trait]
pub trait Remote: CommandClient + DirClient + TransferClient {
    async fn close(&mut self);
}

/// Opens a fresh [`Remote`] session per job.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Remote;

    async fn connect(&self, archive: &Archive) -> ArchiveResult<Self::Session>;
}

/// Quote a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"/._-+:,=@".contains(&b))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Parent directory of a remote path (`/` for top-level entries).
pub fn remote_parent(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Logs transfer progress at each 10% step.
pub struct TransferProgress<'a> {
    name: &'a str,
    total: u64,
    done: u64,
    next_decile: u64,
}

impl<'a> TransferProgress<'a> {
    pub fn new(name: &'a str, total: u64) -> Self {
        Self {
            name,
            total,
            done: 0,
            next_decile: 1,
        }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.done += bytes;
        if self.total == 0 {
            return;
        }
        while self.next_decile <= 10 && self.done * 10 >= self.total * self.next_decile {
            tracing::info!(
                file = self.name,
                transferred = self.done,
                total = self.total,
                "transfer {}% complete",
                self.next_decile * 10
            );
            self.next_decile += 1;
        }
    }

    pub fn reported_deciles(&self) -> u64 {
        self.next_decile - 1
    }
}
