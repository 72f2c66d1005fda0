//! Tape status probing and staging.
//!
//! The archive's listing command prints one line per path ending with a
//! bracketed status token, e.g.
//!
//! ```text
//! -rw-r--r-- 1 svc svc 5368709120 2024-05-01 12:00 (DUL) ABC_Camera_....tar.gz
//! ```
//!
//! Status is derived at query time and never cached beyond one job.

use crate::{
    errors::{ArchiveError, ArchiveResult},
    models::bundle::BUNDLE_SUFFIX,
    services::transport::{CommandClient, shell_quote},
};
use std::fmt;

/// Tokens meaning the bytes are readable from disk: regular (in place),
/// dual-state (migrated but cached), partial (cache resident),
/// non-migratable and migrating (queued).
pub const ONLINE_TOKENS: [&str; 5] = ["(REG)", "(DUL)", "(PAR)", "(NMG)", "(MIG)"];

/// Token for a file currently being restored from tape.
pub const STAGING_TOKEN: &str = "(UNM)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeStatus {
    Online,
    Staging,
    OfflineUnknown,
}

impl fmt::Display for TapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TapeStatus::Online => "online",
            TapeStatus::Staging => "staging",
            TapeStatus::OfflineUnknown => "offline",
        };
        f.write_str(s)
    }
}

/// Result of one listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Found(TapeStatus),
    NotFound,
}

pub fn classify_token(token: &str) -> TapeStatus {
    if ONLINE_TOKENS.contains(&token) {
        TapeStatus::Online
    } else if token == STAGING_TOKEN {
        TapeStatus::Staging
    } else {
        TapeStatus::OfflineUnknown
    }
}

/// Find the status token on the last non-empty line of listing output.
///
/// The token is the last bracketed word on the line; older listings put it
/// last, newer ones put the filename after it.
pub fn status_token(listing: &str) -> Option<&str> {
    let line = listing.lines().rev().find(|l| !l.trim().is_empty())?;
    line.split_whitespace()
        .rev()
        .find(|w| w.len() > 2 && w.starts_with('(') && w.ends_with(')'))
}

/// Map listing output to a status. Output with no token is `OfflineUnknown`.
pub fn parse_listing(listing: &str) -> TapeStatus {
    status_token(listing).map_or(TapeStatus::OfflineUnknown, classify_token)
}

/// Remote commands used to talk to the tape library.
#[derive(Debug, Clone)]
pub struct TapeCommands {
    pub list_cmd: String,
    pub stage_cmd: String,
}

impl TapeCommands {
    pub fn list(&self, path: &str) -> String {
        format!("{} {}", self.list_cmd, shell_quote(path))
    }

    pub fn stage(&self, path: &str) -> String {
        format!("{} {}", self.stage_cmd, shell_quote(path))
    }

    /// Query the status of one remote path.
    pub async fn probe<C>(&self, client: &mut C, path: &str) -> ArchiveResult<Probe>
    where
        C: CommandClient + ?Sized,
    {
        let output = client.exec(&self.list(path)).await?;
        let token = status_token(&output.stdout);
        if !output.success() && token.is_none() {
            tracing::debug!(path, status = output.status, "listing found no entry");
            return Ok(Probe::NotFound);
        }
        let status = token.map_or(TapeStatus::OfflineUnknown, classify_token);
        tracing::debug!(path, token = ?token, %status, "probed tape status");
        Ok(Probe::Found(status))
    }

    /// Probe the suffixed bundle path, falling back to the unsuffixed one.
    /// Returns the path that exists together with its status.
    pub async fn probe_bundle<C>(
        &self,
        client: &mut C,
        remote_path: &str,
    ) -> ArchiveResult<(String, TapeStatus)>
    where
        C: CommandClient + ?Sized,
    {
        let (suffixed, bare) = bundle_path_forms(remote_path);
        for candidate in [suffixed, bare] {
            if let Probe::Found(status) = self.probe(client, &candidate).await? {
                return Ok((candidate, status));
            }
        }
        Err(ArchiveError::RemoteNotFound(remote_path.to_string()))
    }

    /// Bring a bundle online, staging it from tape at most once.
    ///
    /// Finding the bundle already `Staging` before this call requested
    /// anything yields [`ArchiveError::AlreadyStaging`] without issuing a
    /// stage command.
    pub async fn ensure_online<C>(&self, client: &mut C, remote_path: &str) -> ArchiveResult<String>
    where
        C: CommandClient + ?Sized,
    {
        let (path, status) = self.probe_bundle(client, remote_path).await?;
        match status {
            TapeStatus::Online => {
                tracing::info!(path = %path, "bundle online");
                return Ok(path);
            }
            TapeStatus::Staging => {
                tracing::info!(path = %path, "bundle already staging, backing off");
                return Err(ArchiveError::AlreadyStaging(path));
            }
            TapeStatus::OfflineUnknown => {}
        }

        tracing::info!(path = %path, "bundle offline, requesting stage");
        let output = client.exec(&self.stage(&path)).await?;
        if !output.success() {
            tracing::warn!(
                path = %path,
                status = output.status,
                stderr = %output.stderr.trim(),
                "stage request returned nonzero"
            );
        }

        let status = match self.probe(client, &path).await? {
            Probe::Found(status) => status,
            Probe::NotFound => return Err(ArchiveError::RemoteNotFound(path)),
        };
        if status == TapeStatus::Online {
            tracing::info!(path = %path, outcome = "ok", "bundle staged");
            Ok(path)
        } else {
            tracing::warn!(path = %path, %status, outcome = "failed", "bundle not online after staging");
            Err(ArchiveError::StagingFailed {
                path,
                status: status.to_string(),
            })
        }
    }
}

/// The suffixed and unsuffixed forms of a bundle path.
pub fn bundle_path_forms(remote_path: &str) -> (String, String) {
    match remote_path.strip_suffix(BUNDLE_SUFFIX) {
        Some(bare) => (remote_path.to_string(), bare.to_string()),
        None => (format!("{remote_path}{BUNDLE_SUFFIX}"), remote_path.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::transport::CommandOutput;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Replays canned outputs and records every command issued.
    #[derive(Default)]
    struct Scripted {
        replies: VecDeque<CommandOutput>,
        issued: Vec<String>,
    }

    impl Scripted {
        fn reply(mut self, status: u32, stdout: &str) -> Self {
            self.replies.push_back(CommandOutput {
                status,
                stdout: stdout.into(),
                stderr: String::new(),
            });
            self
        }
    }

    #[async_trait]
    impl CommandClient for Scripted {
        async fn exec(&mut self, command: &str) -> ArchiveResult<CommandOutput> {
            self.issued.push(command.to_string());
            Ok(self.replies.pop_front().unwrap_or_default())
        }
    }

    fn commands() -> TapeCommands {
        TapeCommands {
            list_cmd: "dmls -l".into(),
            stage_cmd: "dmget".into(),
        }
    }

    const PATH: &str = "/tape/archive/b.tar.gz";

    #[test]
    fn classifies_known_tokens() {
        assert_eq!(classify_token("(REG)"), TapeStatus::Online);
        assert_eq!(classify_token("(DUL)"), TapeStatus::Online);
        assert_eq!(classify_token("(UNM)"), TapeStatus::Staging);
        assert_eq!(classify_token("(XYZ)"), TapeStatus::OfflineUnknown);
        assert_eq!(classify_token("(OFL)"), TapeStatus::OfflineUnknown);
    }

    #[test]
    fn parses_captured_listing_lines() {
        let trailing = "-rw-r--r--  1 svc grp 6442450944 May  1 12:00 b.tar.gz (REG)\n";
        assert_eq!(parse_listing(trailing), TapeStatus::Online);

        let before_name = "header\n-rw-r--r-- 1 svc grp 6442450944 2024-05-01 12:00 (UNM) b.tar.gz\n\n";
        assert_eq!(parse_listing(before_name), TapeStatus::Staging);

        assert_eq!(parse_listing("-rw-r--r-- b.tar.gz (OFL)"), TapeStatus::OfflineUnknown);
        assert_eq!(parse_listing(""), TapeStatus::OfflineUnknown);
    }

    #[test]
    fn path_forms_with_and_without_suffix() {
        assert_eq!(
            bundle_path_forms("/t/b.tar.gz"),
            ("/t/b.tar.gz".to_string(), "/t/b".to_string())
        );
        assert_eq!(
            bundle_path_forms("/t/b"),
            ("/t/b.tar.gz".to_string(), "/t/b".to_string())
        );
    }

    #[tokio::test]
    async fn online_bundle_needs_no_stage() {
        let mut client = Scripted::default().reply(0, "x b.tar.gz (DUL)");
        let path = commands().ensure_online(&mut client, PATH).await.unwrap();
        assert_eq!(path, PATH);
        assert_eq!(client.issued, ["dmls -l /tape/archive/b.tar.gz"]);
    }

    #[tokio::test]
    async fn staging_on_first_probe_raises_without_stage_request() {
        let mut client = Scripted::default().reply(0, "x b.tar.gz (UNM)");
        let err = commands().ensure_online(&mut client, PATH).await.unwrap_err();
        assert!(matches!(err, ArchiveError::AlreadyStaging(_)));
        assert!(client.issued.iter().all(|c| !c.starts_with("dmget")));
    }

    #[tokio::test]
    async fn offline_bundle_is_staged_then_reprobed() {
        let mut client = Scripted::default()
            .reply(0, "x b.tar.gz (OFL)")
            .reply(0, "")
            .reply(0, "x b.tar.gz (DUL)");
        commands().ensure_online(&mut client, PATH).await.unwrap();
        assert_eq!(
            client.issued,
            [
                "dmls -l /tape/archive/b.tar.gz",
                "dmget /tape/archive/b.tar.gz",
                "dmls -l /tape/archive/b.tar.gz",
            ]
        );
    }

    #[tokio::test]
    async fn still_offline_after_stage_fails_attempt() {
        let mut client = Scripted::default()
            .reply(0, "x (OFL)")
            .reply(0, "")
            .reply(0, "x (UNM)");
        let err = commands().ensure_online(&mut client, PATH).await.unwrap_err();
        assert!(matches!(err, ArchiveError::StagingFailed { .. }));
        assert!(err.retry_signal().is_none());
    }

    #[tokio::test]
    async fn falls_back_to_unsuffixed_name() {
        let mut client = Scripted::default()
            .reply(1, "")
            .reply(0, "x b (REG)");
        let path = commands().ensure_online(&mut client, PATH).await.unwrap();
        assert_eq!(path, "/tape/archive/b");
    }

    #[tokio::test]
    async fn missing_under_both_names_is_not_found() {
        let mut client = Scripted::default().reply(1, "").reply(1, "");
        let err = commands().ensure_online(&mut client, PATH).await.unwrap_err();
        assert!(matches!(err, ArchiveError::RemoteNotFound(_)));
    }
}
