//! `russh`-backed implementation of the remote transport.

use super::{
    CommandClient, CommandOutput, Connector, DirClient, Remote, TransferClient, remote_parent, scp,
};
use crate::{
    errors::{ArchiveError, ArchiveResult},
    models::archive::Archive,
};
use async_trait::async_trait;
use russh::{
    ChannelMsg, Disconnect, client,
    keys::{
        PrivateKey, PrivateKeyWithHashAlg,
        known_hosts::{known_host_keys_path, learn_known_hosts_path},
        load_secret_key, ssh_key,
    },
};
use russh_sftp::{client::SftpSession, protocol::StatusCode};
use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Connection timeout for SSH handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Inactivity timeout for established SSH sessions.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Attempts per command before a transport error is surfaced.
pub const EXEC_ATTEMPTS: u32 = 3;

/// Longest a file transfer may sit without making progress.
pub const TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Parameters needed to (re-)establish a session.
#[derive(Clone)]
struct ConnectParams {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    key_path: Option<PathBuf>,
    known_hosts_path: PathBuf,
}

/// SSH client handler that enforces known-host checks (TOFU).
struct HostKeyCheck {
    host: String,
    port: u16,
    known_hosts_path: PathBuf,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        match verify_or_learn_host_key(
            &self.host,
            self.port,
            &self.known_hosts_path,
            server_public_key,
        ) {
            Ok(HostKeyState::Matched) => Ok(true),
            Ok(HostKeyState::Learned) => {
                tracing::warn!(
                    host = %self.host,
                    port = self.port,
                    known_hosts = %self.known_hosts_path.display(),
                    "learned new SSH host key via TOFU"
                );
                Ok(true)
            }
            Err(e) => {
                tracing::error!(
                    host = %self.host,
                    port = self.port,
                    "SSH host key verification failed: {e}"
                );
                Err(e)
            }
        }
    }
}

enum HostKeyState {
    Matched,
    Learned,
}

/// Opens one [`RemoteSession`] per call.
#[derive(Clone)]
pub struct SshConnector {
    known_hosts_path: PathBuf,
}

impl SshConnector {
    pub fn new(known_hosts_path: Option<&str>) -> ArchiveResult<Self> {
        Ok(Self {
            known_hosts_path: resolve_known_hosts_path(known_hosts_path)?,
        })
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Session = RemoteSession;

    async fn connect(&self, archive: &Archive) -> ArchiveResult<RemoteSession> {
        let params = ConnectParams {
            host: archive.address.clone(),
            port: archive.port,
            user: archive.username.clone(),
            password: archive.password.clone(),
            key_path: archive.key_path.as_deref().map(expand_tilde_path),
            known_hosts_path: self.known_hosts_path.clone(),
        };
        RemoteSession::open(params).await
    }
}

/// One authenticated SSH session. The SFTP subsystem is opened lazily and
/// kept for the lifetime of the session.
pub struct RemoteSession {
    params: ConnectParams,
    handle: Option<client::Handle<HostKeyCheck>>,
    sftp: Option<SftpSession>,
}

impl RemoteSession {
    async fn open(params: ConnectParams) -> ArchiveResult<Self> {
        let handle = connect(&params).await?;
        tracing::info!(host = %params.host, user = %params.user, "SSH session established");
        Ok(Self {
            params,
            handle: Some(handle),
            sftp: None,
        })
    }

    fn handle(&self) -> ArchiveResult<&client::Handle<HostKeyCheck>> {
        self.handle
            .as_ref()
            .ok_or_else(|| ArchiveError::Transport("session is closed".into()))
    }

    fn is_closed(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_closed())
    }

    async fn reconnect(&mut self) -> ArchiveResult<()> {
        self.sftp = None;
        if let Some(old) = self.handle.take() {
            let _ = old.disconnect(Disconnect::ByApplication, "", "en").await;
        }
        tracing::info!(host = %self.params.host, "reconnecting SSH session");
        self.handle = Some(connect(&self.params).await?);
        Ok(())
    }

    async fn ensure_connected(&mut self) -> ArchiveResult<()> {
        if self.is_closed() {
            self.reconnect().await?;
        }
        Ok(())
    }

    async fn sftp(&mut self) -> ArchiveResult<&SftpSession> {
        self.ensure_connected().await?;
        if self.sftp.is_none() {
            let handle = self.handle()?;
            let channel = handle
                .channel_open_session()
                .await
                .map_err(|e| ArchiveError::transport("open sftp channel", e))?;
            channel
                .request_subsystem(true, "sftp")
                .await
                .map_err(|e| ArchiveError::transport("request sftp subsystem", e))?;
            let sftp = SftpSession::new(channel.into_stream())
                .await
                .map_err(|e| ArchiveError::transport("sftp session init", e))?;
            self.sftp = Some(sftp);
        }
        self.sftp
            .as_ref()
            .ok_or_else(|| ArchiveError::Transport("sftp session unavailable".into()))
    }
}

/// A command connection that can be torn down and opened again.
#[async_trait]
trait Resubmit: Send {
    fn is_down(&self) -> bool;
    async fn reopen(&mut self) -> ArchiveResult<()>;
    async fn run_once(&mut self, command: &str) -> ArchiveResult<CommandOutput>;
}

#[async_trait]
impl Resubmit for RemoteSession {
    fn is_down(&self) -> bool {
        self.is_closed()
    }

    async fn reopen(&mut self) -> ArchiveResult<()> {
        self.reconnect().await
    }

    async fn run_once(&mut self, command: &str) -> ArchiveResult<CommandOutput> {
        run_command(self.handle()?, command).await
    }
}

/// Run `command`, reconnecting and resubmitting up to [`EXEC_ATTEMPTS`]
/// times in total. The last error is returned once attempts run out.
async fn exec_with_retry<R: Resubmit + ?Sized>(
    conn: &mut R,
    command: &str,
) -> ArchiveResult<CommandOutput> {
    let mut last_err = None;
    for attempt in 1..=EXEC_ATTEMPTS {
        if attempt > 1 || conn.is_down() {
            if let Err(err) = conn.reopen().await {
                tracing::warn!(attempt, command, "reconnect failed: {err}");
                last_err = Some(err);
                continue;
            }
        }

        match conn.run_once(command).await {
            Ok(output) => {
                tracing::debug!(command, status = output.status, "remote command finished");
                return Ok(output);
            }
            Err(err) => {
                tracing::warn!(
                    attempt,
                    max_attempts = EXEC_ATTEMPTS,
                    command,
                    "remote command failed: {err}"
                );
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| ArchiveError::Transport(format!("`{command}` not sent"))))
}

#[async_trait]
impl CommandClient for RemoteSession {
    async fn exec(&mut self, command: &str) -> ArchiveResult<CommandOutput> {
        exec_with_retry(self, command).await
    }
}

#[async_trait]
impl DirClient for RemoteSession {
    async fn mkdir_p(&mut self, path: &str) -> ArchiveResult<()> {
        let sftp = self.sftp().await?;
        let missing = missing_ancestors(path, |dir| async move {
            match sftp.metadata(dir).await {
                Ok(_) => Ok(true),
                Err(e) if is_not_found(&e) => Ok(false),
                Err(e) => Err(ArchiveError::transport("sftp stat", e)),
            }
        })
        .await?;

        for dir in missing.iter().rev() {
            sftp.create_dir(dir.as_str())
                .await
                .map_err(|e| ArchiveError::transport(&format!("sftp mkdir {dir}"), e))?;
            tracing::debug!(dir = %dir, "created remote directory");
        }
        Ok(())
    }
}

#[async_trait]
impl TransferClient for RemoteSession {
    async fn upload(&mut self, local: &Path, remote: &str) -> ArchiveResult<u64> {
        self.ensure_connected().await?;
        let channel = self
            .handle()?
            .channel_open_session()
            .await
            .map_err(|e| ArchiveError::transport("open scp channel", e))?;
        channel
            .exec(true, scp::sink_command(remote))
            .await
            .map_err(|e| ArchiveError::transport("start scp sink", e))?;
        let mut stream = channel.into_stream();
        let sent = scp::send_file(&mut stream, local, TRANSFER_IDLE_TIMEOUT).await?;
        tracing::info!(local = %local.display(), remote, bytes = sent, "upload complete");
        Ok(sent)
    }

    async fn download(&mut self, remote: &str, local: &Path) -> ArchiveResult<u64> {
        self.ensure_connected().await?;
        let channel = self
            .handle()?
            .channel_open_session()
            .await
            .map_err(|e| ArchiveError::transport("open scp channel", e))?;
        channel
            .exec(true, scp::source_command(remote))
            .await
            .map_err(|e| ArchiveError::transport("start scp source", e))?;
        let mut stream = channel.into_stream();
        let received = scp::receive_file(&mut stream, local, TRANSFER_IDLE_TIMEOUT).await?;
        tracing::debug!(remote, local = %local.display(), bytes = received, "download complete");
        Ok(received)
    }
}

#[async_trait]
impl Remote for RemoteSession {
    async fn close(&mut self) {
        self.sftp = None;
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
                tracing::debug!(host = %self.params.host, "disconnect failed: {err}");
            }
            tracing::info!(host = %self.params.host, "SSH session closed");
        }
    }
}

/// Walk from `path` towards the root until an existing directory is found.
/// Returns the missing directories leaf first.
pub async fn missing_ancestors<F, Fut>(path: &str, mut exists: F) -> ArchiveResult<Vec<String>>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = ArchiveResult<bool>>,
{
    let mut missing = Vec::new();
    let mut current = path.trim_end_matches('/').to_string();
    while !current.is_empty() && current != "/" {
        if exists(current.clone()).await? {
            break;
        }
        let parent = remote_parent(&current).to_string();
        missing.push(current);
        current = parent;
    }
    Ok(missing)
}

async fn connect(params: &ConnectParams) -> ArchiveResult<client::Handle<HostKeyCheck>> {
    let config = Arc::new(client::Config {
        inactivity_timeout: Some(INACTIVITY_TIMEOUT),
        ..Default::default()
    });
    let handler = HostKeyCheck {
        host: params.host.clone(),
        port: params.port,
        known_hosts_path: params.known_hosts_path.clone(),
    };

    let addr = (params.host.as_str(), params.port);
    let mut session = tokio::time::timeout(CONNECT_TIMEOUT, client::connect(config, addr, handler))
        .await
        .map_err(|_| {
            ArchiveError::Transport(format!(
                "SSH connect to {}:{} timed out after {}s",
                params.host,
                params.port,
                CONNECT_TIMEOUT.as_secs()
            ))
        })?
        .map_err(|e| ArchiveError::transport(&format!("SSH connect {}", params.host), e))?;

    let auth = match &params.password {
        Some(password) if params.key_path.is_none() => session
            .authenticate_password(&params.user, password)
            .await
            .map_err(|e| ArchiveError::transport("SSH password auth", e))?,
        _ => {
            let key = load_key(&params.key_path)?;
            let hash_alg = session
                .best_supported_rsa_hash()
                .await
                .map_err(|e| ArchiveError::transport("negotiate hash algorithm", e))?
                .flatten();
            session
                .authenticate_publickey(
                    &params.user,
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await
                .map_err(|e| ArchiveError::transport("SSH public-key auth", e))?
        }
    };

    if !auth.success() {
        return Err(ArchiveError::Transport(format!(
            "SSH authentication failed for user '{}' on {}:{}",
            params.user, params.host, params.port
        )));
    }
    Ok(session)
}

async fn run_command(
    handle: &client::Handle<HostKeyCheck>,
    command: &str,
) -> ArchiveResult<CommandOutput> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| ArchiveError::transport("open exec channel", e))?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| ArchiveError::transport("exec", e))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
            _ => {}
        }
    }

    let status = status.ok_or_else(|| {
        ArchiveError::Transport(format!("`{command}` closed without an exit status"))
    })?;
    Ok(CommandOutput {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

fn is_not_found(e: &russh_sftp::client::error::Error) -> bool {
    matches!(
        e,
        russh_sftp::client::error::Error::Status(s) if s.status_code == StatusCode::NoSuchFile
    )
}

fn resolve_known_hosts_path(explicit: Option<&str>) -> ArchiveResult<PathBuf> {
    if let Some(path) = explicit {
        return Ok(expand_tilde_path(path));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| ArchiveError::Transport("cannot determine home directory".into()))?;
    Ok(home.join(".ssh").join("known_hosts"))
}

fn expand_tilde_path(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

fn verify_or_learn_host_key(
    host: &str,
    port: u16,
    known_hosts_path: &Path,
    server_public_key: &ssh_key::PublicKey,
) -> Result<HostKeyState, russh::Error> {
    if let Some(parent) = known_hosts_path.parent() {
        std::fs::create_dir_all(parent).map_err(russh::Error::IO)?;
    }
    if !known_hosts_path.exists() {
        std::fs::File::create(known_hosts_path).map_err(russh::Error::IO)?;
    }

    let known = known_host_keys_path(host, port, known_hosts_path)?;
    if known
        .iter()
        .any(|(_, existing_key)| existing_key == server_public_key)
    {
        return Ok(HostKeyState::Matched);
    }

    if known.is_empty() {
        learn_known_hosts_path(host, port, server_public_key, known_hosts_path)?;
        return Ok(HostKeyState::Learned);
    }

    Err(russh::Error::KeyChanged { line: known[0].0 })
}

/// Load the archive's private key, falling back to the usual `~/.ssh` names.
fn load_key(explicit: &Option<PathBuf>) -> ArchiveResult<PrivateKey> {
    if let Some(path) = explicit {
        return load_secret_key(path, None)
            .map_err(|e| ArchiveError::Transport(format!("load SSH key {}: {e}", path.display())));
    }

    let home = dirs::home_dir()
        .ok_or_else(|| ArchiveError::Transport("cannot determine home directory".into()))?;
    for name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
        let path = home.join(".ssh").join(name);
        if path.exists() {
            match load_secret_key(&path, None) {
                Ok(key) => return Ok(key),
                Err(e) => tracing::debug!("skipping {}: {e}", path.display()),
            }
        }
    }

    Err(ArchiveError::Transport(
        "archive has no password or key_path and no default SSH key was found".into(),
    ))
}
