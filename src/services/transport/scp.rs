//! SCP source/sink protocol spoken over an exec channel running
//! `scp -t <path>` (upload) or `scp -f <path>` (download).
//!
//! Every read from and write to the peer is bounded by an idle timeout.

use super::TransferProgress;
use crate::errors::{ArchiveError, ArchiveResult};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

const BLOCK_SIZE: usize = 256 * 1024;
const MAX_HEADER_LEN: usize = 4096;

pub fn sink_command(remote: &str) -> String {
    format!("scp -t {}", super::shell_quote(remote))
}

pub fn source_command(remote: &str) -> String {
    format!("scp -f {}", super::shell_quote(remote))
}

/// Stream `local` to a remote `scp -t`.
pub async fn send_file<S>(stream: &mut S, local: &Path, idle: Duration) -> ArchiveResult<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut file = File::open(local).await?;
    let size = file.metadata().await?.len();
    let name = local
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ArchiveError::Transport(format!("invalid file name {}", local.display())))?;

    read_ack(stream, idle).await?;
    send(stream, format!("C0644 {size} {name}\n").as_bytes(), idle).await?;
    read_ack(stream, idle).await?;

    let mut progress = TransferProgress::new(name, size);
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        with_idle(idle, stream.write_all(&buf[..n])).await??;
        sent += n as u64;
        progress.advance(n as u64);
    }
    if sent != size {
        return Err(ArchiveError::Transport(format!(
            "{} changed size during upload ({size} -> {sent})",
            local.display()
        )));
    }

    send(stream, &[0], idle).await?;
    read_ack(stream, idle).await?;
    with_idle(idle, stream.shutdown()).await??;
    Ok(sent)
}

/// Receive one file from a remote `scp -f` into `local`.
///
/// Bytes land in a `.part` sibling that is renamed into place only after the
/// peer confirms the transfer.
pub async fn receive_file<S>(stream: &mut S, local: &Path, idle: Duration) -> ArchiveResult<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let tmp_path = part_path(local);
    match receive_into(stream, local, &tmp_path, idle).await {
        Ok(size) => {
            fs::rename(&tmp_path, local).await?;
            Ok(size)
        }
        Err(err) => {
            let _ = fs::remove_file(&tmp_path).await;
            Err(err)
        }
    }
}

async fn receive_into<S>(
    stream: &mut S,
    local: &Path,
    tmp_path: &Path,
    idle: Duration,
) -> ArchiveResult<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send(stream, &[0], idle).await?;
    let header = read_line(stream, idle).await?;
    let size = parse_file_header(&header)?;
    send(stream, &[0], idle).await?;

    let name = local.display().to_string();
    let mut progress = TransferProgress::new(&name, size);
    let mut file = File::create(tmp_path).await?;
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(BLOCK_SIZE as u64) as usize;
        let n = with_idle(idle, stream.read(&mut buf[..want])).await??;
        if n == 0 {
            return Err(ArchiveError::Transport(format!(
                "connection closed with {remaining} bytes of {name} outstanding"
            )));
        }
        file.write_all(&buf[..n]).await?;
        remaining -= n as u64;
        progress.advance(n as u64);
    }
    file.flush().await?;
    file.sync_all().await?;

    read_ack(stream, idle).await?;
    send(stream, &[0], idle).await?;
    Ok(size)
}

/// Parse a `C<mode> <size> <name>` header into the file size.
fn parse_file_header(line: &str) -> ArchiveResult<u64> {
    let mut parts = line.splitn(3, ' ');
    let mode = parts.next().unwrap_or_default();
    let size = parts.next().unwrap_or_default();
    if !mode.starts_with('C') || parts.next().is_none() {
        return Err(ArchiveError::Transport(format!(
            "unexpected scp header `{line}`"
        )));
    }
    size.parse::<u64>()
        .map_err(|_| ArchiveError::Transport(format!("invalid size in scp header `{line}`")))
}

/// Write and flush `bytes`, failing if the peer stops draining the channel.
async fn send<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8], idle: Duration) -> ArchiveResult<()> {
    with_idle(idle, stream.write_all(bytes)).await??;
    with_idle(idle, stream.flush()).await??;
    Ok(())
}

/// Read a status byte; `1` (warning) and `2` (fatal) carry a message line.
async fn read_ack<S: AsyncRead + Unpin>(stream: &mut S, idle: Duration) -> ArchiveResult<()> {
    let code = with_idle(idle, stream.read_u8()).await??;
    match code {
        0 => Ok(()),
        1 | 2 => {
            let message = read_line(stream, idle).await?;
            Err(ArchiveError::Transport(format!("scp: {message}")))
        }
        other => Err(ArchiveError::Transport(format!(
            "scp: unexpected status byte {other}"
        ))),
    }
}

/// Read a protocol line. A leading error byte is surfaced as a failure.
async fn read_line<S: AsyncRead + Unpin>(stream: &mut S, idle: Duration) -> ArchiveResult<String> {
    let mut line = Vec::new();
    loop {
        let byte = with_idle(idle, stream.read_u8()).await??;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > MAX_HEADER_LEN {
            return Err(ArchiveError::Transport("scp header too long".into()));
        }
    }
    match line.first() {
        Some(1) | Some(2) => Err(ArchiveError::Transport(format!(
            "scp: {}",
            String::from_utf8_lossy(&line[1..])
        ))),
        _ => Ok(String::from_utf8_lossy(&line).into_owned()),
    }
}

async fn with_idle<F: std::future::Future>(idle: Duration, fut: F) -> ArchiveResult<F::Output> {
    timeout(idle, fut).await.map_err(|_| {
        ArchiveError::Transport(format!(
            "transfer idle for more than {}s",
            idle.as_secs()
        ))
    })
}

fn part_path(local: &Path) -> PathBuf {
    let mut name = local.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    local.with_file_name(name)
}
