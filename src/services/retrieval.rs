//! Brings requested files back from an archived bundle.
//!
//! A bad file never fails the job: members that are missing from the tar or
//! fail to copy are logged and left out of the result.

use crate::{
    errors::ArchiveResult,
    models::{archive::Archive, bundle::Bundle, media_file::MediaFile},
    services::{
        catalog::Catalog,
        tape::TapeCommands,
        transport::{Connector, Remote, shell_quote},
    },
};
use std::{collections::HashMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// Member names passed to a single extract command.
pub const DEFAULT_EXTRACT_CHUNK: usize = 500;

/// Member path from one line of `tar tvf` output (the last field).
pub fn listing_member(line: &str) -> Option<&str> {
    line.split_whitespace().last()
}

/// Pair each requested name with the first tar member whose basename equals
/// it. Scanning stops once every name has matched.
///
/// Basenames are compared exactly, so `IMG_1.jpg` never matches
/// `IMG_10.jpg`.
pub fn match_members<'a, I>(listing: I, requested: &[String]) -> Vec<(String, String)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut pending: HashMap<&str, usize> = requested
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();
    let mut found: Vec<Option<String>> = vec![None; requested.len()];

    for line in listing {
        if pending.is_empty() {
            break;
        }
        let Some(member) = listing_member(line) else {
            continue;
        };
        let basename = member.rsplit('/').next().unwrap_or(member);
        if let Some(idx) = pending.remove(basename) {
            found[idx] = Some(member.to_string());
        }
    }

    requested
        .iter()
        .zip(found)
        .filter_map(|(name, member)| member.map(|m| (name.clone(), m)))
        .collect()
}

/// One `tar -zxvf` command per chunk of at most `chunk_size` members.
pub fn extract_commands(archive_path: &str, dest: &str, members: &[String], chunk_size: usize) -> Vec<String> {
    members
        .chunks(chunk_size.max(1))
        .map(|chunk| {
            let quoted: Vec<String> = chunk.iter().map(|m| shell_quote(m)).collect();
            format!(
                "tar -zxvf {} -C {} {}",
                shell_quote(archive_path),
                shell_quote(dest),
                quoted.join(" ")
            )
        })
        .collect()
}

pub struct Retriever<'a, C: Connector> {
    pub catalog: &'a Catalog,
    pub connector: &'a C,
    pub storage_dir: &'a Path,
    pub tape: &'a TapeCommands,
    pub chunk_size: usize,
}

impl<C: Connector> Retriever<'_, C> {
    /// Retrieve `names` (media file basenames) from `bundle_id` into local
    /// storage. Returns the files now available locally.
    pub async fn retrieve(
        &self,
        job_id: Uuid,
        bundle_id: Uuid,
        names: &[String],
    ) -> ArchiveResult<Vec<MediaFile>> {
        let bundle = self.catalog.fetch_bundle(bundle_id).await?;
        let archive = self.catalog.fetch_archive(bundle.archive_id).await?;

        let mut session = self.connector.connect(&archive).await?;
        let result = self
            .retrieve_with(&mut session, job_id, &archive, &bundle, names)
            .await;
        session.close().await;

        match &result {
            Ok(files) => tracing::info!(
                bundle = %bundle.name,
                requested = names.len(),
                retrieved = files.len(),
                outcome = "ok",
                "retrieval finished"
            ),
            Err(err) if err.retry_signal().is_some() => {
                tracing::info!(bundle = %bundle.name, "retrieval deferred: {err}")
            }
            Err(err) => tracing::error!(bundle = %bundle.name, outcome = "failed", "retrieval failed: {err}"),
        }
        result
    }

    /// The retrieval algorithm over an already open session. The caller
    /// owns and closes `remote`.
    pub async fn retrieve_with<R: Remote + ?Sized>(
        &self,
        remote: &mut R,
        job_id: Uuid,
        archive: &Archive,
        bundle: &Bundle,
        names: &[String],
    ) -> ArchiveResult<Vec<MediaFile>> {
        let remote_path = archive.remote_path(&bundle.path);
        let archive_path = self.tape.ensure_online(remote, &remote_path).await?;

        let scratch = archive.scratch_dir(job_id);
        remote.mkdir_p(&scratch).await?;

        let result = self
            .extract_and_copy(remote, bundle, &archive_path, &scratch, names)
            .await;

        let cleanup = format!("rm -rf {}", shell_quote(&scratch));
        match remote.exec(&cleanup).await {
            Ok(out) if out.success() => tracing::debug!(scratch = %scratch, "scratch removed"),
            Ok(out) => tracing::warn!(scratch = %scratch, stderr = %out.stderr.trim(), "scratch cleanup failed"),
            Err(err) => tracing::warn!(scratch = %scratch, "scratch cleanup failed: {err}"),
        }
        result
    }

    async fn extract_and_copy<R: Remote + ?Sized>(
        &self,
        remote: &mut R,
        bundle: &Bundle,
        archive_path: &str,
        scratch: &str,
        names: &[String],
    ) -> ArchiveResult<Vec<MediaFile>> {
        let listing_cmd = format!("tar tvf {}", shell_quote(archive_path));
        let listing = remote.exec(&listing_cmd).await?.check(&listing_cmd)?;
        let matched = match_members(listing.stdout.lines(), names);

        if matched.len() < names.len() {
            let found: Vec<&str> = matched.iter().map(|(n, _)| n.as_str()).collect();
            for name in names.iter().filter(|n| !found.contains(&n.as_str())) {
                tracing::warn!(bundle = %bundle.name, file = %name, "file not found in bundle");
            }
        }
        if matched.is_empty() {
            return Ok(Vec::new());
        }

        let members: Vec<String> = matched.iter().map(|(_, m)| m.clone()).collect();
        for command in extract_commands(archive_path, scratch, &members, self.chunk_size) {
            let out = remote.exec(&command).await?;
            if !out.success() {
                tracing::warn!(
                    bundle = %bundle.name,
                    status = out.status,
                    stderr = %out.stderr.trim(),
                    "extract command failed; affected files will be skipped"
                );
            }
        }

        let mut by_name: HashMap<String, MediaFile> = self
            .catalog
            .files_in_bundle(bundle.id)
            .await?
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();

        let mut retrieved = Vec::new();
        for (name, member) in matched {
            let Some(mut file) = by_name.remove(&name) else {
                tracing::warn!(bundle = %bundle.name, file = %name, "no media record for member");
                continue;
            };
            let local = file.local_path(self.storage_dir);
            if !fs::try_exists(&local).await.unwrap_or(false) {
                let source = format!("{}/{}", scratch.trim_end_matches('/'), member);
                if let Err(err) = copy_member(remote, &source, &local).await {
                    tracing::error!(
                        bundle = %bundle.name,
                        file = %name,
                        outcome = "failed",
                        "copy failed: {err}"
                    );
                    continue;
                }
            }
            file.local_storage = true;
            tracing::info!(bundle = %bundle.name, file = %name, outcome = "ok", "file retrieved");
            retrieved.push(file);
        }

        self.catalog.mark_retrieved(&retrieved).await?;
        Ok(retrieved)
    }
}

async fn copy_member<R: Remote + ?Sized>(remote: &mut R, source: &str, local: &Path) -> ArchiveResult<u64> {
    if let Some(parent) = local.parent() {
        fs::create_dir_all(parent).await?;
    }
    remote.download(source, local).await
}
