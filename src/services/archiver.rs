//! Archive lifecycle: split → pack → upload, plus retrieval, deletion and
//! status probes. Every remote operation opens its own session through the
//! [`Connector`] and closes it before returning.

use crate::{
    config::AppConfig,
    errors::{ArchiveError, ArchiveResult},
    models::{
        bundle::{Bundle, NewBundle},
        job::JobKind,
        media_file::MediaFile,
    },
    services::{
        bag::MetadataSnapshot,
        catalog::Catalog,
        jobs::{JobRunner, JobSpec},
        packer::{BUNDLE_DIR, PackedBundle, Packer},
        retrieval::Retriever,
        splitter::{GroupBySize, SizeGroup, Splitter},
        tape::TapeStatus,
        transport::{Connector, DirClient, Remote, TransferClient, remote_parent, shell_quote},
    },
};
use futures::future::join_all;
use std::{io::ErrorKind, path::Path, sync::Arc};
use tokio::fs;
use uuid::Uuid;

pub struct Archiver<C: Connector> {
    pub catalog: Catalog,
    pub runner: JobRunner,
    pub config: Arc<AppConfig>,
    pub connector: Arc<C>,
    pub snapshot: Arc<dyn MetadataSnapshot>,
    pub grouper: Arc<dyn GroupBySize>,
}

impl<C: Connector> Clone for Archiver<C> {
    fn clone(&self) -> Self {
        Self {
            catalog: self.catalog.clone(),
            runner: self.runner.clone(),
            config: self.config.clone(),
            connector: self.connector.clone(),
            snapshot: self.snapshot.clone(),
            grouper: self.grouper.clone(),
        }
    }
}

impl<C: Connector> Archiver<C> {
    pub fn new(
        catalog: Catalog,
        config: Arc<AppConfig>,
        connector: Arc<C>,
        snapshot: Arc<dyn MetadataSnapshot>,
        grouper: Arc<dyn GroupBySize>,
    ) -> Self {
        Self {
            runner: JobRunner::new(catalog.clone(), config.job_heartbeat),
            catalog,
            config,
            connector,
            snapshot,
            grouper,
        }
    }

    // --- packing ---

    /// Pack one qualified batch into a bundle owned by `archive_id`.
    ///
    /// On any failure the batch's files are released back to the pool.
    pub async fn pack_batch(
        &self,
        archive_id: Uuid,
        group: &SizeGroup,
        suffix: usize,
    ) -> ArchiveResult<Bundle> {
        let result = self.pack_and_record(archive_id, group, suffix).await;
        if result.is_err() {
            match self.catalog.release_files(&group.file_ids).await {
                Ok(released) => tracing::info!(suffix, released, "batch files released after failed pack"),
                Err(err) => tracing::error!(suffix, "failed to release batch files: {err}"),
            }
        }
        result
    }

    async fn pack_and_record(
        &self,
        archive_id: Uuid,
        group: &SizeGroup,
        suffix: usize,
    ) -> ArchiveResult<Bundle> {
        let files = self.catalog.files_by_ids(&group.file_ids).await?;
        let packer = Packer {
            storage_dir: &self.config.storage_dir,
            staging_dir: &self.config.staging_dir,
            snapshot: self.snapshot.as_ref(),
        };
        let packed = packer.pack(&files, suffix).await?;

        match self.record_bundle(archive_id, &packed, &files).await {
            Ok(bundle) => Ok(bundle),
            Err(err) => {
                if let Err(rm) = fs::remove_file(&packed.local_path).await {
                    tracing::warn!(bundle = %packed.name, "failed to remove unrecorded bundle: {rm}");
                }
                Err(err)
            }
        }
    }

    async fn record_bundle(
        &self,
        archive_id: Uuid,
        packed: &PackedBundle,
        files: &[MediaFile],
    ) -> ArchiveResult<Bundle> {
        let bundle = self
            .catalog
            .insert_bundle(NewBundle {
                archive_id,
                name: packed.name.clone(),
                path: packed.relative_path.clone(),
            })
            .await?;
        let ids: Vec<Uuid> = files.iter().map(|f| f.id).collect();
        self.catalog.attach_files(bundle.id, &ids).await?;
        tracing::info!(bundle = %bundle.name, files = ids.len(), outcome = "ok", "bundle recorded");
        Ok(bundle)
    }

    // --- upload ---

    /// Copy a packed bundle to its archive and mark it archived.
    ///
    /// Already archived bundles are returned unchanged. The `uploading`
    /// guard is taken with a compare-and-set and released on every path.
    pub async fn upload_bundle(&self, bundle_id: Uuid) -> ArchiveResult<Bundle> {
        let bundle = self.catalog.fetch_bundle(bundle_id).await?;
        if bundle.archived {
            tracing::info!(bundle = %bundle.name, "bundle already archived");
            return Ok(bundle);
        }
        if !self.catalog.try_mark_uploading(bundle.id).await? {
            let current = self.catalog.fetch_bundle(bundle_id).await?;
            if current.archived {
                return Ok(current);
            }
            tracing::info!(bundle = %bundle.name, "upload already in progress");
            return Err(ArchiveError::UploadInProgress(bundle.name));
        }
        tracing::info!(bundle = %bundle.name, "upload started");

        let result = self.transfer_bundle(&bundle).await;
        let result = match result {
            Ok(bytes) => match self.catalog.finish_upload(bundle.id, true).await {
                Ok(()) => Ok(bytes),
                Err(err) => {
                    self.release_upload_guard(&bundle).await;
                    Err(err)
                }
            },
            Err(err) => {
                self.release_upload_guard(&bundle).await;
                Err(err)
            }
        };

        match result {
            Ok(bytes) => {
                tracing::info!(bundle = %bundle.name, bytes, outcome = "ok", "bundle archived");
                self.catalog.fetch_bundle(bundle_id).await
            }
            Err(err) => {
                tracing::error!(bundle = %bundle.name, outcome = "failed", "upload failed: {err}");
                Err(err)
            }
        }
    }

    async fn release_upload_guard(&self, bundle: &Bundle) {
        if let Err(err) = self.catalog.finish_upload(bundle.id, false).await {
            tracing::error!(bundle = %bundle.name, "failed to clear uploading flag: {err}");
        }
    }

    async fn transfer_bundle(&self, bundle: &Bundle) -> ArchiveResult<u64> {
        let archive = self.catalog.fetch_archive(bundle.archive_id).await?;
        let local = bundle.local_path(&self.config.storage_dir);
        let remote_path = archive.remote_path(&bundle.path);

        let mut session = self.connector.connect(&archive).await?;
        let result = async {
            session.mkdir_p(remote_parent(&remote_path)).await?;
            session.upload(&local, &remote_path).await
        }
        .await;
        session.close().await;
        result
    }

    // --- deletion ---

    /// Remove a bundle everywhere it exists, then its record.
    ///
    /// Remote data is removed first; if that fails nothing else is touched
    /// and [`ArchiveError::RemoteDeleteRejected`] is returned. Each removed
    /// copy is recorded before the next step, so a later failure leaves a
    /// record that a retry can finish.
    pub async fn delete_bundle(&self, bundle_id: Uuid) -> ArchiveResult<()> {
        let bundle = self.catalog.fetch_bundle(bundle_id).await?;
        if bundle.uploading {
            return Err(ArchiveError::UploadInProgress(bundle.name));
        }

        if !bundle.local_storage && !bundle.archived {
            self.catalog.delete_bundle_record(bundle.id).await?;
            tracing::info!(bundle = %bundle.name, outcome = "ok", "bundle record removed");
            return Ok(());
        }

        if bundle.archived {
            self.delete_remote(&bundle).await?;
            self.catalog.unmark_archived(bundle.id).await?;
            tracing::info!(bundle = %bundle.name, outcome = "ok", "remote bundle removed");
        }

        if bundle.local_storage {
            let local = bundle.local_path(&self.config.storage_dir);
            match fs::remove_file(&local).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    tracing::warn!(bundle = %bundle.name, path = %local.display(), "local bundle already gone");
                }
                Err(err) => {
                    tracing::error!(bundle = %bundle.name, path = %local.display(), outcome = "failed", "local bundle removal failed: {err}");
                    return Err(err.into());
                }
            }
            self.catalog.set_bundle_local_storage(bundle.id, false).await?;
            if let Some(parent) = local.parent() {
                prune_empty_dirs(parent, &self.config.storage_dir.join(BUNDLE_DIR)).await;
            }
        }

        self.catalog.delete_bundle_record(bundle.id).await?;
        tracing::info!(bundle = %bundle.name, outcome = "ok", "bundle deleted");
        Ok(())
    }

    async fn delete_remote(&self, bundle: &Bundle) -> ArchiveResult<()> {
        let archive = self.catalog.fetch_archive(bundle.archive_id).await?;
        let remote_path = archive.remote_path(&bundle.path);

        let mut session = self.connector.connect(&archive).await.map_err(|err| {
            ArchiveError::RemoteDeleteRejected {
                bundle: bundle.name.clone(),
                reason: err.to_string(),
            }
        })?;
        let result = remove_remote(&mut session, &bundle.name, &remote_path).await;
        session.close().await;
        result
    }

    // --- status ---

    /// Current tape status of a bundle. Never stages.
    pub async fn bundle_status(&self, bundle_id: Uuid) -> ArchiveResult<(String, TapeStatus)> {
        let bundle = self.catalog.fetch_bundle(bundle_id).await?;
        let archive = self.catalog.fetch_archive(bundle.archive_id).await?;
        let tape = self.config.tape_commands();

        let mut session = self.connector.connect(&archive).await?;
        let result = tape
            .probe_bundle(&mut session, &archive.remote_path(&bundle.path))
            .await;
        session.close().await;

        if let Ok((path, status)) = &result {
            tracing::info!(bundle = %bundle.name, path = %path, %status, "bundle status");
        }
        result
    }

    // --- retrieval ---

    /// Retrieve files by name from a bundle as an admission-controlled job.
    /// Staging and admission conditions back off and retry without limit.
    pub async fn retrieve(&self, bundle_id: Uuid, names: &[String]) -> ArchiveResult<Vec<MediaFile>> {
        let tape = self.config.tape_commands();
        let retriever = Retriever {
            catalog: &self.catalog,
            connector: self.connector.as_ref(),
            storage_dir: &self.config.storage_dir,
            tape: &tape,
            chunk_size: self.config.extract_chunk_size,
        };
        let spec = JobSpec {
            kind: JobKind::Retrieve,
            subject: bundle_id.to_string(),
            max_concurrent: Some(self.config.max_concurrent_retrievals),
            policy: self.config.job_policy(),
        };

        let retriever = &retriever;
        self.runner
            .run(&spec, move |job_id| retriever.retrieve(job_id, bundle_id, names))
            .await
    }

    // --- pipeline ---

    /// Split one (project, device type) pool, pack every qualified batch
    /// concurrently, then upload the resulting bundles one after another.
    ///
    /// Returns the bundles produced, in their state after the upload stage.
    pub async fn archive_group(
        &self,
        archive_id: Uuid,
        project_id: &str,
        device_type: &str,
    ) -> ArchiveResult<Vec<Bundle>> {
        self.catalog.fetch_archive(archive_id).await?;

        let splitter = Splitter {
            catalog: &self.catalog,
            grouper: self.grouper.as_ref(),
            min_archive_size_gb: self.config.min_archive_size_gb,
        };
        let groups = splitter.split(project_id, device_type).await?;
        if groups.is_empty() {
            return Ok(Vec::new());
        }

        // fan-out
        let packs = groups.iter().enumerate().map(|(suffix, group)| {
            let spec = JobSpec {
                kind: JobKind::Pack,
                subject: format!("{project_id}/{device_type}#{suffix}"),
                max_concurrent: None,
                policy: self.config.pack_policy(),
            };
            async move {
                self.runner
                    .run(&spec, |_| self.pack_batch(archive_id, group, suffix))
                    .await
            }
        });
        let packed: Vec<Bundle> = join_all(packs)
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect();
        tracing::info!(
            project_id,
            device_type,
            batches = groups.len(),
            packed = packed.len(),
            "pack stage complete"
        );

        // fan-in
        let mut bundles = Vec::with_capacity(packed.len());
        for bundle in packed {
            let spec = JobSpec {
                kind: JobKind::Upload,
                subject: bundle.name.clone(),
                max_concurrent: None,
                policy: self.config.job_policy(),
            };
            match self.runner.run(&spec, |_| self.upload_bundle(bundle.id)).await {
                Ok(uploaded) => bundles.push(uploaded),
                Err(_) => bundles.push(bundle),
            }
        }
        Ok(bundles)
    }

    /// Run [`Archiver::archive_group`] for every pool that has unassigned
    /// files. A failing pool is logged and does not stop the others.
    pub async fn archive_all(&self, archive_id: Uuid) -> ArchiveResult<Vec<Bundle>> {
        let mut bundles = Vec::new();
        for (project_id, device_type) in self.catalog.pending_groups().await? {
            match self.archive_group(archive_id, &project_id, &device_type).await {
                Ok(mut produced) => bundles.append(&mut produced),
                Err(err) => tracing::error!(
                    project_id = %project_id,
                    device_type = %device_type,
                    outcome = "failed",
                    "archiving pool failed: {err}"
                ),
            }
        }
        Ok(bundles)
    }
}

/// `rm` the bundle, then prune directories it leaves empty. Only the `rm`
/// decides the outcome.
async fn remove_remote<R: Remote + ?Sized>(
    remote: &mut R,
    bundle_name: &str,
    remote_path: &str,
) -> ArchiveResult<()> {
    let rm = format!("rm {}", shell_quote(remote_path));
    let reason = match remote.exec(&rm).await {
        Ok(out) if out.success() => None,
        Ok(out) => Some(format!("exit {}: {}", out.status, out.stderr.trim())),
        Err(err) => Some(err.to_string()),
    };
    if let Some(reason) = reason {
        tracing::error!(bundle = bundle_name, outcome = "failed", "remote delete rejected: {reason}");
        return Err(ArchiveError::RemoteDeleteRejected {
            bundle: bundle_name.to_string(),
            reason,
        });
    }

    let prune = format!(
        "find {} -type d -empty -delete",
        shell_quote(remote_parent(remote_path))
    );
    match remote.exec(&prune).await {
        Ok(out) if !out.success() => {
            tracing::warn!(bundle = bundle_name, stderr = %out.stderr.trim(), "remote prune failed")
        }
        Err(err) => tracing::warn!(bundle = bundle_name, "remote prune failed: {err}"),
        Ok(_) => {}
    }
    Ok(())
}

/// Remove empty directories from `start` up to, but not including, `stop`.
async fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut current = start.to_path_buf();
    while current.starts_with(stop) && current != stop {
        match fs::remove_dir(&current).await {
            Ok(_) => {
                if let Some(parent) = current.parent() {
                    current = parent.to_path_buf();
                } else {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => break,
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
            Err(err) => {
                tracing::debug!("failed to prune directory {}: {}", current.display(), err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn prune_stops_at_boundary_and_non_empty_dirs() {
        let root = tempdir().unwrap();
        let stop = root.path().join("archive");
        let leaf = stop.join("ABC/Camera");
        std::fs::create_dir_all(&leaf).unwrap();
        std::fs::write(stop.join("ABC/keep.txt"), b"x").unwrap();

        prune_empty_dirs(&leaf, &stop).await;
        assert!(!leaf.exists());
        assert!(stop.join("ABC").exists());

        std::fs::remove_file(stop.join("ABC/keep.txt")).unwrap();
        prune_empty_dirs(&stop.join("ABC"), &stop).await;
        assert!(!stop.join("ABC").exists());
        assert!(stop.exists());
    }
}
