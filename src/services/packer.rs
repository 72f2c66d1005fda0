//! Packs a qualified batch into one `.tar.gz` bundle.

use crate::{
    errors::{ArchiveError, ArchiveResult},
    models::{bundle::BUNDLE_SUFFIX, media_file::MediaFile},
    services::bag::{self, BagEntry, MetadataSnapshot},
};
use chrono::{DateTime, Utc};
use flate2::{Compression, write::GzEncoder};
use std::{
    collections::BTreeSet,
    fs::File,
    path::{Path, PathBuf},
};
use tokio::fs;

/// Local directory (below the storage root) where bundles are written.
pub const BUNDLE_DIR: &str = "archive";

/// A bundle written to local disk.
#[derive(Debug, Clone)]
pub struct PackedBundle {
    pub name: String,
    /// Relative to the storage root; reused as the path below the archive root.
    pub relative_path: String,
    pub local_path: PathBuf,
}

/// `<projects>_<deviceType>_<minDate>_<maxDate>_<created>_<suffix>`.
///
/// Project ids are de-duplicated, sorted and joined with `-`.
pub fn bundle_name(files: &[MediaFile], created: DateTime<Utc>, suffix: usize) -> String {
    let min_date = files.iter().map(|f| f.recording_dt).min();
    let max_date = files.iter().map(|f| f.recording_dt).max();
    let fmt_date = |d: Option<DateTime<Utc>>| d.map(|d| d.format("%Y%m%d").to_string()).unwrap_or_default();

    format!(
        "{}_{}_{}_{}_{}_{}",
        joined(files.iter().map(|f| f.project_id.as_str())),
        joined(files.iter().map(|f| f.device_type.as_str())),
        fmt_date(min_date),
        fmt_date(max_date),
        created.format("%Y%m%d%H%M%S"),
        suffix
    )
}

/// Distinct values, sorted and joined with `-`.
fn joined<'a>(values: impl Iterator<Item = &'a str>) -> String {
    let values: BTreeSet<&str> = values.collect();
    values.into_iter().collect::<Vec<_>>().join("-")
}

/// Bundle location below the storage root, `archive/<projects>/<device types>/<name>.tar.gz`.
pub fn bundle_path(files: &[MediaFile], name: &str) -> String {
    format!(
        "{BUNDLE_DIR}/{}/{}/{name}{BUNDLE_SUFFIX}",
        joined(files.iter().map(|f| f.project_id.as_str())),
        joined(files.iter().map(|f| f.device_type.as_str()))
    )
}

pub struct Packer<'a> {
    pub storage_dir: &'a Path,
    pub staging_dir: &'a Path,
    pub snapshot: &'a dyn MetadataSnapshot,
}

impl Packer<'_> {
    /// Build the bundle for `files`.
    ///
    /// Bag and metadata artifacts are staged in a per-bundle directory and
    /// deleted afterwards whatever the outcome. The tarball is written to a
    /// `.part` file and only renamed into place once complete.
    pub async fn pack(&self, files: &[MediaFile], suffix: usize) -> ArchiveResult<PackedBundle> {
        if files.is_empty() {
            return Err(ArchiveError::Packing("empty batch".into()));
        }

        let name = bundle_name(files, Utc::now(), suffix);
        let relative_path = bundle_path(files, &name);
        let local_path = self.storage_dir.join(&relative_path);
        let staging = self.staging_dir.join(&name);

        let result = self.build(files, &staging, &local_path).await;

        if let Err(err) = fs::remove_dir_all(&staging).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(bundle = %name, "failed to remove staging dir: {err}");
            }
        }

        match result {
            Ok(()) => {
                tracing::info!(bundle = %name, files = files.len(), outcome = "ok", "bundle packed");
                Ok(PackedBundle {
                    name,
                    relative_path,
                    local_path,
                })
            }
            Err(err) => {
                tracing::error!(bundle = %name, outcome = "failed", "packing failed: {err}");
                Err(err)
            }
        }
    }

    async fn build(&self, files: &[MediaFile], staging: &Path, local_path: &Path) -> ArchiveResult<()> {
        fs::create_dir_all(staging).await?;

        let entries: Vec<BagEntry> = files
            .iter()
            .map(|f| BagEntry {
                source: f.local_path(self.storage_dir),
                relative_path: f.relative_path.clone(),
            })
            .collect();

        let mut artifacts = vec![self.snapshot.write(files, staging).await?];
        artifacts.extend(bag::write_bag(staging, &entries).await?);

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = part_path(local_path);
        let tar_path = tmp_path.clone();
        let written = tokio::task::spawn_blocking(move || write_tarball(&tar_path, &artifacts, &entries))
            .await
            .map_err(|e| ArchiveError::Packing(format!("pack task aborted: {e}")))?;

        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        if let Err(err) = fs::rename(&tmp_path, local_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok(())
    }
}

/// Bag artifacts go to the tar root under their basename; payload files are
/// renamed to `data/<relative path>` as they are appended.
fn write_tarball(path: &Path, artifacts: &[PathBuf], entries: &[BagEntry]) -> ArchiveResult<()> {
    let file = File::create(path)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    for artifact in artifacts {
        let name = artifact
            .file_name()
            .ok_or_else(|| ArchiveError::Packing(format!("bad artifact {}", artifact.display())))?;
        builder.append_path_with_name(artifact, name)?;
    }
    for entry in entries {
        builder
            .append_path_with_name(&entry.source, entry.member())
            .map_err(|e| ArchiveError::Packing(format!("{}: {e}", entry.source.display())))?;
    }

    let file = builder.into_inner()?.finish()?;
    file.sync_all()?;
    Ok(())
}

fn part_path(local: &Path) -> PathBuf {
    let mut name = local.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    local.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::media_file::ArchiveStatus;
    use crate::services::bag::JsonSnapshot;
    use chrono::TimeZone;
    use flate2::read::GzDecoder;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn media(root: &Path, rel: &str, day: u32, body: &[u8]) -> MediaFile {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body).unwrap();
        MediaFile {
            id: Uuid::new_v4(),
            project_id: "ABC".into(),
            device_type: "Camera".into(),
            deployment_id: Some("dep-7".into()),
            name: rel.rsplit('/').next().unwrap().into(),
            relative_path: rel.into(),
            size_bytes: body.len() as i64,
            recording_dt: Utc.with_ymd_and_hms(2024, 3, day, 8, 30, 0).unwrap(),
            local_storage: true,
            archive_status: ArchiveStatus::Claimed,
            claim_id: None,
            bundle_id: None,
        }
    }

    #[test]
    fn name_uses_projects_device_and_date_range() {
        let dir = tempdir().unwrap();
        let files = vec![
            media(dir.path(), "a.jpg", 9, b"a"),
            media(dir.path(), "b.jpg", 2, b"b"),
        ];
        let created = Utc.with_ymd_and_hms(2024, 6, 1, 10, 11, 12).unwrap();
        assert_eq!(
            bundle_name(&files, created, 3),
            "ABC_Camera_20240302_20240309_20240601101112_3"
        );
    }

    #[test]
    fn multi_project_bundle_dir_matches_its_name() {
        let dir = tempdir().unwrap();
        let mut other = media(dir.path(), "b.jpg", 2, b"b");
        other.project_id = "XYZ".into();
        let files = vec![other, media(dir.path(), "a.jpg", 9, b"a")];
        let created = Utc.with_ymd_and_hms(2024, 6, 1, 10, 11, 12).unwrap();

        let name = bundle_name(&files, created, 0);
        assert!(name.starts_with("ABC-XYZ_Camera_"));
        assert_eq!(
            bundle_path(&files, &name),
            format!("archive/ABC-XYZ/Camera/{name}.tar.gz")
        );
    }

    #[tokio::test]
    async fn packed_tar_has_bag_at_root_and_payload_under_data() {
        let storage = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let files = vec![
            media(storage.path(), "ABC/dep-7/IMG_1.jpg", 1, b"one"),
            media(storage.path(), "ABC/dep-7/IMG_2.jpg", 2, b"two"),
        ];
        let packer = Packer {
            storage_dir: storage.path(),
            staging_dir: staging.path(),
            snapshot: &JsonSnapshot,
        };

        let packed = packer.pack(&files, 0).await.unwrap();
        assert!(packed.local_path.exists());
        assert!(packed.relative_path.starts_with("archive/ABC/Camera/ABC_Camera_"));
        assert!(packed.name.ends_with("_0"));
        assert!(!staging.path().join(&packed.name).exists());

        let reader = GzDecoder::new(File::open(&packed.local_path).unwrap());
        let mut archive = tar::Archive::new(reader);
        let mut members: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        members.sort();
        assert_eq!(
            members,
            [
                "bagit.txt",
                "data/ABC/dep-7/IMG_1.jpg",
                "data/ABC/dep-7/IMG_2.jpg",
                "manifest-md5.txt",
                "metadata.json",
                "tagmanifest-md5.txt",
            ]
        );
    }

    #[tokio::test]
    async fn failed_pack_leaves_no_bundle_or_artifacts() {
        let storage = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let mut missing = media(storage.path(), "ABC/gone.jpg", 1, b"x");
        std::fs::remove_file(storage.path().join("ABC/gone.jpg")).unwrap();
        missing.relative_path = "ABC/gone.jpg".into();

        let packer = Packer {
            storage_dir: storage.path(),
            staging_dir: staging.path(),
            snapshot: &JsonSnapshot,
        };
        assert!(packer.pack(&[missing], 0).await.is_err());

        let bundle_dir = storage.path().join("archive/ABC/Camera");
        let leftovers = std::fs::read_dir(&bundle_dir).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }
}
