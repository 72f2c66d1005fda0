//! BagIt fixity artifacts and the metadata snapshot written next to them.
//!
//! Layout inside a bundle:
//!
//! ```text
//! bagit.txt
//! manifest-md5.txt
//! tagmanifest-md5.txt
//! metadata.json
//! data/<relative path of each file>
//! ```

use crate::{errors::ArchiveResult, models::media_file::MediaFile};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;

pub const BAGIT_FILE: &str = "bagit.txt";
pub const METADATA_FILE: &str = "metadata.json";
pub const CHECKSUM_ALGORITHM: &str = "md5";

/// Read size used while hashing; files are never loaded whole.
const HASH_BLOCK_SIZE: usize = 1024 * 1024;

pub fn manifest_name() -> String {
    format!("manifest-{CHECKSUM_ALGORITHM}.txt")
}

pub fn tag_manifest_name() -> String {
    format!("tagmanifest-{CHECKSUM_ALGORITHM}.txt")
}

/// A payload file and its path below `data/`.
#[derive(Debug, Clone)]
pub struct BagEntry {
    pub source: PathBuf,
    pub relative_path: String,
}

impl BagEntry {
    /// Path of this file inside the bag, as used by the manifest and the tar.
    pub fn member(&self) -> String {
        format!("data/{}", self.relative_path.trim_start_matches('/'))
    }
}

/// Stream a file through MD5 in fixed-size blocks.
pub async fn md5_file(path: &Path) -> ArchiveResult<String> {
    let file = File::open(path).await?;
    let mut stream = ReaderStream::with_capacity(file, HASH_BLOCK_SIZE);
    let mut digest = md5::Context::new();
    while let Some(chunk) = stream.next().await {
        digest.consume(&chunk?);
    }
    Ok(format!("{:x}", digest.compute()))
}

/// Write `bagit.txt`, the payload manifest and the tag manifest into `dir`.
///
/// Manifest lines follow the order of `entries`. Returns the written paths.
pub async fn write_bag(dir: &Path, entries: &[BagEntry]) -> ArchiveResult<Vec<PathBuf>> {
    fs::create_dir_all(dir).await?;

    let bagit_path = dir.join(BAGIT_FILE);
    fs::write(
        &bagit_path,
        "BagIt-Version: 0.97\nTag-File-Character-Encoding: UTF-8\n",
    )
    .await?;

    let mut manifest = String::new();
    for entry in entries {
        let checksum = md5_file(&entry.source).await?;
        manifest.push_str(&format!("{checksum}  {}\n", entry.member()));
    }
    let manifest_path = dir.join(manifest_name());
    fs::write(&manifest_path, manifest).await?;

    let mut tag_manifest = String::new();
    for path in [&bagit_path, &manifest_path] {
        let checksum = md5_file(path).await?;
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tag_manifest.push_str(&format!("{checksum}  {basename}\n"));
    }
    let tag_manifest_path = dir.join(tag_manifest_name());
    fs::write(&tag_manifest_path, tag_manifest).await?;

    tracing::debug!(dir = %dir.display(), files = entries.len(), "bag written");
    Ok(vec![bagit_path, manifest_path, tag_manifest_path])
}

/// Parse `<checksum>  <path>` manifest lines.
pub fn parse_manifest(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let (checksum, path) = line.split_once("  ")?;
            Some((checksum.to_string(), path.to_string()))
        })
        .collect()
}

/// Writes the metadata snapshot describing a file set.
#[async_trait]
pub trait MetadataSnapshot: Send + Sync {
    /// Write `metadata.json` into `out_dir` and return its path.
    async fn write(&self, files: &[MediaFile], out_dir: &Path) -> ArchiveResult<PathBuf>;
}

#[derive(Serialize)]
struct Snapshot<'a> {
    generated_at: String,
    projects: BTreeSet<&'a str>,
    device_types: BTreeSet<&'a str>,
    deployments: BTreeSet<&'a str>,
    files: &'a [MediaFile],
}

/// Serializes the file records and the projects, device types and
/// deployments they reference.
#[derive(Debug, Clone, Default)]
pub struct JsonSnapshot;

#[async_trait]
impl MetadataSnapshot for JsonSnapshot {
    async fn write(&self, files: &[MediaFile], out_dir: &Path) -> ArchiveResult<PathBuf> {
        let snapshot = Snapshot {
            generated_at: Utc::now().to_rfc3339(),
            projects: files.iter().map(|f| f.project_id.as_str()).collect(),
            device_types: files.iter().map(|f| f.device_type.as_str()).collect(),
            deployments: files
                .iter()
                .filter_map(|f| f.deployment_id.as_deref())
                .collect(),
            files,
        };
        let body = serde_json::to_vec_pretty(&snapshot)?;
        fs::create_dir_all(out_dir).await?;
        let path = out_dir.join(METADATA_FILE);
        fs::write(&path, body).await?;
        Ok(path)
    }
}
