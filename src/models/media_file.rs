//! Represents a sensor-collected media file and its archival state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Where a file stands in the archival lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStatus {
    /// Eligible for the next splitter run.
    Unassigned,
    /// Held by a splitter run identified by `claim_id`.
    Claimed,
    /// Inside a bundle that has not been uploaded yet.
    Packed,
    /// Inside a bundle confirmed on the archive.
    Archived,
}

#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MediaFile {
    pub id: Uuid,

    pub project_id: String,

    /// Device type the file was captured with (e.g. `Camera`).
    pub device_type: String,

    pub deployment_id: Option<String>,

    /// Base filename.
    pub name: String,

    /// Path relative to the local storage root.
    pub relative_path: String,

    pub size_bytes: i64,

    pub recording_dt: DateTime<Utc>,

    pub local_storage: bool,

    pub archive_status: ArchiveStatus,

    pub claim_id: Option<Uuid>,

    pub bundle_id: Option<Uuid>,
}

#[derive(Clone, Debug)]
pub struct NewMediaFile {
    pub project_id: String,
    pub device_type: String,
    pub deployment_id: Option<String>,
    pub relative_path: String,
    pub size_bytes: i64,
    pub recording_dt: DateTime<Utc>,
}

impl MediaFile {
    pub fn local_path(&self, storage_root: &Path) -> PathBuf {
        storage_root.join(&self.relative_path)
    }
}
