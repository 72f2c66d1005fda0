//! Represents a packed tar bundle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Suffix every packed bundle carries on disk and on the archive.
pub const BUNDLE_SUFFIX: &str = ".tar.gz";

/// A compressed tar archive grouping many media files for cold storage.
///
/// The three flags are independent: a bundle may be remote-only
/// (`local_storage = false`, `archived = true`).
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bundle {
    pub id: Uuid,

    /// Owning archive target.
    pub archive_id: Uuid,

    /// Bundle name without suffix.
    pub name: String,

    /// Path relative to both the local storage root and the archive root.
    pub path: String,

    /// Bytes present on local disk.
    pub local_storage: bool,

    /// In-flight transfer guard.
    pub uploading: bool,

    /// Confirmed present on the remote archive at `path`.
    pub archived: bool,

    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewBundle {
    pub archive_id: Uuid,
    pub name: String,
    pub path: String,
}

impl Bundle {
    pub fn local_path(&self, storage_root: &Path) -> PathBuf {
        storage_root.join(&self.path)
    }
}
