//! Represents a remote tape-backed archive target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A remote archive host reached over SSH.
///
/// Identity is the `(address, root_folder, username)` triplet; each archive
/// carries exactly one credential set (password or private key).
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Archive {
    pub id: Uuid,

    /// Hostname or IP address of the archive server.
    pub address: String,

    pub port: u16,

    pub username: String,

    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// Path to a private key used instead of `password` when present.
    pub key_path: Option<String>,

    /// Remote directory under which all bundles are stored.
    pub root_folder: String,

    pub created_at: DateTime<Utc>,
}

/// Fields required to register a new archive.
#[derive(Clone, Debug)]
pub struct NewArchive {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_path: Option<String>,
    pub root_folder: String,
}

impl Archive {
    /// Absolute remote path for a path relative to `root_folder`.
    pub fn remote_path(&self, relative: &str) -> String {
        let root = self.root_folder.trim_end_matches('/');
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() {
            return if root.is_empty() { "/".into() } else { root.into() };
        }
        format!("{root}/{relative}")
    }

    /// Per-job scratch directory used while extracting members on the server.
    pub fn scratch_dir(&self, job_id: Uuid) -> String {
        self.remote_path(&format!("tmp/{job_id}"))
    }
}
