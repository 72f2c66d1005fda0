//! Bookkeeping rows for background jobs running against an archive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Pack,
    Upload,
    Retrieve,
    Delete,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobKind::Pack => "pack",
            JobKind::Upload => "upload",
            JobKind::Retrieve => "retrieve",
            JobKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    /// Sleeping between attempts; does not count against admission.
    Backoff,
    Finished,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Bundle name or group the job works on, for diagnostics.
    pub subject: Option<String>,
    pub attempt: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
