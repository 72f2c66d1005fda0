//! Catalog: durable metadata for archives, bundles, media files and jobs,
//! backed by SQLite. All flag transitions of the archival lifecycle go
//! through here.

use crate::{
    errors::{ArchiveError, ArchiveResult},
    models::{
        archive::{Archive, NewArchive},
        bundle::{Bundle, NewBundle},
        job::{Job, JobKind, JobStatus},
        media_file::{ArchiveStatus, MediaFile, NewMediaFile},
    },
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

const MEDIA_FILE_COLUMNS: &str = "id, project_id, device_type, deployment_id, name, relative_path, \
     size_bytes, recording_dt, local_storage, archive_status, claim_id, bundle_id";

const BUNDLE_COLUMNS: &str =
    "id, archive_id, name, path, local_storage, uploading, archived, created_at";

#[derive(Clone)]
pub struct Catalog {
    pub db: Arc<SqlitePool>,
}

impl Catalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    // --- archives ---

    pub async fn insert_archive(&self, new: NewArchive) -> ArchiveResult<Archive> {
        let archive = Archive {
            id: Uuid::new_v4(),
            address: new.address,
            port: new.port,
            username: new.username,
            password: new.password,
            key_path: new.key_path,
            root_folder: new.root_folder,
            created_at: Utc::now(),
        };

        match sqlx::query(
            "INSERT INTO archives (id, address, port, username, password, key_path, root_folder, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(archive.id)
        .bind(&archive.address)
        .bind(archive.port)
        .bind(&archive.username)
        .bind(&archive.password)
        .bind(&archive.key_path)
        .bind(&archive.root_folder)
        .bind(archive.created_at)
        .execute(&*self.db)
        .await
        {
            Ok(_) => Ok(archive),
            Err(err) if is_unique_violation(&err) => Err(ArchiveError::ArchiveExists {
                address: archive.address,
                root_folder: archive.root_folder,
                username: archive.username,
            }),
            Err(err) => Err(ArchiveError::Sqlx(err)),
        }
    }

    pub async fn fetch_archive(&self, id: Uuid) -> ArchiveResult<Archive> {
        sqlx::query_as::<_, Archive>(
            "SELECT id, address, port, username, password, key_path, root_folder, created_at
             FROM archives WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => ArchiveError::ArchiveNotFound(id.to_string()),
            other => ArchiveError::Sqlx(other),
        })
    }

    // --- bundles ---

    pub async fn insert_bundle(&self, new: NewBundle) -> ArchiveResult<Bundle> {
        let bundle = Bundle {
            id: Uuid::new_v4(),
            archive_id: new.archive_id,
            name: new.name,
            path: new.path,
            local_storage: true,
            uploading: false,
            archived: false,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO bundles (id, archive_id, name, path, local_storage, uploading, archived, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(bundle.id)
        .bind(bundle.archive_id)
        .bind(&bundle.name)
        .bind(&bundle.path)
        .bind(bundle.local_storage)
        .bind(bundle.uploading)
        .bind(bundle.archived)
        .bind(bundle.created_at)
        .execute(&*self.db)
        .await?;

        Ok(bundle)
    }

    pub async fn fetch_bundle(&self, id: Uuid) -> ArchiveResult<Bundle> {
        sqlx::query_as::<_, Bundle>(&format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE id = ?"))
            .bind(id)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => ArchiveError::BundleNotFound(id.to_string()),
                other => ArchiveError::Sqlx(other),
            })
    }

    pub async fn fetch_bundle_by_name(&self, name: &str) -> ArchiveResult<Bundle> {
        sqlx::query_as::<_, Bundle>(&format!(
            "SELECT {BUNDLE_COLUMNS} FROM bundles WHERE name = ?"
        ))
        .bind(name)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => ArchiveError::BundleNotFound(name.to_string()),
            other => ArchiveError::Sqlx(other),
        })
    }

    /// Compare-and-set the upload guard. Returns `false` when another upload
    /// holds it or the bundle is already archived.
    pub async fn try_mark_uploading(&self, bundle_id: Uuid) -> ArchiveResult<bool> {
        let result = sqlx::query(
            "UPDATE bundles SET uploading = 1 WHERE id = ? AND uploading = 0 AND archived = 0",
        )
        .bind(bundle_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Release the upload guard; on success also flips the bundle and its
    /// files to archived in one transaction.
    pub async fn finish_upload(&self, bundle_id: Uuid, success: bool) -> ArchiveResult<()> {
        if !success {
            sqlx::query("UPDATE bundles SET uploading = 0 WHERE id = ?")
                .bind(bundle_id)
                .execute(&*self.db)
                .await?;
            return Ok(());
        }

        let mut tx = self.db.begin().await?;
        sqlx::query("UPDATE bundles SET uploading = 0, archived = 1 WHERE id = ?")
            .bind(bundle_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE media_files SET archive_status = ? WHERE bundle_id = ?")
            .bind(ArchiveStatus::Archived)
            .bind(bundle_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record that the remote copy is gone: the bundle is no longer archived
    /// and its files fall back to `packed`.
    pub async fn unmark_archived(&self, bundle_id: Uuid) -> ArchiveResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("UPDATE bundles SET archived = 0 WHERE id = ?")
            .bind(bundle_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE media_files SET archive_status = ? WHERE bundle_id = ? AND archive_status = ?")
            .bind(ArchiveStatus::Packed)
            .bind(bundle_id)
            .bind(ArchiveStatus::Archived)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_bundle_local_storage(&self, bundle_id: Uuid, local: bool) -> ArchiveResult<()> {
        sqlx::query("UPDATE bundles SET local_storage = ? WHERE id = ?")
            .bind(local)
            .bind(bundle_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Detach member files and drop the bundle row.
    pub async fn delete_bundle_record(&self, bundle_id: Uuid) -> ArchiveResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "UPDATE media_files SET bundle_id = NULL, claim_id = NULL, archive_status = ?
             WHERE bundle_id = ?",
        )
        .bind(ArchiveStatus::Unassigned)
        .bind(bundle_id)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM bundles WHERE id = ?")
            .bind(bundle_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ArchiveError::BundleNotFound(bundle_id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    // --- media files ---

    pub async fn insert_media_file(&self, new: NewMediaFile) -> ArchiveResult<MediaFile> {
        let name = new
            .relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&new.relative_path)
            .to_string();

        let file = sqlx::query_as::<_, MediaFile>(&format!(
            "INSERT INTO media_files (id, project_id, device_type, deployment_id, name,
                                      relative_path, size_bytes, recording_dt, local_storage,
                                      archive_status, claim_id, bundle_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, NULL, NULL)
             RETURNING {MEDIA_FILE_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&new.project_id)
        .bind(&new.device_type)
        .bind(&new.deployment_id)
        .bind(&name)
        .bind(&new.relative_path)
        .bind(new.size_bytes)
        .bind(new.recording_dt)
        .bind(ArchiveStatus::Unassigned)
        .fetch_one(&*self.db)
        .await?;

        Ok(file)
    }

    /// Claim every unassigned, locally stored file of a (project, device type)
    /// pair for one splitter run. Only rows still `unassigned` are touched, so
    /// two concurrent runs never claim the same file.
    pub async fn claim_unassigned(
        &self,
        project_id: &str,
        device_type: &str,
        claim_id: Uuid,
    ) -> ArchiveResult<u64> {
        let result = sqlx::query(
            "UPDATE media_files SET archive_status = ?, claim_id = ?
             WHERE project_id = ? AND device_type = ? AND archive_status = ?
               AND local_storage = 1 AND bundle_id IS NULL",
        )
        .bind(ArchiveStatus::Claimed)
        .bind(claim_id)
        .bind(project_id)
        .bind(device_type)
        .bind(ArchiveStatus::Unassigned)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn files_by_claim(&self, claim_id: Uuid) -> ArchiveResult<Vec<MediaFile>> {
        let files = sqlx::query_as::<_, MediaFile>(&format!(
            "SELECT {MEDIA_FILE_COLUMNS} FROM media_files
             WHERE claim_id = ? ORDER BY recording_dt ASC, relative_path ASC"
        ))
        .bind(claim_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(files)
    }

    /// Fetch files by id, preserving the order of `ids`.
    pub async fn files_by_ids(&self, ids: &[Uuid]) -> ArchiveResult<Vec<MediaFile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {MEDIA_FILE_COLUMNS} FROM media_files WHERE id IN ("
        ));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let rows: Vec<MediaFile> = builder.build_query_as().fetch_all(&*self.db).await?;
        let mut by_id: HashMap<Uuid, MediaFile> = rows.into_iter().map(|f| (f.id, f)).collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    pub async fn files_in_bundle(&self, bundle_id: Uuid) -> ArchiveResult<Vec<MediaFile>> {
        let files = sqlx::query_as::<_, MediaFile>(&format!(
            "SELECT {MEDIA_FILE_COLUMNS} FROM media_files
             WHERE bundle_id = ? ORDER BY relative_path ASC"
        ))
        .bind(bundle_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(files)
    }

    /// Return files to the splitter pool.
    pub async fn release_files(&self, ids: &[Uuid]) -> ArchiveResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE media_files SET archive_status = ");
        builder.push_bind(ArchiveStatus::Unassigned);
        builder.push(", claim_id = NULL, bundle_id = NULL WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        let result = builder.build().execute(&*self.db).await?;
        Ok(result.rows_affected())
    }

    /// Point packed files at their real bundle.
    pub async fn attach_files(&self, bundle_id: Uuid, ids: &[Uuid]) -> ArchiveResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE media_files SET archive_status = ");
        builder.push_bind(ArchiveStatus::Packed);
        builder.push(", claim_id = NULL, bundle_id = ");
        builder.push_bind(bundle_id);
        builder.push(" WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        let result = builder.build().execute(&*self.db).await?;
        Ok(result.rows_affected())
    }

    /// Persist the local-storage flag of retrieved files in one transaction.
    pub async fn mark_retrieved(&self, files: &[MediaFile]) -> ArchiveResult<()> {
        if files.is_empty() {
            return Ok(());
        }
        let mut tx = self.db.begin().await?;
        for file in files {
            sqlx::query("UPDATE media_files SET local_storage = ?, relative_path = ? WHERE id = ?")
                .bind(file.local_storage)
                .bind(&file.relative_path)
                .bind(file.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// (project, device type) pairs that still have files waiting for a bundle.
    pub async fn pending_groups(&self) -> ArchiveResult<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT DISTINCT project_id, device_type FROM media_files
             WHERE archive_status = ? AND local_storage = 1
             ORDER BY project_id, device_type",
        )
        .bind(ArchiveStatus::Unassigned)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    // --- jobs ---

    pub async fn insert_job(
        &self,
        id: Uuid,
        kind: JobKind,
        subject: Option<&str>,
    ) -> ArchiveResult<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO jobs (id, kind, status, subject, attempt, started_at, heartbeat_at)
             VALUES (?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(id)
        .bind(kind)
        .bind(JobStatus::Running)
        .bind(subject)
        .bind(now)
        .bind(now.timestamp_millis())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn update_job(&self, id: Uuid, status: JobStatus, attempt: u32) -> ArchiveResult<()> {
        let now = Utc::now();
        let finished_at = matches!(status, JobStatus::Finished | JobStatus::Failed).then_some(now);
        sqlx::query(
            "UPDATE jobs SET status = ?, attempt = ?, finished_at = ?, heartbeat_at = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(attempt as i64)
        .bind(finished_at)
        .bind(now.timestamp_millis())
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Mark a job failed without touching its attempt count.
    pub async fn fail_job(&self, id: Uuid) -> ArchiveResult<()> {
        let now = Utc::now();
        sqlx::query("UPDATE jobs SET status = ?, finished_at = ?, heartbeat_at = ? WHERE id = ?")
            .bind(JobStatus::Failed)
            .bind(now)
            .bind(now.timestamp_millis())
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Refresh the liveness marker of a job that is still in flight.
    pub async fn heartbeat_job(&self, id: Uuid) -> ArchiveResult<()> {
        sqlx::query("UPDATE jobs SET heartbeat_at = ? WHERE id = ? AND status IN (?, ?)")
            .bind(Utc::now().timestamp_millis())
            .bind(id)
            .bind(JobStatus::Running)
            .bind(JobStatus::Backoff)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Running jobs of `kind` with a heartbeat at or after `live_since`, not
    /// counting `exclude`.
    pub async fn count_running(
        &self,
        kind: JobKind,
        exclude: Uuid,
        live_since: DateTime<Utc>,
    ) -> ArchiveResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs
             WHERE kind = ? AND status = ? AND id != ? AND heartbeat_at >= ?",
        )
        .bind(kind)
        .bind(JobStatus::Running)
        .bind(exclude)
        .bind(live_since.timestamp_millis())
        .fetch_one(&*self.db)
        .await?;
        Ok(count as usize)
    }

    /// Fail in-flight jobs whose owner stopped beating before `live_since`.
    pub async fn reap_stale_jobs(&self, live_since: DateTime<Utc>) -> ArchiveResult<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, finished_at = ?
             WHERE status IN (?, ?) AND heartbeat_at < ?",
        )
        .bind(JobStatus::Failed)
        .bind(Utc::now())
        .bind(JobStatus::Running)
        .bind(JobStatus::Backoff)
        .bind(live_since.timestamp_millis())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn active_jobs(&self) -> ArchiveResult<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT id, kind, status, subject, attempt, started_at, finished_at
             FROM jobs WHERE status IN (?, ?) ORDER BY started_at ASC",
        )
        .bind(JobStatus::Running)
        .bind(JobStatus::Backoff)
        .fetch_all(&*self.db)
        .await?;
        Ok(jobs)
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use chrono::TimeZone;

    async fn catalog() -> Catalog {
        Catalog::new(Arc::new(memory_pool().await))
    }

    fn new_file(path: &str, size: i64) -> NewMediaFile {
        NewMediaFile {
            project_id: "ABC".into(),
            device_type: "Camera".into(),
            deployment_id: Some("dep-1".into()),
            relative_path: path.into(),
            size_bytes: size,
            recording_dt: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    fn new_archive() -> NewArchive {
        NewArchive {
            address: "archive.example.org".into(),
            port: 22,
            username: "svc".into(),
            password: Some("secret".into()),
            key_path: None,
            root_folder: "/tape".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_archive_triplet_is_rejected() {
        let catalog = catalog().await;
        catalog.insert_archive(new_archive()).await.unwrap();
        let err = catalog.insert_archive(new_archive()).await.unwrap_err();
        assert!(matches!(err, ArchiveError::ArchiveExists { .. }));
    }

    #[tokio::test]
    async fn claim_skips_files_already_claimed() {
        let catalog = catalog().await;
        catalog.insert_media_file(new_file("a/1.jpg", 10)).await.unwrap();
        catalog.insert_media_file(new_file("a/2.jpg", 10)).await.unwrap();

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        assert_eq!(catalog.claim_unassigned("ABC", "Camera", first).await.unwrap(), 2);
        assert_eq!(catalog.claim_unassigned("ABC", "Camera", second).await.unwrap(), 0);
        assert_eq!(catalog.files_by_claim(first).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn files_by_ids_keeps_requested_order() {
        let catalog = catalog().await;
        let a = catalog.insert_media_file(new_file("a/1.jpg", 10)).await.unwrap();
        let b = catalog.insert_media_file(new_file("a/2.jpg", 10)).await.unwrap();
        let files = catalog.files_by_ids(&[b.id, a.id]).await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["2.jpg", "1.jpg"]);
    }

    #[tokio::test]
    async fn upload_guard_is_compare_and_set() {
        let catalog = catalog().await;
        let archive = catalog.insert_archive(new_archive()).await.unwrap();
        let bundle = catalog
            .insert_bundle(NewBundle {
                archive_id: archive.id,
                name: "b".into(),
                path: "archive/b.tar.gz".into(),
            })
            .await
            .unwrap();

        assert!(catalog.try_mark_uploading(bundle.id).await.unwrap());
        assert!(!catalog.try_mark_uploading(bundle.id).await.unwrap());

        catalog.finish_upload(bundle.id, true).await.unwrap();
        let bundle = catalog.fetch_bundle(bundle.id).await.unwrap();
        assert!(bundle.archived && !bundle.uploading && bundle.local_storage);
        assert!(!catalog.try_mark_uploading(bundle.id).await.unwrap());
    }

    #[tokio::test]
    async fn running_jobs_exclude_caller_and_backoff() {
        let catalog = catalog().await;
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let sleeping = Uuid::new_v4();
        for id in [me, other, sleeping] {
            catalog.insert_job(id, JobKind::Retrieve, None).await.unwrap();
        }
        catalog.update_job(sleeping, JobStatus::Backoff, 1).await.unwrap();

        let since = Utc::now() - chrono::Duration::minutes(1);
        assert_eq!(catalog.count_running(JobKind::Retrieve, me, since).await.unwrap(), 1);
        assert_eq!(catalog.count_running(JobKind::Upload, me, since).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_jobs_are_not_counted_and_get_reaped() {
        let catalog = catalog().await;
        let dead = Uuid::new_v4();
        let alive = Uuid::new_v4();
        catalog.insert_job(dead, JobKind::Retrieve, None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let cutoff = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        catalog.insert_job(alive, JobKind::Retrieve, None).await.unwrap();

        let me = Uuid::new_v4();
        assert_eq!(catalog.count_running(JobKind::Retrieve, me, cutoff).await.unwrap(), 1);

        assert_eq!(catalog.reap_stale_jobs(cutoff).await.unwrap(), 1);
        let active: Vec<Uuid> = catalog.active_jobs().await.unwrap().iter().map(|j| j.id).collect();
        assert_eq!(active, [alive]);

        catalog.fail_job(alive).await.unwrap();
        assert!(catalog.active_jobs().await.unwrap().is_empty());
    }
}
