#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};
use tape_archiver::{
    config::AppConfig,
    db,
    errors::{ArchiveError, ArchiveResult},
    models::{
        archive::{Archive, NewArchive},
        media_file::{MediaFile, NewMediaFile},
    },
    services::{
        archiver::Archiver,
        bag::JsonSnapshot,
        catalog::Catalog,
        splitter::{BYTES_PER_GB, SequentialGrouper},
        transport::{
            CommandClient, CommandOutput, Connector, DirClient, Remote, TransferClient,
        },
    },
};
use tempfile::TempDir;

/// In-memory stand-in for the archive host.
#[derive(Default)]
pub struct RemoteState {
    /// Files present on the archive, by absolute path.
    pub files: HashMap<String, Vec<u8>>,
    /// Tokens returned by successive listing calls; `(REG)` once drained.
    pub tokens: VecDeque<&'static str>,
    /// `tar tvf` output.
    pub tar_listing: Vec<String>,
    /// Basenames whose download fails.
    pub fail_download: HashSet<String>,
    pub fail_upload: bool,
    pub fail_rm: bool,
    pub commands: Vec<String>,
    pub dirs: Vec<String>,
    pub connects: usize,
    pub closes: usize,
}

impl RemoteState {
    pub fn issued(&self, prefix: &str) -> Vec<String> {
        self.commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct MockConnector {
    pub state: Arc<Mutex<RemoteState>>,
}

impl MockConnector {
    pub fn with<R>(&self, f: impl FnOnce(&mut RemoteState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

pub struct MockSession {
    state: Arc<Mutex<RemoteState>>,
}

#[async_trait]
impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self, _archive: &Archive) -> ArchiveResult<MockSession> {
        self.state.lock().unwrap().connects += 1;
        Ok(MockSession {
            state: self.state.clone(),
        })
    }
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        status: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn failed(status: u32, stderr: &str) -> CommandOutput {
    CommandOutput {
        status,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

#[async_trait]
impl CommandClient for MockSession {
    async fn exec(&mut self, command: &str) -> ArchiveResult<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_string());

        let out = if let Some(path) = command.strip_prefix("dmls -l ") {
            if state.files.contains_key(path) {
                let token = state.tokens.pop_front().unwrap_or("(REG)");
                ok(format!("-rw-r--r-- 1 svc svc 42 May  1 12:00 {path} {token}\n"))
            } else {
                failed(1, "no such file")
            }
        } else if command.starts_with("tar tvf ") {
            ok(state.tar_listing.join("\n"))
        } else if command.starts_with("rm -rf ") {
            ok("")
        } else if let Some(path) = command.strip_prefix("rm ") {
            if state.fail_rm {
                failed(1, "rm: cannot remove: Permission denied")
            } else {
                state.files.remove(path);
                ok("")
            }
        } else {
            ok("")
        };
        Ok(out)
    }
}

#[async_trait]
impl DirClient for MockSession {
    async fn mkdir_p(&mut self, path: &str) -> ArchiveResult<()> {
        self.state.lock().unwrap().dirs.push(path.to_string());
        Ok(())
    }
}

#[async_trait]
impl TransferClient for MockSession {
    async fn upload(&mut self, local: &Path, remote: &str) -> ArchiveResult<u64> {
        if self.state.lock().unwrap().fail_upload {
            return Err(ArchiveError::Transport("connection reset".into()));
        }
        let body = tokio::fs::read(local).await?;
        let len = body.len() as u64;
        self.state.lock().unwrap().files.insert(remote.to_string(), body);
        Ok(len)
    }

    async fn download(&mut self, remote: &str, local: &Path) -> ArchiveResult<u64> {
        let basename = remote.rsplit('/').next().unwrap_or(remote).to_string();
        if self.state.lock().unwrap().fail_download.contains(&basename) {
            return Err(ArchiveError::Transport(format!("scp of {remote} failed")));
        }
        let body = format!("restored {basename}");
        tokio::fs::write(local, &body).await?;
        Ok(body.len() as u64)
    }
}

#[async_trait]
impl Remote for MockSession {
    async fn close(&mut self) {
        self.state.lock().unwrap().closes += 1;
    }
}

pub struct Harness {
    pub archiver: Archiver<MockConnector>,
    pub catalog: Catalog,
    pub remote: MockConnector,
    pub archive: Archive,
    pub storage: TempDir,
    pub staging: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_group_size(100.0).await
    }

    pub async fn with_group_size(max_group_gb: f64) -> Self {
        let pool = db::connect("sqlite::memory:", 1).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let catalog = Catalog::new(Arc::new(pool));

        let storage = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let config = AppConfig {
            storage_dir: storage.path().to_path_buf(),
            staging_dir: staging.path().to_path_buf(),
            min_archive_size_gb: 5.0,
            max_archive_size_gb: max_group_gb,
            backoff_min: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            max_job_retries: 1,
            job_heartbeat: Duration::from_millis(20),
            ..AppConfig::default()
        };

        let archive = catalog
            .insert_archive(NewArchive {
                address: "archive.test".into(),
                port: 22,
                username: "svc".into(),
                password: Some("secret".into()),
                key_path: None,
                root_folder: "/tape".into(),
            })
            .await
            .unwrap();

        let remote = MockConnector::default();
        let archiver = Archiver::new(
            catalog.clone(),
            Arc::new(config),
            Arc::new(remote.clone()),
            Arc::new(JsonSnapshot),
            Arc::new(SequentialGrouper { max_group_gb }),
        );

        Self {
            archiver,
            catalog,
            remote,
            archive,
            storage,
            staging,
        }
    }

    /// Register a media file of `size_gb` (catalog size) and write a small
    /// body for it under the storage root.
    pub async fn add_file(&self, relative_path: &str, size_gb: f64, day: u32) -> MediaFile {
        let path = self.storage.path().join(relative_path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("payload of {relative_path}")).unwrap();

        self.catalog
            .insert_media_file(NewMediaFile {
                project_id: "ABC".into(),
                device_type: "Camera".into(),
                deployment_id: Some("dep-1".into()),
                relative_path: relative_path.into(),
                size_bytes: (size_gb * BYTES_PER_GB) as i64,
                recording_dt: Utc.with_ymd_and_hms(2024, 5, day, 9, 0, 0).unwrap(),
            })
            .await
            .unwrap()
    }
}
