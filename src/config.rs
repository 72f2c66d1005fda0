use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr, time::Duration};
use uuid::Uuid;

use crate::services::{
    jobs::{Backoff, RetryPolicy},
    retrieval::DEFAULT_EXTRACT_CHUNK,
    tape::TapeCommands,
};

const ENV_PREFIX: &str = "TAPE_ARCHIVER_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Local media root; media files and packed bundles live beneath it.
    pub storage_dir: PathBuf,
    /// Scratch space for bag and metadata artifacts while packing.
    pub staging_dir: PathBuf,
    pub min_archive_size_gb: f64,
    /// Target size handed to the grouper.
    pub max_archive_size_gb: f64,
    pub list_cmd: String,
    pub stage_cmd: String,
    pub extract_chunk_size: usize,
    pub max_concurrent_retrievals: usize,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Retries for ordinary job failures.
    pub max_job_retries: u32,
    /// How often a running job refreshes its heartbeat.
    pub job_heartbeat: Duration,
    pub known_hosts: Option<String>,
    /// Archive used by `serve` and by commands run without `--archive`.
    pub archive_id: Option<Uuid>,
    pub archive_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            database_url: "sqlite://./data/meta/tape_archiver.db".into(),
            storage_dir: PathBuf::from("./data/media"),
            staging_dir: PathBuf::from("./data/staging"),
            min_archive_size_gb: 5.0,
            max_archive_size_gb: 100.0,
            list_cmd: "dmls -l".into(),
            stage_cmd: "dmget".into(),
            extract_chunk_size: DEFAULT_EXTRACT_CHUNK,
            max_concurrent_retrievals: 4,
            backoff_min: Duration::from_secs(30),
            backoff_max: Duration::from_secs(1800),
            max_job_retries: 3,
            job_heartbeat: Duration::from_secs(30),
            known_hosts: None,
            archive_id: None,
            archive_interval: Duration::from_secs(3600),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Tape archive orchestration for sensor media")]
pub struct Args {
    /// Database URL (overrides TAPE_ARCHIVER_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Local media root (overrides TAPE_ARCHIVER_STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<PathBuf>,

    /// Bag staging root (overrides TAPE_ARCHIVER_STAGING_DIR)
    #[arg(long, global = true)]
    pub staging_dir: Option<PathBuf>,

    /// Minimum bundle size in GB (overrides TAPE_ARCHIVER_MIN_ARCHIVE_SIZE_GB)
    #[arg(long, global = true)]
    pub min_archive_size_gb: Option<f64>,

    /// Known hosts file (overrides TAPE_ARCHIVER_KNOWN_HOSTS)
    #[arg(long, global = true)]
    pub known_hosts: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run migrations and exit
    Migrate,
    /// Register a remote archive target
    AddArchive {
        #[arg(long)]
        address: String,
        #[arg(long, default_value_t = 22)]
        port: u16,
        #[arg(long)]
        username: String,
        /// Password; read from TAPE_ARCHIVER_ARCHIVE_PASSWORD when omitted
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        key_path: Option<String>,
        #[arg(long)]
        root_folder: String,
    },
    /// Split and pack one project/device-type pool, then upload the bundles
    Pack {
        #[arg(long)]
        project: String,
        #[arg(long)]
        device_type: String,
        #[arg(long)]
        archive: Option<Uuid>,
    },
    /// Run `pack` for every pool with unassigned files
    ArchiveAll {
        #[arg(long)]
        archive: Option<Uuid>,
    },
    /// Upload a packed bundle
    Upload {
        #[arg(long)]
        bundle: String,
    },
    /// Retrieve files from a bundle into local storage
    Retrieve {
        #[arg(long)]
        bundle: String,
        /// Media file names to bring back
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Report the tape status of a bundle without staging it
    Status {
        #[arg(long)]
        bundle: String,
    },
    /// Delete a bundle locally and remotely
    DeleteBundle {
        #[arg(long)]
        bundle: String,
    },
    /// Serve probe endpoints and archive periodically
    Serve {
        /// Host to bind to (overrides TAPE_ARCHIVER_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to (overrides TAPE_ARCHIVER_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        let args = Args::parse();
        let mut cfg = Self::from_env()?;

        // --- Merge ---
        if let Some(url) = args.database_url {
            cfg.database_url = url;
        }
        if let Some(dir) = args.storage_dir {
            cfg.storage_dir = dir;
        }
        if let Some(dir) = args.staging_dir {
            cfg.staging_dir = dir;
        }
        if let Some(gb) = args.min_archive_size_gb {
            cfg.min_archive_size_gb = gb;
        }
        if args.known_hosts.is_some() {
            cfg.known_hosts = args.known_hosts;
        }
        if let Command::Serve { host, port } = &args.command {
            if let Some(host) = host {
                cfg.host = host.clone();
            }
            if let Some(port) = port {
                cfg.port = *port;
            }
        }

        Ok((cfg, args.command))
    }

    /// Defaults overridden by `TAPE_ARCHIVER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            host: env_string("HOST").unwrap_or(d.host),
            port: env_parse("PORT")?.unwrap_or(d.port),
            database_url: env_string("DATABASE_URL").unwrap_or(d.database_url),
            storage_dir: env_string("STORAGE_DIR").map(PathBuf::from).unwrap_or(d.storage_dir),
            staging_dir: env_string("STAGING_DIR").map(PathBuf::from).unwrap_or(d.staging_dir),
            min_archive_size_gb: env_parse("MIN_ARCHIVE_SIZE_GB")?.unwrap_or(d.min_archive_size_gb),
            max_archive_size_gb: env_parse("MAX_ARCHIVE_SIZE_GB")?.unwrap_or(d.max_archive_size_gb),
            list_cmd: env_string("LIST_CMD").unwrap_or(d.list_cmd),
            stage_cmd: env_string("STAGE_CMD").unwrap_or(d.stage_cmd),
            extract_chunk_size: env_parse("EXTRACT_CHUNK_SIZE")?.unwrap_or(d.extract_chunk_size),
            max_concurrent_retrievals: env_parse("MAX_CONCURRENT_RETRIEVALS")?
                .unwrap_or(d.max_concurrent_retrievals),
            backoff_min: env_parse("BACKOFF_MIN_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.backoff_min),
            backoff_max: env_parse("BACKOFF_MAX_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.backoff_max),
            max_job_retries: env_parse("MAX_JOB_RETRIES")?.unwrap_or(d.max_job_retries),
            job_heartbeat: env_parse("JOB_HEARTBEAT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.job_heartbeat),
            known_hosts: env_string("KNOWN_HOSTS").or(d.known_hosts),
            archive_id: env_parse("ARCHIVE_ID")?.or(d.archive_id),
            archive_interval: env_parse("ARCHIVE_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.archive_interval),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tape_commands(&self) -> TapeCommands {
        TapeCommands {
            list_cmd: self.list_cmd.clone(),
            stage_cmd: self.stage_cmd.clone(),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            min: self.backoff_min,
            max: self.backoff_max,
        }
    }

    /// Policy for jobs whose failures may be retried.
    pub fn job_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: self.backoff(),
            max_retries: self.max_job_retries,
        }
    }

    /// Packing releases its files on failure, so a failed pack is final.
    pub fn pack_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: self.backoff(),
            max_retries: 0,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{key}")).ok()
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let name = format!("{ENV_PREFIX}{key}");
    match env::var(&name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {name}")),
    }
}
