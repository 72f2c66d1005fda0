use anyhow::{Context, Result, bail};
use std::{env, fs, io::ErrorKind, sync::Arc};
use tape_archiver::{
    config::{AppConfig, Command},
    db,
    errors::ArchiveError,
    models::{archive::NewArchive, bundle::Bundle},
    routes::{self, AppState},
    services::{
        archiver::Archiver, bag::JsonSnapshot, catalog::Catalog, jobs, splitter::SequentialGrouper,
        transport::ssh::SshConnector,
    },
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (cfg, command) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting tape-archiver with config: {:?}", cfg);

    for dir in [&cfg.storage_dir, &cfg.staging_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            tracing::info!("Created directory at {}", dir.display());
        }
    }

    let pool = db::connect(&cfg.database_url, 5)
        .await
        .with_context(|| format!("opening database {}", cfg.database_url))?;

    if let Command::Migrate = command {
        db::run_migrations(&pool).await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let catalog = Catalog::new(Arc::new(pool));
    let reaped = catalog
        .reap_stale_jobs(jobs::live_since(cfg.job_heartbeat))
        .await?;
    if reaped > 0 {
        tracing::warn!(reaped, "marked abandoned jobs failed");
    }
    let cfg = Arc::new(cfg);
    let archiver = Archiver::new(
        catalog.clone(),
        cfg.clone(),
        Arc::new(SshConnector::new(cfg.known_hosts.as_deref())?),
        Arc::new(JsonSnapshot),
        Arc::new(SequentialGrouper {
            max_group_gb: cfg.max_archive_size_gb,
        }),
    );

    match command {
        Command::Migrate => {}
        Command::AddArchive {
            address,
            port,
            username,
            password,
            key_path,
            root_folder,
        } => {
            let password = password.or_else(|| env::var("TAPE_ARCHIVER_ARCHIVE_PASSWORD").ok());
            if password.is_none() && key_path.is_none() {
                bail!("an archive needs --password or --key-path");
            }
            let archive = catalog
                .insert_archive(NewArchive {
                    address,
                    port,
                    username,
                    password,
                    key_path,
                    root_folder,
                })
                .await?;
            tracing::info!(archive = %archive.id, "archive registered");
            print_json(&archive)?;
        }
        Command::Pack {
            project,
            device_type,
            archive,
        } => {
            let archive_id = archive_id(archive, &cfg)?;
            let bundles = archiver
                .archive_group(archive_id, &project, &device_type)
                .await?;
            print_json(&bundles)?;
        }
        Command::ArchiveAll { archive } => {
            let bundles = archiver.archive_all(archive_id(archive, &cfg)?).await?;
            print_json(&bundles)?;
        }
        Command::Upload { bundle } => {
            let bundle = resolve_bundle(&catalog, &bundle).await?;
            print_json(&archiver.upload_bundle(bundle.id).await?)?;
        }
        Command::Retrieve { bundle, files } => {
            let bundle = resolve_bundle(&catalog, &bundle).await?;
            let retrieved = archiver.retrieve(bundle.id, &files).await?;
            print_json(&retrieved)?;
        }
        Command::Status { bundle } => {
            let bundle = resolve_bundle(&catalog, &bundle).await?;
            let (path, status) = archiver.bundle_status(bundle.id).await?;
            println!("{path}\t{status}");
        }
        Command::DeleteBundle { bundle } => {
            let bundle = resolve_bundle(&catalog, &bundle).await?;
            archiver.delete_bundle(bundle.id).await?;
        }
        Command::Serve { .. } => serve(archiver, catalog, cfg).await?,
    }

    Ok(())
}

async fn serve(archiver: Archiver<SshConnector>, catalog: Catalog, cfg: Arc<AppConfig>) -> Result<()> {
    match cfg.archive_id {
        Some(archive_id) => {
            let interval = cfg.archive_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    match archiver.archive_all(archive_id).await {
                        Ok(bundles) => tracing::info!(bundles = bundles.len(), "periodic archive run finished"),
                        Err(err) => tracing::error!("periodic archive run failed: {err}"),
                    }
                }
            });
        }
        None => tracing::warn!("no archive configured; periodic archiving disabled"),
    }

    let app = routes::routes().with_state(AppState {
        catalog,
        staging_dir: cfg.staging_dir.clone(),
    });

    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

fn archive_id(flag: Option<Uuid>, cfg: &AppConfig) -> Result<Uuid> {
    flag.or(cfg.archive_id)
        .context("no archive given; pass --archive or set TAPE_ARCHIVER_ARCHIVE_ID")
}

/// Accept either a bundle id or a bundle name.
async fn resolve_bundle(catalog: &Catalog, key: &str) -> Result<Bundle, ArchiveError> {
    match Uuid::parse_str(key) {
        Ok(id) => catalog.fetch_bundle(id).await,
        Err(_) => catalog.fetch_bundle_by_name(key).await,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
