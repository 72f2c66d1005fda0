//! SQLite pool setup and schema migration.

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr};

const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Open a pool for `database_url`, creating the database file (and its parent
/// directory) when missing.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if !db_path.starts_with(":memory:") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

/// Run the embedded schema statement by statement.
pub async fn run_migrations(db: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

/// In-memory database with the schema applied, for tests.
#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = connect("sqlite::memory:", 1).await.expect("memory pool");
    run_migrations(&pool).await.expect("migrations");
    pool
}
