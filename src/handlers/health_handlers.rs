//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the catalog and the staging disk

use crate::routes::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Liveness probe. Always 200, never touches the catalog or disk.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs a lightweight query against the catalog (`SELECT 1`).
/// 2. Writes, reads back and deletes a file in the staging directory, where
///    bags are assembled before packing.
///
/// HTTP 200 when both checks pass, 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = HashMap::new();
    checks.insert("sqlite", check_catalog(&state).await);
    checks.insert("staging_disk", check_disk(&state.staging_dir).await);

    let ready = checks.values().all(|c| c.ok);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" }.into(),
        checks,
    };
    (status, Json(body))
}

async fn check_catalog(state: &AppState) -> CheckStatus {
    match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.catalog.db)
        .await
    {
        Ok(1) => CheckStatus::pass(),
        Ok(v) => CheckStatus::fail(format!("unexpected result: {v}")),
        Err(e) => CheckStatus::fail(format!("error: {e}")),
    }
}

async fn check_disk(dir: &Path) -> CheckStatus {
    let probe = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&probe, b"readyz").await {
        return CheckStatus::fail(format!("could not write probe file: {e}"));
    }
    let status = match fs::read(&probe).await {
        Ok(bytes) if bytes == b"readyz" => CheckStatus::pass(),
        Ok(_) => CheckStatus::fail("probe file content mismatch"),
        Err(e) => CheckStatus::fail(format!("could not read probe file: {e}")),
    };
    match fs::remove_file(&probe).await {
        Err(e) if status.ok => CheckStatus {
            ok: true,
            error: Some(format!("could not remove probe file: {e}")),
        },
        _ => status,
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn pass() -> Self {
        Self { ok: true, error: None }
    }

    fn fail(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}
