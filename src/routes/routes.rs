//! Routes for the `serve` probe surface.
//!
//! - `GET /healthz`: liveness
//! - `GET /readyz`: SQLite and staging-disk readiness
//! - `GET /jobs`: running and backing-off jobs, with counts per kind
//! - `GET /bundles/{name}`: catalog record of one bundle

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        job_handlers::{get_bundle, list_jobs},
    },
    services::catalog::Catalog,
};
use axum::{Router, routing::get};
use std::path::PathBuf;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Catalog,
    /// Directory probed by `/readyz` for write access.
    pub staging_dir: PathBuf,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/jobs", get(list_jobs))
        .route("/bundles/{name}", get(get_bundle))
}
