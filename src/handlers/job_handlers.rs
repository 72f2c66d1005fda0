//! Read-only views of background jobs and bundles.

use crate::{
    errors::AppError,
    models::{
        bundle::Bundle,
        job::{Job, JobStatus},
    },
    routes::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Serialize)]
pub struct JobsResponse {
    /// Jobs in `running` state per kind; the number admission control sees.
    pub running: BTreeMap<String, usize>,
    pub jobs: Vec<Job>,
}

/// `GET /jobs`
pub async fn list_jobs(State(state): State<AppState>) -> Result<Json<JobsResponse>, AppError> {
    let jobs = state.catalog.active_jobs().await?;
    let mut running = BTreeMap::new();
    for job in jobs.iter().filter(|j| j.status == JobStatus::Running) {
        *running.entry(job.kind.to_string()).or_insert(0) += 1;
    }
    Ok(Json(JobsResponse { running, jobs }))
}

/// `GET /bundles/{name}`
pub async fn get_bundle(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Bundle>, AppError> {
    Ok(Json(state.catalog.fetch_bundle_by_name(&name).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, models::job::JobKind, services::catalog::Catalog};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn state() -> AppState {
        AppState {
            catalog: Catalog::new(Arc::new(db::memory_pool().await)),
            staging_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn jobs_are_counted_per_kind() {
        let state = state().await;
        for kind in [JobKind::Retrieve, JobKind::Retrieve, JobKind::Upload] {
            state.catalog.insert_job(Uuid::new_v4(), kind, None).await.unwrap();
        }

        let Json(body) = list_jobs(State(state)).await.unwrap();
        assert_eq!(body.jobs.len(), 3);
        assert_eq!(body.running.get("retrieve"), Some(&2));
        assert_eq!(body.running.get("upload"), Some(&1));
    }

    #[tokio::test]
    async fn unknown_bundle_is_404() {
        let state = state().await;
        let err = get_bundle(State(state), Path("missing".into())).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
