//! Job bookkeeping, admission control and the retry policy applied when a
//! job fails.
//!
//! A running job refreshes its heartbeat every [`JobRunner::heartbeat`].
//! Rows whose heartbeat is older than [`STALE_BEATS`] intervals belong to a
//! dead owner and are ignored by admission.
//!
//! `AlreadyStaging` and `TooManyJobs` are retried without an attempt limit;
//! the delay grows exponentially with jitter and is capped. Anything else
//! gets a bounded number of retries.

use crate::{
    errors::{ArchiveError, ArchiveResult, RetrySignal},
    models::job::{JobKind, JobStatus},
    services::catalog::Catalog,
};
use chrono::{DateTime, Utc};
use std::{future::Future, time::Duration};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Missed heartbeats after which a job counts as dead.
pub const STALE_BEATS: u32 = 3;

/// Oldest heartbeat still considered alive.
pub fn live_since(heartbeat: Duration) -> DateTime<Utc> {
    let window = chrono::Duration::from_std(heartbeat * STALE_BEATS)
        .unwrap_or_else(|_| chrono::Duration::days(1));
    Utc::now() - window
}

/// Fail with [`ArchiveError::TooManyJobs`] when `max_concurrent` other live
/// jobs of `kind` are already running.
///
/// This is a check, not a reservation: two jobs starting together can both
/// pass it.
pub async fn admit(
    catalog: &Catalog,
    kind: JobKind,
    max_concurrent: usize,
    job_id: Uuid,
    heartbeat: Duration,
) -> ArchiveResult<()> {
    let active = catalog
        .count_running(kind, job_id, live_since(heartbeat))
        .await?;
    if active + 1 > max_concurrent {
        return Err(ArchiveError::TooManyJobs {
            kind: kind.to_string(),
            active,
            max: max_concurrent,
        });
    }
    Ok(())
}

/// Exponential backoff between `min` and `max`, with jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Upper bound of the delay before retry number `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let min_ms = self.min.as_millis().max(1) as u64;
        let max_ms = (self.max.as_millis() as u64).max(min_ms);
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        Duration::from_millis(min_ms.saturating_mul(factor).min(max_ms))
    }

    /// A random delay in `[min, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let floor = self.min.as_millis() as u64;
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        let span = ceiling.saturating_sub(floor);
        let jitter = if span == 0 {
            0
        } else {
            rand::random::<u64>() % (span + 1)
        };
        Duration::from_millis(floor + jitter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Distinguished condition; wait and try again, no attempt limit.
    BackOff(Duration),
    /// Ordinary failure with retries left.
    Retry(Duration),
    GiveUp,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// Retries allowed for ordinary failures.
    pub max_retries: u32,
}

impl RetryPolicy {
    /// `signal_attempts` counts previous back-offs on distinguished errors,
    /// `failures` counts previous ordinary failures.
    pub fn decide(&self, err: &ArchiveError, signal_attempts: u32, failures: u32) -> RetryDecision {
        if err.retry_signal().is_some() {
            RetryDecision::BackOff(self.backoff.delay(signal_attempts))
        } else if failures < self.max_retries {
            RetryDecision::Retry(self.backoff.delay(failures))
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// How one job should be run.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub kind: JobKind,
    pub subject: String,
    /// Admission limit for jobs of this kind; `None` skips the check.
    pub max_concurrent: Option<usize>,
    pub policy: RetryPolicy,
}

#[derive(Clone)]
pub struct JobRunner {
    pub catalog: Catalog,
    pub heartbeat: Duration,
}

/// Background heartbeat for one job; stops when dropped.
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(catalog: Catalog, job_id: Uuid, every: Duration) -> Self {
        Self(tokio::spawn(async move {
            let every = every.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                ticker.tick().await;
                if let Err(err) = catalog.heartbeat_job(job_id).await {
                    tracing::warn!(job = %job_id, "heartbeat failed: {err}");
                }
            }
        }))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl JobRunner {
    pub fn new(catalog: Catalog, heartbeat: Duration) -> Self {
        Self { catalog, heartbeat }
    }

    /// Register a job, then run `op` under admission control until it
    /// succeeds or the policy gives up. `op` receives the job id.
    ///
    /// Any error leaving this function leaves the job row `failed`.
    pub async fn run<T, F, Fut>(&self, spec: &JobSpec, op: F) -> ArchiveResult<T>
    where
        F: FnMut(Uuid) -> Fut,
        Fut: Future<Output = ArchiveResult<T>>,
    {
        let job_id = Uuid::new_v4();
        self.catalog
            .insert_job(job_id, spec.kind, Some(&spec.subject))
            .await?;
        let _heartbeat = Heartbeat::start(self.catalog.clone(), job_id, self.heartbeat);

        let result = self.drive(job_id, spec, op).await;
        if result.is_err() {
            if let Err(err) = self.catalog.fail_job(job_id).await {
                tracing::warn!(job = %job_id, "could not mark job failed: {err}");
            }
        }
        result
    }

    async fn drive<T, F, Fut>(&self, job_id: Uuid, spec: &JobSpec, mut op: F) -> ArchiveResult<T>
    where
        F: FnMut(Uuid) -> Fut,
        Fut: Future<Output = ArchiveResult<T>>,
    {
        let mut signal_attempts = 0u32;
        let mut failures = 0u32;
        loop {
            let attempt = signal_attempts + failures;
            self.catalog
                .update_job(job_id, JobStatus::Running, attempt)
                .await?;

            let result = match spec.max_concurrent {
                Some(max) => {
                    match admit(&self.catalog, spec.kind, max, job_id, self.heartbeat).await {
                        Ok(()) => op(job_id).await,
                        Err(err) => Err(err),
                    }
                }
                None => op(job_id).await,
            };

            let err = match result {
                Ok(value) => {
                    if let Err(err) = self
                        .catalog
                        .update_job(job_id, JobStatus::Finished, attempt)
                        .await
                    {
                        tracing::warn!(job = %job_id, "could not mark job finished: {err}");
                    }
                    tracing::info!(job = %job_id, kind = %spec.kind, subject = %spec.subject, outcome = "ok", "job finished");
                    return Ok(value);
                }
                Err(err) => err,
            };

            match spec.policy.decide(&err, signal_attempts, failures) {
                RetryDecision::BackOff(delay) => {
                    let reason = match err.retry_signal() {
                        Some(RetrySignal::AlreadyStaging) => "already staging",
                        _ => "too many concurrent jobs",
                    };
                    tracing::info!(
                        job = %job_id,
                        kind = %spec.kind,
                        subject = %spec.subject,
                        attempt = signal_attempts + 1,
                        delay_secs = delay.as_secs_f64(),
                        "{reason}, backing off"
                    );
                    signal_attempts += 1;
                    self.catalog
                        .update_job(job_id, JobStatus::Backoff, attempt)
                        .await?;
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Retry(delay) => {
                    tracing::warn!(
                        job = %job_id,
                        kind = %spec.kind,
                        subject = %spec.subject,
                        retry = failures + 1,
                        max_retries = spec.policy.max_retries,
                        delay_secs = delay.as_secs_f64(),
                        "job failed, scheduling retry: {err}"
                    );
                    failures += 1;
                    self.catalog
                        .update_job(job_id, JobStatus::Backoff, attempt)
                        .await?;
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    tracing::error!(
                        job = %job_id,
                        kind = %spec.kind,
                        subject = %spec.subject,
                        outcome = "failed",
                        "job failed: {err}"
                    );
                    return Err(err);
                }
            }
        }
    }
}
