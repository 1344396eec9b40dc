//! Dispatcher (C8): the worker pool that claims ready jobs, runs them
//! through the [`TaskOrchestrator`], and applies the retry/backoff state
//! machine to the outcome. A background janitor expires jobs that have
//! outlived their deadline before anyone claimed them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::batch::BatchRegistry;
use crate::config::AppConfig;
use crate::error::OrchestratorError;
use crate::model::{Job, JobStatus, Tenant};
use crate::orchestrator::TaskOrchestrator;
use crate::ratelimit::RateLimiter;
use crate::stats::StatsAggregator;
use crate::store::{ReadyQueueEntry, TenantConn, TenantStore};

pub struct Dispatcher {
    store: Arc<dyn TenantStore>,
    orchestrator: Arc<TaskOrchestrator>,
    batches: Arc<BatchRegistry>,
    stats: Arc<StatsAggregator>,
    ratelimit: Arc<RateLimiter>,
    config: AppConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TenantStore>,
        orchestrator: Arc<TaskOrchestrator>,
        batches: Arc<BatchRegistry>,
        stats: Arc<StatsAggregator>,
        ratelimit: Arc<RateLimiter>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            batches,
            stats,
            ratelimit,
            config,
        }
    }

    /// Spawns the configured number of worker loops plus one janitor. The
    /// caller holds the returned handles for graceful shutdown.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = (0..self.config.dispatcher_workers)
            .map(|id| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.worker_loop(id).await })
            })
            .collect();
        handles.push(self.spawn_janitor());
        handles
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            match self.try_claim_and_run().await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::time::sleep(Duration::from_millis(self.config.dispatcher_idle_poll_ms)).await;
                }
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "dispatcher worker iteration failed");
                    tokio::time::sleep(Duration::from_millis(self.config.dispatcher_idle_poll_ms)).await;
                }
            }
        }
    }

    /// Scans the ready queue for the best eligible candidate — priority
    /// first, then FIFO — skipping any whose tenant/marketplace cap is
    /// currently exhausted. Returns `true` if a job was
    /// claimed and run. Public so tests and operator tooling can single-step
    /// the dispatcher without spinning up the background worker loop.
    pub async fn try_claim_and_run(&self) -> Result<bool, OrchestratorError> {
        let now_ms = crate::time::now_ms() as i64;
        let candidates = self.store.candidate_ready(now_ms, 32).await?;

        for candidate in candidates {
            let tenant = Tenant::new(candidate.tenant_id.clone());
            if self
                .ratelimit
                .check_and_increment(&tenant, candidate.marketplace)
                .is_err()
            {
                continue;
            }

            let conn = self.store.bind(&tenant).await?;
            if !self.store.claim_job(&conn, candidate.job_id).await? {
                // Another worker won the race; try the next candidate.
                continue;
            }

            self.run_claimed_job(&conn, candidate.job_id).await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn run_claimed_job(&self, conn: &TenantConn, job_id: Uuid) -> Result<(), OrchestratorError> {
        let job = self
            .store
            .get_job(conn, job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id}")))?;

        let span = crate::logger::child_span("run_claimed_job");
        {
            let _enter = span.enter();
            crate::logger::annotate_span(job.tenant.as_str(), Some(&job.id));
        }

        let start = Instant::now();
        let outcome = crate::logger::warn_if_slow(
            "execute_job",
            Duration::from_millis(self.config.slow_job_warn_ms),
            self.orchestrator.execute_job(conn, &job).instrument(span),
        )
        .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => self.finish_success(conn, job, duration_ms).await,
            Err(e) => self.finish_failure(conn, job, e, duration_ms).await,
        }
    }

    async fn finish_success(&self, conn: &TenantConn, mut job: Job, duration_ms: u64) -> Result<(), OrchestratorError> {
        job.status = JobStatus::Completed;
        job.completed_at = Some(crate::time::now_utc());
        job.error_message = None;
        self.store.update_job(conn, &job).await?;
        self.store.dequeue_ready(job.id).await?;
        self.stats
            .record(conn, &job.action_code, job.marketplace, true, duration_ms)
            .await?;
        if let Some(batch_id) = job.batch_id {
            self.batches.rollup(conn, batch_id).await?;
        }
        Ok(())
    }

    async fn finish_failure(
        &self,
        conn: &TenantConn,
        mut job: Job,
        err: OrchestratorError,
        duration_ms: u64,
    ) -> Result<(), OrchestratorError> {
        if matches!(err, OrchestratorError::Cancelled) {
            // An operator cancelled the job while this task was in flight
            // (orchestrator::execute_job::Cancelled). The job row's terminal
            // status was already written by whoever cancelled it; the tasks
            // still sitting in `pending` were not, since `execute_job` only
            // stopped advancing the pipeline — cascade that cancellation now
            // ("cascades to all pending child tasks").
            self.store.cancel_pending_tasks_for_job(conn, job.id).await?;
            self.store.dequeue_ready(job.id).await?;
            if let Some(batch_id) = job.batch_id {
                self.batches.rollup(conn, batch_id).await?;
            }
            return Ok(());
        }

        let retryable = should_retry(err.is_retryable(), job.retry_count, job.max_retries);

        if retryable {
            job.retry_count += 1;
            job.status = JobStatus::Pending;
            job.error_message = Some(err.to_string());
            self.store.update_job(conn, &job).await?;

            let backoff_s = backoff_seconds(
                self.config.retry_backoff_base_s,
                self.config.retry_backoff_cap_s,
                job.retry_count,
            );
            let visible_at_ms = crate::time::now_ms() as i64 + (backoff_s as i64 * 1000);

            self.store
                .enqueue_ready(&ReadyQueueEntry {
                    job_id: job.id,
                    tenant_id: conn.tenant().as_str().to_string(),
                    marketplace: job.marketplace,
                    priority: job.priority.0,
                    created_ms: job.created_at.timestamp_millis(),
                    visible_at_ms,
                    expires_ms: job.expires_at.timestamp_millis(),
                })
                .await?;
            return Ok(());
        }

        job.status = JobStatus::Failed;
        job.completed_at = Some(crate::time::now_utc());
        job.error_message = Some(err.to_string());
        self.store.update_job(conn, &job).await?;
        self.store.dequeue_ready(job.id).await?;
        self.stats
            .record(conn, &job.action_code, job.marketplace, false, duration_ms)
            .await?;
        if let Some(batch_id) = job.batch_id {
            self.batches.rollup(conn, batch_id).await?;
        }
        Ok(())
    }

    fn spawn_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = this.sweep_expired().await {
                    tracing::warn!(error = %e, "janitor sweep failed");
                }
                tokio::time::sleep(Duration::from_millis(this.config.janitor_interval_ms)).await;
            }
        })
    }

    /// Expires every ready-queue entry past its deadline that nobody claimed
    /// in time. Jobs already claimed and running are not in the
    /// ready queue, so they are untouched by this sweep.
    pub async fn sweep_expired(&self) -> Result<(), OrchestratorError> {
        let now_ms = crate::time::now_ms() as i64;
        let expired = self.store.expired_ready(now_ms, 256).await?;

        for entry in expired {
            let tenant = Tenant::new(entry.tenant_id.clone());
            let conn = self.store.bind(&tenant).await?;

            if let Some(mut job) = self.store.get_job(&conn, entry.job_id).await? {
                if !job.status.is_terminal() {
                    job.status = JobStatus::Expired;
                    job.completed_at = Some(crate::time::now_utc());
                    job.error_message = Some("job expired before completion".into());
                    self.store.update_job(&conn, &job).await?;
                    self.stats
                        .record(&conn, &job.action_code, job.marketplace, false, 0)
                        .await?;
                    if let Some(batch_id) = job.batch_id {
                        self.batches.rollup(&conn, batch_id).await?;
                    }
                }
            }
            self.store.dequeue_ready(entry.job_id).await?;
        }

        Ok(())
    }

    /// Removes a pending job from the ready queue so workers stop claiming
    /// it, without changing its retry bookkeeping.
    pub async fn pause_job(&self, conn: &TenantConn, mut job: Job) -> Result<Job, OrchestratorError> {
        if job.status != JobStatus::Pending {
            return Err(OrchestratorError::IllegalTransition(format!(
                "cannot pause job in status {}",
                job.status.as_str()
            )));
        }
        job.status = JobStatus::Paused;
        self.store.update_job(conn, &job).await?;
        self.store.dequeue_ready(job.id).await?;
        Ok(job)
    }

    /// Resuming restores `pending` and extends `expires_at` by the
    /// configured job lifetime — a paused job may have sat long
    /// enough that its original deadline would expire it the instant it's
    /// handed back to the dispatcher.
    pub async fn resume_job(&self, conn: &TenantConn, mut job: Job) -> Result<Job, OrchestratorError> {
        if job.status != JobStatus::Paused {
            return Err(OrchestratorError::IllegalTransition(format!(
                "cannot resume job in status {}",
                job.status.as_str()
            )));
        }
        job.status = JobStatus::Pending;
        job.expires_at = job.expires_at + chrono::Duration::seconds(self.config.job_expiry_s);
        self.store.update_job(conn, &job).await?;
        self.store
            .enqueue_ready(&ReadyQueueEntry {
                job_id: job.id,
                tenant_id: conn.tenant().as_str().to_string(),
                marketplace: job.marketplace,
                priority: job.priority.0,
                created_ms: job.created_at.timestamp_millis(),
                visible_at_ms: crate::time::now_ms() as i64,
                expires_ms: job.expires_at.timestamp_millis(),
            })
            .await?;
        Ok(job)
    }

    /// Cancellation is terminal from any non-terminal status.
    pub async fn cancel_job(&self, conn: &TenantConn, mut job: Job) -> Result<Job, OrchestratorError> {
        if job.status.is_terminal() {
            return Err(OrchestratorError::IllegalTransition(format!(
                "cannot cancel job already in status {}",
                job.status.as_str()
            )));
        }
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(crate::time::now_utc());
        self.store.update_job(conn, &job).await?;
        self.store.cancel_pending_tasks_for_job(conn, job.id).await?;
        self.store.dequeue_ready(job.id).await?;
        if let Some(batch_id) = job.batch_id {
            self.batches.rollup(conn, batch_id).await?;
        }
        Ok(job)
    }

    /// Manual retry: re-admits a failed job immediately, bypassing the
    /// backoff window it would otherwise still be waiting out. An
    /// operator-triggered retry, distinct from the automatic backoff retry
    /// `finish_failure` schedules.
    pub async fn retry_job(&self, conn: &TenantConn, mut job: Job) -> Result<Job, OrchestratorError> {
        if job.status != JobStatus::Failed {
            return Err(OrchestratorError::IllegalTransition(format!(
                "cannot retry job in status {}",
                job.status.as_str()
            )));
        }
        job.status = JobStatus::Pending;
        job.completed_at = None;
        job.error_message = None;
        self.store.update_job(conn, &job).await?;
        self.store
            .enqueue_ready(&ReadyQueueEntry {
                job_id: job.id,
                tenant_id: conn.tenant().as_str().to_string(),
                marketplace: job.marketplace,
                priority: job.priority.0,
                created_ms: job.created_at.timestamp_millis(),
                visible_at_ms: crate::time::now_ms() as i64,
                expires_ms: job.expires_at.timestamp_millis(),
            })
            .await?;
        Ok(job)
    }
}

/// Exponential backoff with a hard cap: `base * 2^retry_count`,
/// clamped so a deployment can bound how stale a retry is ever allowed to
/// wait. Split out of [`Dispatcher::finish_failure`] so it can be exercised
/// without a store.
fn backoff_seconds(base_s: u64, cap_s: u64, retry_count: u32) -> u64 {
    base_s.saturating_mul(2u64.saturating_pow(retry_count)).min(cap_s)
}

/// The retry gate applied in [`Dispatcher::finish_failure`]: retryable
/// errors only get another attempt while the job's budget allows it. Split
/// out so the "retry_count never exceeds max_retries" invariant can be
/// driven without a store.
fn should_retry(err_is_retryable: bool, retry_count: u32, max_retries: u32) -> bool {
    err_is_retryable && retry_count < max_retries
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// R1: backoff never exceeds the configured cap, however large the
        /// retry count climbs.
        #[test]
        fn backoff_never_exceeds_cap(base in 0u64..600, cap in 0u64..600, retry_count in 0u32..64) {
            prop_assert!(backoff_seconds(base, cap, retry_count) <= cap);
        }

        /// R2: for a fixed base/cap, backoff is monotonically non-decreasing
        /// as the retry count grows — a later retry never waits less than an
        /// earlier one.
        #[test]
        fn backoff_is_monotonic_in_retry_count(base in 1u64..600, cap in 1u64..600, retry_count in 0u32..32) {
            let a = backoff_seconds(base, cap, retry_count);
            let b = backoff_seconds(base, cap, retry_count + 1);
            prop_assert!(b >= a);
        }

        /// R3: a zero base always yields zero backoff, regardless of cap or
        /// retry count — used by tests that want immediate re-claiming.
        #[test]
        fn zero_base_is_always_immediate(cap in 0u64..600, retry_count in 0u32..64) {
            prop_assert_eq!(backoff_seconds(0, cap, retry_count), 0);
        }

        /// P2: however long a sequence of retryable failures runs, the retry
        /// counter the gate allows through never exceeds the job's configured
        /// budget.
        #[test]
        fn retry_count_never_exceeds_max_retries(max_retries in 0u32..10, failures in 0u32..50) {
            let mut retry_count = 0u32;
            for _ in 0..failures {
                if should_retry(true, retry_count, max_retries) {
                    retry_count += 1;
                } else {
                    break;
                }
            }
            prop_assert!(retry_count <= max_retries);
        }
    }
}
