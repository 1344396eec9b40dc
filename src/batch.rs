//! Batch Registry (C2): atomic multi-job submission and rollup.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::OrchestratorError;
use crate::model::{BatchJob, BatchStatus, Job, JobStatus, Marketplace, Priority};
use crate::store::{Pagination, ReadyQueueEntry, TenantConn, TenantStore};

#[derive(Clone, Debug)]
pub struct JobSpec {
    pub product_id: Option<String>,
    pub input_data: Value,
    pub priority: Priority,
    pub max_retries: Option<u32>,
}

pub struct BatchRegistry {
    store: Arc<dyn TenantStore>,
    config: AppConfig,
}

impl BatchRegistry {
    pub fn new(store: Arc<dyn TenantStore>, config: AppConfig) -> Self {
        Self { store, config }
    }

    /// Creates a batch and all of its child jobs as one commit, then enqueues
    /// each job onto the shared scheduling index. A batch with
    /// zero items is rejected — there would be nothing to roll up.
    pub async fn submit_batch(
        &self,
        conn: &TenantConn,
        action_code: &str,
        marketplace: Marketplace,
        items: Vec<JobSpec>,
    ) -> Result<BatchJob, OrchestratorError> {
        if items.is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "batch must contain at least one job".into(),
            ));
        }

        let now = crate::time::now_utc();
        let batch_id = Uuid::new_v4();

        let jobs: Vec<Job> = items
            .into_iter()
            .map(|spec| Job {
                id: Uuid::new_v4(),
                tenant: conn.tenant().clone(),
                batch_id: Some(batch_id),
                marketplace,
                action_code: action_code.to_string(),
                product_id: spec.product_id,
                priority: spec.priority.normalized(),
                status: JobStatus::Pending,
                retry_count: 0,
                max_retries: spec.max_retries.unwrap_or(self.config.default_max_retries),
                input_data: spec.input_data,
                result_data: Value::Object(Default::default()),
                error_message: None,
                created_at: now,
                started_at: None,
                completed_at: None,
                expires_at: now + chrono::Duration::seconds(self.config.job_expiry_s),
            })
            .collect();

        let batch = BatchJob {
            id: batch_id,
            tenant: conn.tenant().clone(),
            action_code: action_code.to_string(),
            marketplace,
            total_jobs: jobs.len() as u32,
            completed_jobs: 0,
            failed_jobs: 0,
            status: BatchStatus::Pending,
            created_at: now,
            completed_at: None,
        };

        self.store.insert_batch_with_jobs(conn, &batch, &jobs).await?;

        for job in &jobs {
            self.store
                .enqueue_ready(&ReadyQueueEntry {
                    job_id: job.id,
                    tenant_id: conn.tenant().as_str().to_string(),
                    marketplace: job.marketplace,
                    priority: job.priority.0,
                    created_ms: job.created_at.timestamp_millis(),
                    visible_at_ms: job.created_at.timestamp_millis(),
                    expires_ms: job.expires_at.timestamp_millis(),
                })
                .await?;
        }

        Ok(batch)
    }

    /// Recomputes a batch's rollup counters and status from its child jobs.
    /// Called by the dispatcher every time a job belonging to a batch
    /// reaches a terminal status.
    pub async fn rollup(&self, conn: &TenantConn, batch_id: Uuid) -> Result<BatchJob, OrchestratorError> {
        let mut batch = self
            .store
            .get_batch(conn, batch_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("batch {batch_id}")))?;

        let jobs = self.store.list_jobs_for_batch(conn, batch_id).await?;

        let completed = jobs.iter().filter(|j| j.status == JobStatus::Completed).count() as u32;
        let failed = jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Failed | JobStatus::Expired | JobStatus::Cancelled))
            .count() as u32;

        batch.completed_jobs = completed;
        batch.failed_jobs = failed;
        batch.status = derive_batch_status(batch.total_jobs, completed, failed);
        if completed + failed >= batch.total_jobs && batch.completed_at.is_none() {
            batch.completed_at = Some(crate::time::now_utc());
        }

        self.store.update_batch(conn, &batch).await?;
        Ok(batch)
    }

    pub async fn list_batches(
        &self,
        conn: &TenantConn,
        marketplace: Option<Marketplace>,
        status: Option<BatchStatus>,
        page: &Pagination,
    ) -> Result<(Vec<BatchJob>, u64), OrchestratorError> {
        self.store.list_batches(conn, marketplace, status, page).await
    }
}

/// Pure rollup rule: `running` until every job has resolved,
/// then `completed`/`failed`/`partial` depending on the split. Split out of
/// [`BatchRegistry::rollup`] so it can be exercised without a store.
fn derive_batch_status(total: u32, completed: u32, failed: u32) -> BatchStatus {
    let resolved = completed + failed;
    if resolved < total {
        BatchStatus::Running
    } else if failed == 0 {
        BatchStatus::Completed
    } else if completed == 0 {
        BatchStatus::Failed
    } else {
        BatchStatus::Partial
    }
}
