//! External Facade (C10): `JobsService` is the one entrypoint embedders call
//! into. A plain async Rust API — no HTTP surface of its own.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

use crate::actions::ActionRegistry;
use crate::batch::{BatchRegistry, JobSpec};
use crate::bridge::{BridgeResponse, PluginBridge};
use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::error::OrchestratorError;
use crate::logger::TraceId;
use crate::model::{BatchJob, BatchStatus, Job, JobDetail, JobRollup, JobStatus, Marketplace, Priority, Task, Tenant};
use crate::store::{CountsByStatus, JobFilters, Pagination, TaskFilters, TenantStore};

pub struct JobsService {
    store: Arc<dyn TenantStore>,
    batches: Arc<BatchRegistry>,
    dispatcher: Arc<Dispatcher>,
    bridge: Arc<PluginBridge>,
    registry: Arc<ActionRegistry>,
    config: AppConfig,
}

impl JobsService {
    pub fn new(
        store: Arc<dyn TenantStore>,
        batches: Arc<BatchRegistry>,
        dispatcher: Arc<Dispatcher>,
        bridge: Arc<PluginBridge>,
        registry: Arc<ActionRegistry>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            batches,
            dispatcher,
            bridge,
            registry,
            config,
        }
    }

    /// Submits one standalone job (no batch). Enqueues it onto the ready
    /// queue for the dispatcher to pick up.
    pub async fn submit_job(
        &self,
        tenant: &Tenant,
        marketplace: Marketplace,
        action_code: &str,
        product_id: Option<String>,
        input_data: Value,
        priority: Priority,
        max_retries: Option<u32>,
    ) -> Result<Job, OrchestratorError> {
        // Rejected here, synchronously, rather than discovered later inside
        // the dispatcher — an unknown action/marketplace pair is a
        // submit-time response, not a job that gets accepted and then fails.
        self.registry.pipeline_for(marketplace, action_code)?;

        let trace_id = TraceId::new(Uuid::new_v4().to_string());
        let span = crate::logger::root_span("submit_job", &trace_id);
        {
            let _enter = span.enter();
            crate::logger::annotate_span(tenant.as_str(), None);
        }

        async move {
            let conn = self.store.bind(tenant).await?;
            let now = crate::time::now_utc();
            let job = Job {
                id: Uuid::new_v4(),
                tenant: tenant.clone(),
                batch_id: None,
                marketplace,
                action_code: action_code.to_string(),
                product_id,
                priority: priority.normalized(),
                status: JobStatus::Pending,
                retry_count: 0,
                max_retries: max_retries.unwrap_or(self.config.default_max_retries),
                input_data,
                result_data: Value::Object(Default::default()),
                error_message: None,
                created_at: now,
                started_at: None,
                completed_at: None,
                expires_at: now + chrono::Duration::seconds(self.config.job_expiry_s),
            };

            self.store.insert_job(&conn, &job).await?;
            self.store
                .enqueue_ready(&crate::store::ReadyQueueEntry {
                    job_id: job.id,
                    tenant_id: tenant.as_str().to_string(),
                    marketplace: job.marketplace,
                    priority: job.priority.0,
                    created_ms: job.created_at.timestamp_millis(),
                    visible_at_ms: job.created_at.timestamp_millis(),
                    expires_ms: job.expires_at.timestamp_millis(),
                })
                .await?;
            Ok(job)
        }
        .instrument(span)
        .await
    }

    pub async fn submit_batch(
        &self,
        tenant: &Tenant,
        marketplace: Marketplace,
        action_code: &str,
        items: Vec<JobSpec>,
    ) -> Result<BatchJob, OrchestratorError> {
        self.registry.pipeline_for(marketplace, action_code)?;
        let conn = self.store.bind(tenant).await?;
        self.batches.submit_batch(&conn, action_code, marketplace, items).await
    }

    /// Fetches one job together with its tasks and their status rollup.
    pub async fn get_job(&self, tenant: &Tenant, job_id: Uuid) -> Result<Option<JobDetail>, OrchestratorError> {
        let conn = self.store.bind(tenant).await?;
        let job = match self.store.get_job(&conn, job_id).await? {
            Some(job) => job,
            None => return Ok(None),
        };
        let tasks = self.store.list_tasks_for_job(&conn, job_id).await?;
        let rollup = JobRollup::from_tasks(&tasks);
        Ok(Some(JobDetail { job, tasks, rollup }))
    }

    pub async fn list_jobs(
        &self,
        tenant: &Tenant,
        filters: JobFilters,
        page: Pagination,
    ) -> Result<(Vec<Job>, u64, CountsByStatus), OrchestratorError> {
        let conn = self.store.bind(tenant).await?;
        let (jobs, total) = self.store.list_jobs(&conn, &filters, &page).await?;
        let counts_by_status = self.store.count_jobs_by_status(&conn, &filters).await?;
        Ok((jobs, total, counts_by_status))
    }

    pub async fn list_tasks(
        &self,
        tenant: &Tenant,
        filters: TaskFilters,
        page: Pagination,
    ) -> Result<(Vec<Task>, u64, CountsByStatus), OrchestratorError> {
        let conn = self.store.bind(tenant).await?;
        let (tasks, total) = self.store.list_tasks(&conn, &filters, &page).await?;
        let counts_by_status = self.store.count_tasks_by_status(&conn, &filters).await?;
        Ok((tasks, total, counts_by_status))
    }

    pub async fn list_batches(
        &self,
        tenant: &Tenant,
        marketplace: Option<Marketplace>,
        status: Option<BatchStatus>,
        page: Pagination,
    ) -> Result<(Vec<BatchJob>, u64), OrchestratorError> {
        let conn = self.store.bind(tenant).await?;
        self.batches.list_batches(&conn, marketplace, status, &page).await
    }

    async fn fetch_job(&self, tenant: &Tenant, job_id: Uuid) -> Result<(crate::store::TenantConn, Job), OrchestratorError> {
        let conn = self.store.bind(tenant).await?;
        let job = self
            .store
            .get_job(&conn, job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id}")))?;
        Ok((conn, job))
    }

    pub async fn retry_job(&self, tenant: &Tenant, job_id: Uuid) -> Result<Job, OrchestratorError> {
        let (conn, job) = self.fetch_job(tenant, job_id).await?;
        self.dispatcher.retry_job(&conn, job).await
    }

    pub async fn pause_job(&self, tenant: &Tenant, job_id: Uuid) -> Result<Job, OrchestratorError> {
        let (conn, job) = self.fetch_job(tenant, job_id).await?;
        self.dispatcher.pause_job(&conn, job).await
    }

    pub async fn resume_job(&self, tenant: &Tenant, job_id: Uuid) -> Result<Job, OrchestratorError> {
        let (conn, job) = self.fetch_job(tenant, job_id).await?;
        self.dispatcher.resume_job(&conn, job).await
    }

    pub async fn cancel_job(&self, tenant: &Tenant, job_id: Uuid) -> Result<Job, OrchestratorError> {
        let (conn, job) = self.fetch_job(tenant, job_id).await?;
        self.dispatcher.cancel_job(&conn, job).await
    }

    /// Attaches a live push-mode plugin session for `tenant`. The caller
    /// (the embedder's websocket handler) reads `BridgeRequest`s off the
    /// returned channel and writes them to the socket; requests dispatched
    /// while no session is attached fall back to long-poll delivery.
    pub async fn plugin_attach_session(&self, tenant: Tenant) -> tokio::sync::mpsc::Receiver<crate::bridge::BridgeRequest> {
        self.bridge.attach_session(tenant).await
    }

    /// Session-loss notification hook: the embedder calls this
    /// when the plugin's websocket disconnects, failing every request still
    /// pending for `tenant` with [`OrchestratorError::SessionLost`] instead
    /// of leaving them to time out.
    pub async fn plugin_detach_session(&self, tenant: &Tenant) {
        self.bridge.detach_session(tenant).await;
    }

    /// Long-poll endpoint the plugin session calls to fetch outstanding
    /// bridge requests.
    pub async fn plugin_poll(&self, tenant: &Tenant, max_wait: Duration) -> Vec<crate::bridge::BridgeRequest> {
        self.bridge.poll(tenant, max_wait).await
    }

    /// Endpoint the plugin session calls to report the outcome of a bridged
    /// request. Idempotent — reporting the same `request_id` twice is safe.
    pub fn plugin_report(&self, response: BridgeResponse) {
        self.bridge.report(response);
    }
}
