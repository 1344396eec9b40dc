//! Tenant-Scoped Store (C1).
//!
//! Every operation binds to a [`Tenant`] first and the binding is verified
//! before any tenant-table query executes. A second, shared
//! `ready_queue` index carries only scheduling metadata (tenant id,
//! marketplace, priority, timestamps) so the dispatcher can find the best
//! job system-wide without a cross-schema join — the job's actual content
//! never leaves its own tenant's tables.

pub mod sqlx_store;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::{
    ActionType, BatchJob, BatchStatus, DailyStats, Job, JobStatus, Marketplace, Tenant, Task,
    TaskStatus, TaskType,
};

#[derive(Clone, Debug, Default)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Pagination {
    /// Clamps limit to the wire-level maximum ("max limit 100").
    pub fn clamped(mut self) -> Self {
        self.limit = self.limit.clamp(1, 100);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct JobFilters {
    pub marketplace: Option<Marketplace>,
    pub status: Option<JobStatus>,
    pub batch_id: Option<Uuid>,
}

#[derive(Clone, Debug, Default)]
pub struct TaskFilters {
    pub job_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
}

/// Status-bucketed counts honoring every filter except `status` itself, so a
/// caller sees the full distribution within the same scope it's paging
/// through — the `counts_by_status` that rides alongside a `list_jobs`/
/// `list_tasks` page.
pub type CountsByStatus = std::collections::BTreeMap<String, u64>;

#[derive(Clone, Debug)]
pub struct ReadyQueueEntry {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub marketplace: Marketplace,
    pub priority: u8,
    pub created_ms: i64,
    pub visible_at_ms: i64,
    pub expires_ms: i64,
}

/// A verified binding to one tenant's private namespace.
///
/// Constructed only by [`TenantStore::bind`], which performs the §4.1
/// verification step. Holding one of these is the capability required to
/// call any tenant-scoped store method.
#[derive(Clone, Debug)]
pub struct TenantConn {
    tenant: Tenant,
}

impl TenantConn {
    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    fn table(&self, name: &str) -> String {
        format!("t_{}_{}", self.tenant.as_str(), name)
    }
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Binds to `tenant`'s namespace, provisioning its tables if this is the
    /// first time this tenant has been seen, then verifies the tenant
    /// registry agrees with the namespace about to be queried. A mismatch
    /// is an [`OrchestratorError::InvariantViolation`] — a tenant-isolation
    /// breach, never degraded silently.
    async fn bind(&self, tenant: &Tenant) -> Result<TenantConn, OrchestratorError>;

    // ---- Jobs ----
    async fn insert_job(&self, conn: &TenantConn, job: &Job) -> Result<(), OrchestratorError>;
    async fn get_job(&self, conn: &TenantConn, id: Uuid) -> Result<Option<Job>, OrchestratorError>;
    async fn update_job(&self, conn: &TenantConn, job: &Job) -> Result<(), OrchestratorError>;
    async fn list_jobs(
        &self,
        conn: &TenantConn,
        filters: &JobFilters,
        page: &Pagination,
    ) -> Result<(Vec<Job>, u64), OrchestratorError>;
    /// Status counts across every job matching `filters` (ignoring its own
    /// `status` field), independent of the page being fetched.
    async fn count_jobs_by_status(
        &self,
        conn: &TenantConn,
        filters: &JobFilters,
    ) -> Result<CountsByStatus, OrchestratorError>;
    /// Unclamped fetch of every job in a batch, for rollup accounting — the
    /// page-size cap in [`TenantStore::list_jobs`] is a client-facing limit,
    /// not a bound the orchestrator itself should be subject to.
    async fn list_jobs_for_batch(
        &self,
        conn: &TenantConn,
        batch_id: Uuid,
    ) -> Result<Vec<Job>, OrchestratorError>;

    // ---- Tasks ----
    async fn insert_tasks(&self, conn: &TenantConn, tasks: &[Task]) -> Result<(), OrchestratorError>;
    async fn get_task(&self, conn: &TenantConn, id: Uuid) -> Result<Option<Task>, OrchestratorError>;
    async fn update_task(&self, conn: &TenantConn, task: &Task) -> Result<(), OrchestratorError>;
    /// Cancels every still-`pending` task belonging to `job_id` — cancelling
    /// a job cascades to all of its pending child tasks. A task already
    /// running, or already resolved, is left untouched.
    async fn cancel_pending_tasks_for_job(
        &self,
        conn: &TenantConn,
        job_id: Uuid,
    ) -> Result<(), OrchestratorError>;
    async fn list_tasks_for_job(
        &self,
        conn: &TenantConn,
        job_id: Uuid,
    ) -> Result<Vec<Task>, OrchestratorError>;
    async fn list_tasks(
        &self,
        conn: &TenantConn,
        filters: &TaskFilters,
        page: &Pagination,
    ) -> Result<(Vec<Task>, u64), OrchestratorError>;
    /// Status counts across every task matching `filters` (ignoring its own
    /// `status` field), independent of the page being fetched.
    async fn count_tasks_by_status(
        &self,
        conn: &TenantConn,
        filters: &TaskFilters,
    ) -> Result<CountsByStatus, OrchestratorError>;

    // ---- Batches ----
    /// Creates the batch row and all of its child job rows as one commit
    /// ("a batch and its jobs appear together or not at all").
    async fn insert_batch_with_jobs(
        &self,
        conn: &TenantConn,
        batch: &BatchJob,
        jobs: &[Job],
    ) -> Result<(), OrchestratorError>;
    async fn insert_batch(&self, conn: &TenantConn, batch: &BatchJob) -> Result<(), OrchestratorError>;
    async fn get_batch(&self, conn: &TenantConn, id: Uuid) -> Result<Option<BatchJob>, OrchestratorError>;
    async fn update_batch(&self, conn: &TenantConn, batch: &BatchJob) -> Result<(), OrchestratorError>;
    async fn list_batches(
        &self,
        conn: &TenantConn,
        marketplace: Option<Marketplace>,
        status: Option<BatchStatus>,
        page: &Pagination,
    ) -> Result<(Vec<BatchJob>, u64), OrchestratorError>;

    // ---- Stats ----
    async fn record_stats(
        &self,
        conn: &TenantConn,
        action_type: &str,
        marketplace: Marketplace,
        date: chrono::NaiveDate,
        success: bool,
        duration_ms: u64,
    ) -> Result<(), OrchestratorError>;
    async fn get_stats(
        &self,
        conn: &TenantConn,
        action_type: &str,
        marketplace: Marketplace,
        date: chrono::NaiveDate,
    ) -> Result<Option<DailyStats>, OrchestratorError>;

    // ---- Reference data (shared schema) ----
    async fn get_action_type(
        &self,
        marketplace: Marketplace,
        code: &str,
    ) -> Result<Option<ActionType>, OrchestratorError>;
    async fn register_action_type(&self, action: &ActionType) -> Result<(), OrchestratorError>;

    // ---- Ready queue (shared scheduling index) ----
    async fn enqueue_ready(&self, entry: &ReadyQueueEntry) -> Result<(), OrchestratorError>;
    async fn dequeue_ready(&self, job_id: Uuid) -> Result<(), OrchestratorError>;
    async fn candidate_ready(
        &self,
        now_ms: i64,
        scan_limit: u32,
    ) -> Result<Vec<ReadyQueueEntry>, OrchestratorError>;
    /// Ready-queue rows whose job has passed its expiry deadline, for the
    /// janitor sweep. Reads the shared index only — no per-tenant
    /// table needs to be visited to find expired work.
    async fn expired_ready(
        &self,
        now_ms: i64,
        scan_limit: u32,
    ) -> Result<Vec<ReadyQueueEntry>, OrchestratorError>;

    /// Conditionally transitions `job_id` from `pending` to `running`,
    /// returning `true` only to the caller that won the race. This is the
    /// compare-and-swap a worker pool needs to claim a job exactly once.
    async fn claim_job(&self, conn: &TenantConn, job_id: Uuid) -> Result<bool, OrchestratorError>;
}
