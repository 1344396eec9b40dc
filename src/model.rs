//! Core data model for the job/task orchestration engine.
//!
//! Every entity here is a plain struct scoped to exactly one [`Tenant`] (the
//! store layer, not this module, enforces that scoping — see `store::bind`).

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Opaque tenant identifier. Every entity in this module belongs to exactly
/// one tenant; the store binds every query to the tenant's private schema.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tenant(String);

impl Tenant {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The per-tenant schema/table-prefix this tenant's rows live under.
    pub fn schema_name(&self) -> String {
        format!("tenant_{}", self.0)
    }
}

impl std::fmt::Display for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Marketplace {
    /// Plugin-bridged family — traffic proxied through a browser extension session.
    M1,
    /// Direct-API family, OAuth-authenticated.
    M2,
    /// Direct-API family, OAuth-authenticated.
    M3,
}

impl Marketplace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Marketplace::M1 => "M1",
            Marketplace::M2 => "M2",
            Marketplace::M3 => "M3",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "M1" => Some(Marketplace::M1),
            "M2" => Some(Marketplace::M2),
            "M3" => Some(Marketplace::M3),
            _ => None,
        }
    }

    /// Bridged marketplaces are served through the plugin bridge (C7) rather
    /// than direct HTTPS calls. M1 is the one bridged marketplace.
    pub fn is_bridged(&self) -> bool {
        matches!(self, Marketplace::M1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "paused" => JobStatus::Paused,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            "expired" => JobStatus::Expired,
            _ => return None,
        })
    }

    /// Terminal statuses are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Expired
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskType {
    PluginHttp,
    DirectHttp,
    Db,
    File,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::PluginHttp => "plugin_http",
            TaskType::DirectHttp => "direct_http",
            TaskType::Db => "db",
            TaskType::File => "file",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "plugin_http" => TaskType::PluginHttp,
            "direct_http" => TaskType::DirectHttp,
            "db" => TaskType::Db,
            "file" => TaskType::File,
            _ => return None,
        })
    }

    /// Default timeout, overridable per payload.
    pub fn default_timeout_s(&self) -> u64 {
        match self {
            TaskType::PluginHttp => 60,
            TaskType::DirectHttp => 30,
            TaskType::Db | TaskType::File => 30,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => TaskStatus::Pending,
            "processing" => TaskStatus::Processing,
            "success" => TaskStatus::Success,
            "failed" => TaskStatus::Failed,
            "timeout" => TaskStatus::Timeout,
            "cancelled" => TaskStatus::Cancelled,
            _ => return None,
        })
    }

    /// `success` and `cancelled` are absorbing for the purposes of retry.
    pub fn is_absorbing(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Cancelled)
    }
}

/// Priority encoding on the wire: 1=critical .. 4=low.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    pub const CRITICAL: Priority = Priority(1);
    pub const HIGH: Priority = Priority(2);
    pub const NORMAL: Priority = Priority(3);
    pub const LOW: Priority = Priority(4);

    pub fn normalized(self) -> Priority {
        Priority(self.0.clamp(1, 4))
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Partial => "partial",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => BatchStatus::Pending,
            "running" => BatchStatus::Running,
            "completed" => BatchStatus::Completed,
            "failed" => BatchStatus::Failed,
            "partial" => BatchStatus::Partial,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug)]
pub struct BatchJob {
    pub id: Uuid,
    pub tenant: Tenant,
    pub action_code: String,
    pub marketplace: Marketplace,
    pub total_jobs: u32,
    pub completed_jobs: u32,
    pub failed_jobs: u32,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct Job {
    pub id: Uuid,
    pub tenant: Tenant,
    pub batch_id: Option<Uuid>,
    pub marketplace: Marketplace,
    pub action_code: String,
    pub product_id: Option<String>,
    pub priority: Priority,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub input_data: Value,
    pub result_data: Value,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl Job {
    /// Merge additional keys into `result_data` without discarding prior keys
    /// ("result_data is monotonically enriched").
    pub fn enrich_result(&mut self, extra: Value) {
        match (self.result_data.as_object_mut(), extra) {
            (Some(base), Value::Object(more)) => {
                for (k, v) in more {
                    base.insert(k, v);
                }
            }
            (_, other) => self.result_data = other,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub position: u32,
    pub description: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub payload: Value,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Task-status rollup for one job, returned alongside its tasks by
/// `get_job`/`list_jobs`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobRollup {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub pending: u32,
    pub progress_percent: u8,
}

impl JobRollup {
    /// Buckets a job's tasks: `success` counts as completed; `failed`,
    /// `timeout`, and `cancelled` all count as failed, since none of them
    /// produced a usable result; everything else (`pending`, `processing`)
    /// counts as pending.
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let total = tasks.len() as u32;
        let completed = tasks.iter().filter(|t| t.status == TaskStatus::Success).count() as u32;
        let failed = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled))
            .count() as u32;
        let pending = total.saturating_sub(completed).saturating_sub(failed);
        let progress_percent = if total == 0 { 0 } else { (completed * 100 / total) as u8 };
        Self {
            total,
            completed,
            failed,
            pending,
            progress_percent,
        }
    }
}

/// A job bundled with its tasks and their rollup, as `get_job` returns it.
#[derive(Clone, Debug)]
pub struct JobDetail {
    pub job: Job,
    pub tasks: Vec<Task>,
    pub rollup: JobRollup,
}

/// Reference data identifying an action declared in the action registry (C4).
#[derive(Clone, Debug)]
pub struct ActionType {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub marketplace: Marketplace,
}

/// Idempotent per-day aggregate, keyed `(tenant, action_type, marketplace, date)`.
#[derive(Clone, Debug)]
pub struct DailyStats {
    pub tenant: Tenant,
    pub action_type: String,
    pub marketplace: Marketplace,
    pub date: chrono::NaiveDate,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_duration_ms: f64,
}

/// Outcome a task handler or marketplace service reports; never retried
/// internally — classification and retry are the dispatcher's job.
#[derive(Clone, Debug)]
pub struct ActionOutcome {
    pub success: bool,
    pub result: Value,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_absorbing() {
        for s in [
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Expired,
        ] {
            assert!(s.is_terminal());
        }
        for s in [JobStatus::Pending, JobStatus::Running, JobStatus::Paused] {
            assert!(!s.is_terminal());
        }
    }

    #[test]
    fn task_status_round_trips() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Success,
            TaskStatus::Failed,
            TaskStatus::Timeout,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::from_str(s.as_str()), Some(s));
        }
    }

    #[test]
    fn success_and_cancelled_are_absorbing() {
        assert!(TaskStatus::Success.is_absorbing());
        assert!(TaskStatus::Cancelled.is_absorbing());
        assert!(!TaskStatus::Failed.is_absorbing());
        assert!(!TaskStatus::Pending.is_absorbing());
    }

    fn task_with_status(status: TaskStatus) -> Task {
        Task {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            position: 0,
            description: "t".into(),
            task_type: TaskType::Db,
            status,
            payload: serde_json::json!({}),
            result: None,
            error_message: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn rollup_of_no_tasks_is_zero_progress() {
        let rollup = JobRollup::from_tasks(&[]);
        assert_eq!(rollup, JobRollup::default());
    }

    #[test]
    fn rollup_buckets_failed_timeout_and_cancelled_together() {
        let tasks = vec![
            task_with_status(TaskStatus::Success),
            task_with_status(TaskStatus::Failed),
            task_with_status(TaskStatus::Timeout),
            task_with_status(TaskStatus::Cancelled),
            task_with_status(TaskStatus::Pending),
        ];
        let rollup = JobRollup::from_tasks(&tasks);
        assert_eq!(rollup.total, 5);
        assert_eq!(rollup.completed, 1);
        assert_eq!(rollup.failed, 3);
        assert_eq!(rollup.pending, 1);
        assert_eq!(rollup.progress_percent, 20);
    }

    #[test]
    fn priority_clamps_out_of_range() {
        assert_eq!(Priority(0).normalized(), Priority::CRITICAL);
        assert_eq!(Priority(9).normalized(), Priority::LOW);
    }

    #[test]
    fn enrich_result_merges_without_discarding() {
        let mut job = Job {
            id: Uuid::new_v4(),
            tenant: Tenant::new("t1"),
            batch_id: None,
            marketplace: Marketplace::M2,
            action_code: "publish".into(),
            product_id: None,
            priority: Priority::NORMAL,
            status: JobStatus::Running,
            retry_count: 0,
            max_retries: 3,
            input_data: serde_json::json!({}),
            result_data: serde_json::json!({"a": 1}),
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            expires_at: Utc::now(),
        };

        job.enrich_result(serde_json::json!({"b": 2}));
        assert_eq!(job.result_data, serde_json::json!({"a": 1, "b": 2}));
    }

    use proptest::prelude::*;

    fn any_priority() -> impl Strategy<Value = Priority> {
        (0u8..=255).prop_map(Priority)
    }

    fn any_job_status() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Pending),
            Just(JobStatus::Running),
            Just(JobStatus::Paused),
            Just(JobStatus::Completed),
            Just(JobStatus::Failed),
            Just(JobStatus::Cancelled),
            Just(JobStatus::Expired),
        ]
    }

    fn any_task_status() -> impl Strategy<Value = TaskStatus> {
        prop_oneof![
            Just(TaskStatus::Pending),
            Just(TaskStatus::Processing),
            Just(TaskStatus::Success),
            Just(TaskStatus::Failed),
            Just(TaskStatus::Timeout),
            Just(TaskStatus::Cancelled),
        ]
    }

    proptest! {
        /// R5: the rollup buckets always partition every task exactly once,
        /// and progress_percent never leaves the 0..=100 range.
        #[test]
        fn rollup_buckets_partition_every_task(statuses in prop::collection::vec(any_task_status(), 0..30)) {
            let tasks: Vec<Task> = statuses.into_iter().map(task_with_status).collect();
            let rollup = JobRollup::from_tasks(&tasks);
            prop_assert_eq!(rollup.completed + rollup.failed + rollup.pending, rollup.total);
            prop_assert_eq!(rollup.total, tasks.len() as u32);
            prop_assert!(rollup.progress_percent <= 100);
        }

        /// P1: normalization always lands in the wire-valid 1..=4 range,
        /// whatever out-of-range value a caller hands in.
        #[test]
        fn priority_normalized_always_in_range(p in any_priority()) {
            let n = p.normalized();
            prop_assert!((1..=4).contains(&n.0));
        }

        /// P2: normalization is idempotent — normalizing twice is the same
        /// as normalizing once.
        #[test]
        fn priority_normalized_is_idempotent(p in any_priority()) {
            prop_assert_eq!(p.normalized().normalized(), p.normalized());
        }

        /// P3: every JobStatus round-trips through its wire string.
        #[test]
        fn job_status_round_trips(s in any_job_status()) {
            prop_assert_eq!(JobStatus::from_str(s.as_str()), Some(s));
        }

        /// P4: `enrich_result` never drops a key that was already present,
        /// regardless of what the new object layers on top.
        #[test]
        fn enrich_result_never_drops_prior_keys(
            base in prop::collection::hash_map("[a-z]{1,4}", any::<i64>(), 0..8),
            extra in prop::collection::hash_map("[a-z]{1,4}", any::<i64>(), 0..8),
        ) {
            let base_obj: serde_json::Map<String, Value> =
                base.iter().map(|(k, v)| (k.clone(), Value::from(*v))).collect();
            let extra_obj: serde_json::Map<String, Value> =
                extra.iter().map(|(k, v)| (k.clone(), Value::from(*v))).collect();

            let mut job = Job {
                id: Uuid::new_v4(),
                tenant: Tenant::new("t1"),
                batch_id: None,
                marketplace: Marketplace::M2,
                action_code: "publish".into(),
                product_id: None,
                priority: Priority::NORMAL,
                status: JobStatus::Running,
                retry_count: 0,
                max_retries: 3,
                input_data: serde_json::json!({}),
                result_data: Value::Object(base_obj),
                error_message: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                expires_at: Utc::now(),
            };

            job.enrich_result(Value::Object(extra_obj));

            let merged = job.result_data.as_object().unwrap();
            for k in base.keys() {
                prop_assert!(merged.contains_key(k));
            }
            for (k, v) in &extra {
                prop_assert_eq!(merged.get(k), Some(&Value::from(*v)));
            }
        }
    }
}
