//! Task Orchestrator (C3): turns a job's action pipeline into task rows and
//! executes them one at a time, committing after each task so a crash never
//! loses more than the in-flight task.

use std::sync::Arc;

use uuid::Uuid;

use crate::actions::{ActionRegistry, HandlerTable};
use crate::error::OrchestratorError;
use crate::model::{Job, JobStatus, Task, TaskStatus};
use crate::store::{TenantConn, TenantStore};

pub struct TaskOrchestrator {
    store: Arc<dyn TenantStore>,
    registry: Arc<ActionRegistry>,
    handlers: Arc<HandlerTable>,
}

impl TaskOrchestrator {
    pub fn new(store: Arc<dyn TenantStore>, registry: Arc<ActionRegistry>, handlers: Arc<HandlerTable>) -> Self {
        Self {
            store,
            registry,
            handlers,
        }
    }

    /// Materializes a job's task pipeline. Idempotent: if tasks already
    /// exist for this job (a retry picking the job back up), returns them
    /// unchanged instead of duplicating rows.
    pub async fn create_tasks(&self, conn: &TenantConn, job: &Job) -> Result<Vec<Task>, OrchestratorError> {
        let existing = self.store.list_tasks_for_job(conn, job.id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        let pipeline = self.registry.pipeline_for(job.marketplace, &job.action_code)?;
        let now = crate::time::now_utc();
        let tasks: Vec<Task> = pipeline
            .iter()
            .enumerate()
            .map(|(i, spec)| Task {
                id: Uuid::new_v4(),
                job_id: job.id,
                position: i as u32,
                description: spec.description.clone(),
                task_type: spec.task_type,
                status: TaskStatus::Pending,
                payload: job.input_data.clone(),
                result: None,
                error_message: None,
                retry_count: 0,
                started_at: None,
                completed_at: None,
                created_at: now,
            })
            .collect();

        self.store.insert_tasks(conn, &tasks).await?;
        Ok(tasks)
    }

    /// A task already in an absorbing status (`success`, `cancelled`) is
    /// never re-executed — a retried job resumes after its last completed
    /// task rather than redoing work.
    pub fn should_skip(task: &Task) -> bool {
        task.status.is_absorbing()
    }

    /// Executes one task against its handler and persists the outcome as a
    /// single commit — the orchestrator's one atomic mutation point per task.
    pub async fn execute_task(&self, conn: &TenantConn, job: &Job, task: &mut Task) -> Result<(), OrchestratorError> {
        if Self::should_skip(task) {
            return Ok(());
        }

        task.status = TaskStatus::Processing;
        task.started_at = Some(crate::time::now_utc());
        self.store.update_task(conn, task).await?;

        let handler = self.handlers.get(task.task_type)?;
        let outcome = handler.execute(job, task).await;

        task.completed_at = Some(crate::time::now_utc());
        match outcome {
            Ok(result) if result.success => {
                task.status = TaskStatus::Success;
                task.result = Some(result.result);
                task.error_message = None;
                self.store.update_task(conn, task).await?;
                Ok(())
            }
            Ok(result) => {
                task.status = TaskStatus::Failed;
                task.result = Some(result.result);
                task.error_message = result.error;
                task.retry_count += 1;
                self.store.update_task(conn, task).await?;
                Err(OrchestratorError::UpstreamFailure(
                    task.error_message.clone().unwrap_or_default(),
                ))
            }
            Err(err) => {
                task.status = if matches!(err, OrchestratorError::Timeout(_)) {
                    TaskStatus::Timeout
                } else {
                    TaskStatus::Failed
                };
                task.error_message = Some(err.to_string());
                task.retry_count += 1;
                self.store.update_task(conn, task).await?;
                Err(err)
            }
        }
    }

    /// Runs every pending task in order, stopping at the first failure. The
    /// caller (the dispatcher) interprets the result to decide the job's
    /// next status and retry schedule.
    ///
    /// Between tasks, re-reads the job's own status: an operator can cancel
    /// a job while one of its tasks is mid-flight. The in-flight task
    /// finishes regardless; remaining tasks never start. The in-flight task
    /// itself is never interrupted — only the next one is skipped.
    pub async fn execute_job(&self, conn: &TenantConn, job: &Job) -> Result<(), OrchestratorError> {
        let mut tasks = self.create_tasks(conn, job).await?;
        for task in tasks.iter_mut() {
            if let Some(current) = self.store.get_job(conn, job.id).await? {
                if current.status == JobStatus::Cancelled {
                    return Err(OrchestratorError::Cancelled);
                }
            }
            self.execute_task(conn, job, task).await?;
        }
        Ok(())
    }
}
