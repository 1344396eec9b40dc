use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::db::schema::safe_ident;
use crate::error::OrchestratorError;
use crate::model::{
    ActionType, BatchJob, BatchStatus, DailyStats, Job, JobStatus, Marketplace, Priority, Tenant,
    Task, TaskStatus, TaskType,
};

use super::{JobFilters, Pagination, ReadyQueueEntry, TaskFilters, TenantConn, TenantStore};

pub struct SqlxStore {
    pool: Arc<AnyPool>,
}

impl SqlxStore {
    pub fn new(pool: Arc<AnyPool>) -> Self {
        Self { pool }
    }
}

fn millis_to_dt(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn opt_millis_to_dt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(millis_to_dt)
}

fn marketplace_of(row: &AnyRow, col: &str) -> Result<Marketplace, OrchestratorError> {
    let raw: String = row.try_get(col).map_err(db_err)?;
    Marketplace::from_str(&raw)
        .ok_or_else(|| OrchestratorError::InvariantViolation(format!("unknown marketplace {raw}")))
}

fn db_err(e: sqlx::Error) -> OrchestratorError {
    OrchestratorError::UpstreamFailure(format!("storage error: {e}"))
}

fn job_from_row(row: AnyRow, tenant: &Tenant) -> Result<Job, OrchestratorError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let batch_id: Option<String> = row.try_get("batch_id").map_err(db_err)?;
    let input_raw: String = row.try_get("input_data").map_err(db_err)?;
    let result_raw: String = row.try_get("result_data").map_err(db_err)?;

    Ok(Job {
        id: Uuid::parse_str(&id).map_err(|e| OrchestratorError::InvariantViolation(e.to_string()))?,
        tenant: tenant.clone(),
        batch_id: batch_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| OrchestratorError::InvariantViolation(e.to_string()))?,
        marketplace: marketplace_of(&row, "marketplace")?,
        action_code: row.try_get("action_code").map_err(db_err)?,
        product_id: row.try_get("product_id").map_err(db_err)?,
        priority: Priority(row.try_get::<i64, _>("priority").map_err(db_err)? as u8).normalized(),
        status: {
            let raw: String = row.try_get("status").map_err(db_err)?;
            JobStatus::from_str(&raw)
                .ok_or_else(|| OrchestratorError::InvariantViolation(format!("unknown job status {raw}")))?
        },
        retry_count: row.try_get::<i64, _>("retry_count").map_err(db_err)? as u32,
        max_retries: row.try_get::<i64, _>("max_retries").map_err(db_err)? as u32,
        input_data: serde_json::from_str::<Value>(&input_raw).unwrap_or(Value::Null),
        result_data: serde_json::from_str::<Value>(&result_raw).unwrap_or(Value::Null),
        error_message: row.try_get("error_message").map_err(db_err)?,
        created_at: millis_to_dt(row.try_get::<i64, _>("created_ms").map_err(db_err)?),
        started_at: opt_millis_to_dt(row.try_get::<Option<i64>, _>("started_ms").map_err(db_err)?),
        completed_at: opt_millis_to_dt(row.try_get::<Option<i64>, _>("completed_ms").map_err(db_err)?),
        expires_at: millis_to_dt(row.try_get::<i64, _>("expires_ms").map_err(db_err)?),
    })
}

fn task_from_row(row: AnyRow) -> Result<Task, OrchestratorError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let job_id: String = row.try_get("job_id").map_err(db_err)?;
    let payload_raw: String = row.try_get("payload").map_err(db_err)?;
    let result_raw: Option<String> = row.try_get("result").map_err(db_err)?;

    Ok(Task {
        id: Uuid::parse_str(&id).map_err(|e| OrchestratorError::InvariantViolation(e.to_string()))?,
        job_id: Uuid::parse_str(&job_id)
            .map_err(|e| OrchestratorError::InvariantViolation(e.to_string()))?,
        position: row.try_get::<i64, _>("position").map_err(db_err)? as u32,
        description: row.try_get("description").map_err(db_err)?,
        task_type: {
            let raw: String = row.try_get("task_type").map_err(db_err)?;
            TaskType::from_str(&raw)
                .ok_or_else(|| OrchestratorError::InvariantViolation(format!("unknown task type {raw}")))?
        },
        status: {
            let raw: String = row.try_get("status").map_err(db_err)?;
            TaskStatus::from_str(&raw)
                .ok_or_else(|| OrchestratorError::InvariantViolation(format!("unknown task status {raw}")))?
        },
        payload: serde_json::from_str::<Value>(&payload_raw).unwrap_or(Value::Null),
        result: result_raw.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
        error_message: row.try_get("error_message").map_err(db_err)?,
        retry_count: row.try_get::<i64, _>("retry_count").map_err(db_err)? as u32,
        started_at: opt_millis_to_dt(row.try_get::<Option<i64>, _>("started_ms").map_err(db_err)?),
        completed_at: opt_millis_to_dt(row.try_get::<Option<i64>, _>("completed_ms").map_err(db_err)?),
        created_at: millis_to_dt(row.try_get::<i64, _>("created_ms").map_err(db_err)?),
    })
}

fn batch_from_row(row: AnyRow, tenant: &Tenant) -> Result<BatchJob, OrchestratorError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    Ok(BatchJob {
        id: Uuid::parse_str(&id).map_err(|e| OrchestratorError::InvariantViolation(e.to_string()))?,
        tenant: tenant.clone(),
        action_code: row.try_get("action_code").map_err(db_err)?,
        marketplace: marketplace_of(&row, "marketplace")?,
        total_jobs: row.try_get::<i64, _>("total_jobs").map_err(db_err)? as u32,
        completed_jobs: row.try_get::<i64, _>("completed_jobs").map_err(db_err)? as u32,
        failed_jobs: row.try_get::<i64, _>("failed_jobs").map_err(db_err)? as u32,
        status: {
            let raw: String = row.try_get("status").map_err(db_err)?;
            BatchStatus::from_str(&raw).ok_or_else(|| {
                OrchestratorError::InvariantViolation(format!("unknown batch status {raw}"))
            })?
        },
        created_at: millis_to_dt(row.try_get::<i64, _>("created_ms").map_err(db_err)?),
        completed_at: opt_millis_to_dt(row.try_get::<Option<i64>, _>("completed_ms").map_err(db_err)?),
    })
}

#[async_trait]
impl TenantStore for SqlxStore {
    async fn bind(&self, tenant: &Tenant) -> Result<TenantConn, OrchestratorError> {
        let ident = safe_ident(tenant.as_str())?;

        crate::db::schema::ensure_tenant_schema(&self.pool, tenant)
            .await
            .map_err(|e| OrchestratorError::UpstreamFailure(e.to_string()))?;

        let row = sqlx::query("SELECT schema_name FROM tenant_registry WHERE tenant_id = ?")
            .bind(&ident)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(db_err)?;

        let registered: String = match row {
            Some(r) => r.try_get("schema_name").map_err(db_err)?,
            None => {
                return Err(OrchestratorError::InvariantViolation(format!(
                    "tenant {ident} missing from registry after provisioning"
                )));
            }
        };

        if registered != tenant.schema_name() {
            return Err(OrchestratorError::InvariantViolation(format!(
                "tenant {ident} registry namespace {registered} does not match expected {}",
                tenant.schema_name()
            )));
        }

        Ok(TenantConn {
            tenant: tenant.clone(),
        })
    }

    async fn insert_job(&self, conn: &TenantConn, job: &Job) -> Result<(), OrchestratorError> {
        let table = conn.table("jobs");
        sqlx::query(&format!(
            "INSERT INTO {table} (id, batch_id, marketplace, action_code, product_id, priority,
             status, retry_count, max_retries, input_data, result_data, error_message,
             created_ms, started_ms, completed_ms, expires_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(job.id.to_string())
        .bind(job.batch_id.map(|b| b.to_string()))
        .bind(job.marketplace.as_str())
        .bind(&job.action_code)
        .bind(&job.product_id)
        .bind(job.priority.0 as i64)
        .bind(job.status.as_str())
        .bind(job.retry_count as i64)
        .bind(job.max_retries as i64)
        .bind(serde_json::to_string(&job.input_data).unwrap_or_default())
        .bind(serde_json::to_string(&job.result_data).unwrap_or_default())
        .bind(&job.error_message)
        .bind(job.created_at.timestamp_millis())
        .bind(job.started_at.map(|d| d.timestamp_millis()))
        .bind(job.completed_at.map(|d| d.timestamp_millis()))
        .bind(job.expires_at.timestamp_millis())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_job(&self, conn: &TenantConn, id: Uuid) -> Result<Option<Job>, OrchestratorError> {
        let table = conn.table("jobs");
        let row = sqlx::query(&format!("SELECT * FROM {table} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        row.map(|r| job_from_row(r, conn.tenant())).transpose()
    }

    async fn update_job(&self, conn: &TenantConn, job: &Job) -> Result<(), OrchestratorError> {
        let table = conn.table("jobs");
        sqlx::query(&format!(
            "UPDATE {table} SET status = ?, retry_count = ?, result_data = ?, error_message = ?,
             started_ms = ?, completed_ms = ?, expires_ms = ? WHERE id = ?"
        ))
        .bind(job.status.as_str())
        .bind(job.retry_count as i64)
        .bind(serde_json::to_string(&job.result_data).unwrap_or_default())
        .bind(&job.error_message)
        .bind(job.started_at.map(|d| d.timestamp_millis()))
        .bind(job.completed_at.map(|d| d.timestamp_millis()))
        .bind(job.expires_at.timestamp_millis())
        .bind(job.id.to_string())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_jobs(
        &self,
        conn: &TenantConn,
        filters: &JobFilters,
        page: &Pagination,
    ) -> Result<(Vec<Job>, u64), OrchestratorError> {
        let table = conn.table("jobs");
        let mut clauses = Vec::new();
        if filters.marketplace.is_some() {
            clauses.push("marketplace = ?");
        }
        if filters.status.is_some() {
            clauses.push("status = ?");
        }
        if filters.batch_id.is_some() {
            clauses.push("batch_id = ?");
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let page = page.clone().clamped();

        let mut count_q = sqlx::query(&format!("SELECT COUNT(*) as n FROM {table}{where_sql}"));
        let mut data_q = sqlx::query(&format!(
            "SELECT * FROM {table}{where_sql} ORDER BY created_ms DESC LIMIT ? OFFSET ?"
        ));

        if let Some(m) = filters.marketplace {
            count_q = count_q.bind(m.as_str());
            data_q = data_q.bind(m.as_str());
        }
        if let Some(s) = filters.status {
            count_q = count_q.bind(s.as_str());
            data_q = data_q.bind(s.as_str());
        }
        if let Some(b) = filters.batch_id {
            count_q = count_q.bind(b.to_string());
            data_q = data_q.bind(b.to_string());
        }
        data_q = data_q.bind(page.limit as i64).bind(page.offset as i64);

        let total: i64 = count_q
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(db_err)?
            .try_get("n")
            .map_err(db_err)?;

        let rows = data_q.fetch_all(self.pool.as_ref()).await.map_err(db_err)?;
        let jobs = rows
            .into_iter()
            .map(|r| job_from_row(r, conn.tenant()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok((jobs, total.max(0) as u64))
    }

    async fn count_jobs_by_status(
        &self,
        conn: &TenantConn,
        filters: &JobFilters,
    ) -> Result<super::CountsByStatus, OrchestratorError> {
        let table = conn.table("jobs");
        let mut clauses = Vec::new();
        if filters.marketplace.is_some() {
            clauses.push("marketplace = ?");
        }
        if filters.batch_id.is_some() {
            clauses.push("batch_id = ?");
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let mut q = sqlx::query(&format!(
            "SELECT status, COUNT(*) as n FROM {table}{where_sql} GROUP BY status"
        ));
        if let Some(m) = filters.marketplace {
            q = q.bind(m.as_str());
        }
        if let Some(b) = filters.batch_id {
            q = q.bind(b.to_string());
        }

        let rows = q.fetch_all(self.pool.as_ref()).await.map_err(db_err)?;
        let mut counts = super::CountsByStatus::new();
        for row in rows {
            let status: String = row.try_get("status").map_err(db_err)?;
            let n: i64 = row.try_get("n").map_err(db_err)?;
            counts.insert(status, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn list_jobs_for_batch(
        &self,
        conn: &TenantConn,
        batch_id: Uuid,
    ) -> Result<Vec<Job>, OrchestratorError> {
        let table = conn.table("jobs");
        let rows = sqlx::query(&format!(
            "SELECT * FROM {table} WHERE batch_id = ? ORDER BY created_ms ASC"
        ))
        .bind(batch_id.to_string())
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(|r| job_from_row(r, conn.tenant())).collect()
    }

    async fn insert_tasks(&self, conn: &TenantConn, tasks: &[Task]) -> Result<(), OrchestratorError> {
        let table = conn.table("tasks");
        for task in tasks {
            sqlx::query(&format!(
                "INSERT INTO {table} (id, job_id, position, description, task_type, status,
                 payload, result, error_message, retry_count, started_ms, completed_ms, created_ms)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(task.id.to_string())
            .bind(task.job_id.to_string())
            .bind(task.position as i64)
            .bind(&task.description)
            .bind(task.task_type.as_str())
            .bind(task.status.as_str())
            .bind(serde_json::to_string(&task.payload).unwrap_or_default())
            .bind(task.result.as_ref().map(|v| serde_json::to_string(v).unwrap_or_default()))
            .bind(&task.error_message)
            .bind(task.retry_count as i64)
            .bind(task.started_at.map(|d| d.timestamp_millis()))
            .bind(task.completed_at.map(|d| d.timestamp_millis()))
            .bind(task.created_at.timestamp_millis())
            .execute(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn get_task(&self, conn: &TenantConn, id: Uuid) -> Result<Option<Task>, OrchestratorError> {
        let table = conn.table("tasks");
        let row = sqlx::query(&format!("SELECT * FROM {table} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        row.map(task_from_row).transpose()
    }

    async fn update_task(&self, conn: &TenantConn, task: &Task) -> Result<(), OrchestratorError> {
        let table = conn.table("tasks");
        sqlx::query(&format!(
            "UPDATE {table} SET status = ?, result = ?, error_message = ?, retry_count = ?,
             started_ms = ?, completed_ms = ? WHERE id = ?"
        ))
        .bind(task.status.as_str())
        .bind(task.result.as_ref().map(|v| serde_json::to_string(v).unwrap_or_default()))
        .bind(&task.error_message)
        .bind(task.retry_count as i64)
        .bind(task.started_at.map(|d| d.timestamp_millis()))
        .bind(task.completed_at.map(|d| d.timestamp_millis()))
        .bind(task.id.to_string())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn cancel_pending_tasks_for_job(
        &self,
        conn: &TenantConn,
        job_id: Uuid,
    ) -> Result<(), OrchestratorError> {
        let table = conn.table("tasks");
        sqlx::query(&format!(
            "UPDATE {table} SET status = ? WHERE job_id = ? AND status = ?"
        ))
        .bind(TaskStatus::Cancelled.as_str())
        .bind(job_id.to_string())
        .bind(TaskStatus::Pending.as_str())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_tasks_for_job(
        &self,
        conn: &TenantConn,
        job_id: Uuid,
    ) -> Result<Vec<Task>, OrchestratorError> {
        let table = conn.table("tasks");
        let rows = sqlx::query(&format!(
            "SELECT * FROM {table} WHERE job_id = ? ORDER BY position ASC"
        ))
        .bind(job_id.to_string())
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(task_from_row).collect()
    }

    async fn list_tasks(
        &self,
        conn: &TenantConn,
        filters: &TaskFilters,
        page: &Pagination,
    ) -> Result<(Vec<Task>, u64), OrchestratorError> {
        let table = conn.table("tasks");
        let mut clauses = Vec::new();
        if filters.job_id.is_some() {
            clauses.push("job_id = ?");
        }
        if filters.status.is_some() {
            clauses.push("status = ?");
        }
        if filters.task_type.is_some() {
            clauses.push("task_type = ?");
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let page = page.clone().clamped();

        let mut count_q = sqlx::query(&format!("SELECT COUNT(*) as n FROM {table}{where_sql}"));
        let mut data_q = sqlx::query(&format!(
            "SELECT * FROM {table}{where_sql} ORDER BY created_ms DESC LIMIT ? OFFSET ?"
        ));

        if let Some(j) = filters.job_id {
            count_q = count_q.bind(j.to_string());
            data_q = data_q.bind(j.to_string());
        }
        if let Some(s) = filters.status {
            count_q = count_q.bind(s.as_str());
            data_q = data_q.bind(s.as_str());
        }
        if let Some(t) = filters.task_type {
            count_q = count_q.bind(t.as_str());
            data_q = data_q.bind(t.as_str());
        }
        data_q = data_q.bind(page.limit as i64).bind(page.offset as i64);

        let total: i64 = count_q
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(db_err)?
            .try_get("n")
            .map_err(db_err)?;
        let rows = data_q.fetch_all(self.pool.as_ref()).await.map_err(db_err)?;
        let tasks = rows.into_iter().map(task_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((tasks, total.max(0) as u64))
    }

    async fn count_tasks_by_status(
        &self,
        conn: &TenantConn,
        filters: &TaskFilters,
    ) -> Result<super::CountsByStatus, OrchestratorError> {
        let table = conn.table("tasks");
        let mut clauses = Vec::new();
        if filters.job_id.is_some() {
            clauses.push("job_id = ?");
        }
        if filters.task_type.is_some() {
            clauses.push("task_type = ?");
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let mut q = sqlx::query(&format!(
            "SELECT status, COUNT(*) as n FROM {table}{where_sql} GROUP BY status"
        ));
        if let Some(j) = filters.job_id {
            q = q.bind(j.to_string());
        }
        if let Some(t) = filters.task_type {
            q = q.bind(t.as_str());
        }

        let rows = q.fetch_all(self.pool.as_ref()).await.map_err(db_err)?;
        let mut counts = super::CountsByStatus::new();
        for row in rows {
            let status: String = row.try_get("status").map_err(db_err)?;
            let n: i64 = row.try_get("n").map_err(db_err)?;
            counts.insert(status, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn insert_batch_with_jobs(
        &self,
        conn: &TenantConn,
        batch: &BatchJob,
        jobs: &[Job],
    ) -> Result<(), OrchestratorError> {
        let batches_table = conn.table("batches");
        let jobs_table = conn.table("jobs");
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(&format!(
            "INSERT INTO {batches_table} (id, action_code, marketplace, total_jobs, completed_jobs,
             failed_jobs, status, created_ms, completed_ms) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(batch.id.to_string())
        .bind(&batch.action_code)
        .bind(batch.marketplace.as_str())
        .bind(batch.total_jobs as i64)
        .bind(batch.completed_jobs as i64)
        .bind(batch.failed_jobs as i64)
        .bind(batch.status.as_str())
        .bind(batch.created_at.timestamp_millis())
        .bind(batch.completed_at.map(|d| d.timestamp_millis()))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for job in jobs {
            sqlx::query(&format!(
                "INSERT INTO {jobs_table} (id, batch_id, marketplace, action_code, product_id, priority,
                 status, retry_count, max_retries, input_data, result_data, error_message,
                 created_ms, started_ms, completed_ms, expires_ms)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(job.id.to_string())
            .bind(job.batch_id.map(|b| b.to_string()))
            .bind(job.marketplace.as_str())
            .bind(&job.action_code)
            .bind(&job.product_id)
            .bind(job.priority.0 as i64)
            .bind(job.status.as_str())
            .bind(job.retry_count as i64)
            .bind(job.max_retries as i64)
            .bind(serde_json::to_string(&job.input_data).unwrap_or_default())
            .bind(serde_json::to_string(&job.result_data).unwrap_or_default())
            .bind(&job.error_message)
            .bind(job.created_at.timestamp_millis())
            .bind(job.started_at.map(|d| d.timestamp_millis()))
            .bind(job.completed_at.map(|d| d.timestamp_millis()))
            .bind(job.expires_at.timestamp_millis())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn insert_batch(&self, conn: &TenantConn, batch: &BatchJob) -> Result<(), OrchestratorError> {
        let table = conn.table("batches");
        sqlx::query(&format!(
            "INSERT INTO {table} (id, action_code, marketplace, total_jobs, completed_jobs,
             failed_jobs, status, created_ms, completed_ms) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(batch.id.to_string())
        .bind(&batch.action_code)
        .bind(batch.marketplace.as_str())
        .bind(batch.total_jobs as i64)
        .bind(batch.completed_jobs as i64)
        .bind(batch.failed_jobs as i64)
        .bind(batch.status.as_str())
        .bind(batch.created_at.timestamp_millis())
        .bind(batch.completed_at.map(|d| d.timestamp_millis()))
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_batch(&self, conn: &TenantConn, id: Uuid) -> Result<Option<BatchJob>, OrchestratorError> {
        let table = conn.table("batches");
        let row = sqlx::query(&format!("SELECT * FROM {table} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        row.map(|r| batch_from_row(r, conn.tenant())).transpose()
    }

    async fn update_batch(&self, conn: &TenantConn, batch: &BatchJob) -> Result<(), OrchestratorError> {
        let table = conn.table("batches");
        sqlx::query(&format!(
            "UPDATE {table} SET completed_jobs = ?, failed_jobs = ?, status = ?, completed_ms = ?
             WHERE id = ?"
        ))
        .bind(batch.completed_jobs as i64)
        .bind(batch.failed_jobs as i64)
        .bind(batch.status.as_str())
        .bind(batch.completed_at.map(|d| d.timestamp_millis()))
        .bind(batch.id.to_string())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_batches(
        &self,
        conn: &TenantConn,
        marketplace: Option<Marketplace>,
        status: Option<BatchStatus>,
        page: &Pagination,
    ) -> Result<(Vec<BatchJob>, u64), OrchestratorError> {
        let table = conn.table("batches");
        let mut clauses = Vec::new();
        if marketplace.is_some() {
            clauses.push("marketplace = ?");
        }
        if status.is_some() {
            clauses.push("status = ?");
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let page = page.clone().clamped();

        let mut count_q = sqlx::query(&format!("SELECT COUNT(*) as n FROM {table}{where_sql}"));
        let mut data_q = sqlx::query(&format!(
            "SELECT * FROM {table}{where_sql} ORDER BY created_ms DESC LIMIT ? OFFSET ?"
        ));
        if let Some(m) = marketplace {
            count_q = count_q.bind(m.as_str());
            data_q = data_q.bind(m.as_str());
        }
        if let Some(s) = status {
            count_q = count_q.bind(s.as_str());
            data_q = data_q.bind(s.as_str());
        }
        data_q = data_q.bind(page.limit as i64).bind(page.offset as i64);

        let total: i64 = count_q
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(db_err)?
            .try_get("n")
            .map_err(db_err)?;
        let rows = data_q.fetch_all(self.pool.as_ref()).await.map_err(db_err)?;
        let batches = rows
            .into_iter()
            .map(|r| batch_from_row(r, conn.tenant()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((batches, total.max(0) as u64))
    }

    async fn record_stats(
        &self,
        conn: &TenantConn,
        action_type: &str,
        marketplace: Marketplace,
        date: NaiveDate,
        success: bool,
        duration_ms: u64,
    ) -> Result<(), OrchestratorError> {
        let table = conn.table("daily_stats");

        // The increment and the running-mean update happen inside one
        // statement: `success_count`/`failure_count` on the right-hand side
        // refer to the row's current value, `excluded.*` to the new sample.
        // No SELECT-then-write race between two workers recording against
        // the same `(tenant, action, marketplace, date)` row.
        sqlx::query(&format!(
            "INSERT INTO {table} (action_type, marketplace, date, success_count, failure_count, avg_duration_ms)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (action_type, marketplace, date) DO UPDATE SET
               avg_duration_ms = (avg_duration_ms * (success_count + failure_count) + excluded.avg_duration_ms)
                                 / (success_count + failure_count + 1),
               success_count = success_count + excluded.success_count,
               failure_count = failure_count + excluded.failure_count"
        ))
        .bind(action_type)
        .bind(marketplace.as_str())
        .bind(date.to_string())
        .bind(success as i64)
        .bind((!success) as i64)
        .bind(duration_ms as f64)
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_stats(
        &self,
        conn: &TenantConn,
        action_type: &str,
        marketplace: Marketplace,
        date: NaiveDate,
    ) -> Result<Option<DailyStats>, OrchestratorError> {
        let table = conn.table("daily_stats");
        let row = sqlx::query(&format!(
            "SELECT * FROM {table} WHERE action_type = ? AND marketplace = ? AND date = ?"
        ))
        .bind(action_type)
        .bind(marketplace.as_str())
        .bind(date.to_string())
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        row.map(|r| -> Result<DailyStats, OrchestratorError> {
            Ok(DailyStats {
                tenant: conn.tenant().clone(),
                action_type: r.try_get("action_type").map_err(db_err)?,
                marketplace: marketplace_of(&r, "marketplace")?,
                date,
                success_count: r.try_get::<i64, _>("success_count").map_err(db_err)? as u64,
                failure_count: r.try_get::<i64, _>("failure_count").map_err(db_err)? as u64,
                avg_duration_ms: r.try_get("avg_duration_ms").map_err(db_err)?,
            })
        })
        .transpose()
    }

    async fn get_action_type(
        &self,
        marketplace: Marketplace,
        code: &str,
    ) -> Result<Option<ActionType>, OrchestratorError> {
        let row = sqlx::query("SELECT * FROM action_types WHERE marketplace = ? AND code = ?")
            .bind(marketplace.as_str())
            .bind(code)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(db_err)?;

        row.map(|r| -> Result<ActionType, OrchestratorError> {
            let id: String = r.try_get("id").map_err(db_err)?;
            Ok(ActionType {
                id: Uuid::parse_str(&id)
                    .map_err(|e| OrchestratorError::InvariantViolation(e.to_string()))?,
                code: r.try_get("code").map_err(db_err)?,
                name: r.try_get("name").map_err(db_err)?,
                marketplace: marketplace_of(&r, "marketplace")?,
            })
        })
        .transpose()
    }

    async fn register_action_type(&self, action: &ActionType) -> Result<(), OrchestratorError> {
        sqlx::query(
            "INSERT INTO action_types (id, code, name, marketplace) VALUES (?, ?, ?, ?)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(action.id.to_string())
        .bind(&action.code)
        .bind(&action.name)
        .bind(action.marketplace.as_str())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn enqueue_ready(&self, entry: &ReadyQueueEntry) -> Result<(), OrchestratorError> {
        sqlx::query(
            "INSERT INTO ready_queue (job_id, tenant_id, marketplace, priority, created_ms, visible_at_ms, expires_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (job_id) DO UPDATE SET
               priority = excluded.priority,
               visible_at_ms = excluded.visible_at_ms",
        )
        .bind(entry.job_id.to_string())
        .bind(&entry.tenant_id)
        .bind(entry.marketplace.as_str())
        .bind(entry.priority as i64)
        .bind(entry.created_ms)
        .bind(entry.visible_at_ms)
        .bind(entry.expires_ms)
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn dequeue_ready(&self, job_id: Uuid) -> Result<(), OrchestratorError> {
        sqlx::query("DELETE FROM ready_queue WHERE job_id = ?")
            .bind(job_id.to_string())
            .execute(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn candidate_ready(
        &self,
        now_ms: i64,
        scan_limit: u32,
    ) -> Result<Vec<ReadyQueueEntry>, OrchestratorError> {
        let rows = sqlx::query(
            "SELECT * FROM ready_queue WHERE visible_at_ms <= ? AND expires_ms > ?
             ORDER BY priority ASC, created_ms ASC LIMIT ?",
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(scan_limit as i64)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        rows.into_iter().map(ready_queue_entry_from_row).collect()
    }

    async fn expired_ready(
        &self,
        now_ms: i64,
        scan_limit: u32,
    ) -> Result<Vec<ReadyQueueEntry>, OrchestratorError> {
        let rows = sqlx::query("SELECT * FROM ready_queue WHERE expires_ms <= ? LIMIT ?")
            .bind(now_ms)
            .bind(scan_limit as i64)
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(db_err)?;

        rows.into_iter().map(ready_queue_entry_from_row).collect()
    }

    async fn claim_job(&self, conn: &TenantConn, job_id: Uuid) -> Result<bool, OrchestratorError> {
        let table = conn.table("jobs");
        let result = sqlx::query(&format!(
            "UPDATE {table} SET status = 'running', started_ms = ? WHERE id = ? AND status = 'pending'"
        ))
        .bind(crate::time::now_ms() as i64)
        .bind(job_id.to_string())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }
}

fn ready_queue_entry_from_row(row: AnyRow) -> Result<ReadyQueueEntry, OrchestratorError> {
    let job_id: String = row.try_get("job_id").map_err(db_err)?;
    Ok(ReadyQueueEntry {
        job_id: Uuid::parse_str(&job_id).map_err(|e| OrchestratorError::InvariantViolation(e.to_string()))?,
        tenant_id: row.try_get("tenant_id").map_err(db_err)?,
        marketplace: marketplace_of(&row, "marketplace")?,
        priority: row.try_get::<i64, _>("priority").map_err(db_err)? as u8,
        created_ms: row.try_get("created_ms").map_err(db_err)?,
        visible_at_ms: row.try_get("visible_at_ms").map_err(db_err)?,
        expires_ms: row.try_get("expires_ms").map_err(db_err)?,
    })
}
