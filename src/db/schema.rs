use sqlx::AnyPool;

use crate::error::OrchestratorError;
use crate::model::Tenant;

/// Bootstraps the shared reference schema: the tenant registry (used by
/// [`crate::store::bind`] to verify namespace binding) and the immutable
/// `action_types` reference table. Not a migration-tooling replacement —
/// just a plain `CREATE TABLE IF NOT EXISTS` bootstrap.
pub async fn migrate_shared(pool: &AnyPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS tenant_registry (
  tenant_id TEXT PRIMARY KEY,
  schema_name TEXT NOT NULL,
  created_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS action_types (
  id TEXT PRIMARY KEY,
  code TEXT NOT NULL,
  name TEXT NOT NULL,
  marketplace TEXT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Cross-tenant scheduling index: carries only the metadata
    // the dispatcher needs to pick the next job system-wide. The job's own
    // content stays in its tenant's private tables.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS ready_queue (
  job_id TEXT PRIMARY KEY,
  tenant_id TEXT NOT NULL,
  marketplace TEXT NOT NULL,
  priority INTEGER NOT NULL,
  created_ms BIGINT NOT NULL,
  visible_at_ms BIGINT NOT NULL,
  expires_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ready_queue_visible ON ready_queue(visible_at_ms, priority, created_ms);",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Sanitizes a tenant id into a safe SQL identifier fragment.
///
/// Table names cannot be parameter-bound, so every per-tenant table name is
/// built by string interpolation; this guards that interpolation against
/// injection by rejecting anything but `[a-zA-Z0-9_]`.
pub fn safe_ident(raw: &str) -> Result<String, OrchestratorError> {
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(OrchestratorError::InvalidInput(format!(
            "tenant id is not a safe identifier: {raw:?}"
        )));
    }
    Ok(raw.to_string())
}

/// Clones the per-tenant table set from the template. Idempotent — safe to
/// call on every bind for a tenant that already exists.
pub async fn ensure_tenant_schema(pool: &AnyPool, tenant: &Tenant) -> anyhow::Result<()> {
    let ident = safe_ident(tenant.as_str())?;
    let prefix = format!("t_{ident}");

    sqlx::query(&format!(
        r#"
CREATE TABLE IF NOT EXISTS {prefix}_batches (
  id TEXT PRIMARY KEY,
  action_code TEXT NOT NULL,
  marketplace TEXT NOT NULL,
  total_jobs INTEGER NOT NULL,
  completed_jobs INTEGER NOT NULL,
  failed_jobs INTEGER NOT NULL,
  status TEXT NOT NULL,
  created_ms BIGINT NOT NULL,
  completed_ms BIGINT
);
"#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
CREATE TABLE IF NOT EXISTS {prefix}_jobs (
  id TEXT PRIMARY KEY,
  batch_id TEXT,
  marketplace TEXT NOT NULL,
  action_code TEXT NOT NULL,
  product_id TEXT,
  priority INTEGER NOT NULL,
  status TEXT NOT NULL,
  retry_count INTEGER NOT NULL,
  max_retries INTEGER NOT NULL,
  input_data TEXT NOT NULL,
  result_data TEXT NOT NULL,
  error_message TEXT,
  created_ms BIGINT NOT NULL,
  started_ms BIGINT,
  completed_ms BIGINT,
  expires_ms BIGINT NOT NULL
);
"#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
CREATE TABLE IF NOT EXISTS {prefix}_tasks (
  id TEXT PRIMARY KEY,
  job_id TEXT NOT NULL,
  position INTEGER NOT NULL,
  description TEXT NOT NULL,
  task_type TEXT NOT NULL,
  status TEXT NOT NULL,
  payload TEXT NOT NULL,
  result TEXT,
  error_message TEXT,
  retry_count INTEGER NOT NULL,
  started_ms BIGINT,
  completed_ms BIGINT,
  created_ms BIGINT NOT NULL
);
"#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
CREATE TABLE IF NOT EXISTS {prefix}_daily_stats (
  action_type TEXT NOT NULL,
  marketplace TEXT NOT NULL,
  date TEXT NOT NULL,
  success_count BIGINT NOT NULL,
  failure_count BIGINT NOT NULL,
  avg_duration_ms DOUBLE PRECISION NOT NULL,
  PRIMARY KEY (action_type, marketplace, date)
);
"#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{prefix}_jobs_status ON {prefix}_jobs(status);"
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{prefix}_tasks_job ON {prefix}_tasks(job_id);"
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "INSERT INTO tenant_registry (tenant_id, schema_name, created_ms) VALUES (?, ?, ?)
         ON CONFLICT (tenant_id) DO NOTHING;"
    ))
    .bind(tenant.as_str())
    .bind(tenant.schema_name())
    .bind(crate::time::now_ms() as i64)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_ident_rejects_sql_metacharacters() {
        assert!(safe_ident("acme_corp").is_ok());
        assert!(safe_ident("acme-corp").is_err());
        assert!(safe_ident("acme; DROP TABLE x;").is_err());
        assert!(safe_ident("").is_err());
    }
}
