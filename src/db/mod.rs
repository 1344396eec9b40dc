pub mod schema;

use std::sync::Arc;

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;

use crate::model::Tenant;

#[derive(Clone)]
pub struct Db {
    pub pool: Arc<AnyPool>,
}

impl Db {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = AnyPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Bootstraps the shared reference schema. Per-tenant tables are cloned
    /// lazily on first bind (`schema::ensure_tenant_schema`), not here.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        schema::migrate_shared(&self.pool).await
    }

    pub async fn ensure_tenant(&self, tenant: &Tenant) -> anyhow::Result<()> {
        schema::ensure_tenant_schema(&self.pool, tenant).await
    }
}
