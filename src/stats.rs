//! Stats Aggregator (C9): per-tenant, per-day success/failure counters with
//! an online running mean of task duration.

use std::sync::Arc;

use crate::error::OrchestratorError;
use crate::model::{DailyStats, Marketplace};
use crate::store::{TenantConn, TenantStore};

pub struct StatsAggregator {
    store: Arc<dyn TenantStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn TenantStore>) -> Self {
        Self { store }
    }

    /// Records one outcome against today's `(action_type, marketplace)`
    /// bucket. Insert-or-update: the first outcome of the day creates the
    /// row, every later one folds into the running mean.
    pub async fn record(
        &self,
        conn: &TenantConn,
        action_type: &str,
        marketplace: Marketplace,
        success: bool,
        duration_ms: u64,
    ) -> Result<(), OrchestratorError> {
        let today = crate::time::now_utc().date_naive();
        self.store
            .record_stats(conn, action_type, marketplace, today, success, duration_ms)
            .await
    }

    pub async fn for_day(
        &self,
        conn: &TenantConn,
        action_type: &str,
        marketplace: Marketplace,
        date: chrono::NaiveDate,
    ) -> Result<Option<DailyStats>, OrchestratorError> {
        self.store.get_stats(conn, action_type, marketplace, date).await
    }
}
