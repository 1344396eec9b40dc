//! Action Registry and Handlers (C4): maps `(marketplace, action_code)` to
//! an ordered task template, and each [`TaskType`](crate::model::TaskType)
//! to the service that actually executes it.

pub mod registry;
pub mod stub_services;

pub use registry::{ActionRegistry, HandlerTable, TaskSpec};

use async_trait::async_trait;

use crate::error::OrchestratorError;
use crate::model::{ActionOutcome, Job, Task};

/// One concrete executor for a [`TaskType`](crate::model::TaskType). Never
/// retries internally — it classifies failure via [`OrchestratorError`] and
/// returns; the dispatcher owns retry policy.
#[async_trait]
pub trait MarketplaceService: Send + Sync {
    async fn execute(&self, job: &Job, task: &Task) -> Result<ActionOutcome, OrchestratorError>;
}
