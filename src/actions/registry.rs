use std::collections::HashMap;
use std::sync::Arc;

use crate::error::OrchestratorError;
use crate::model::{Marketplace, TaskType};

use super::MarketplaceService;

/// Template for one task in an action's pipeline. [`TaskOrchestrator`]
/// (crate::orchestrator) turns each of these into a concrete [`Task`] row
/// when a job is first picked up.
#[derive(Clone, Debug)]
pub struct TaskSpec {
    pub description: String,
    pub task_type: TaskType,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            description: description.into(),
            task_type,
        }
    }
}

/// Declares the task pipeline for every `(marketplace, action_code)` pair
/// known to the orchestrator. Unknown pairs are rejected at job
/// submission time, not discovered mid-execution.
#[derive(Default)]
pub struct ActionRegistry {
    pipelines: HashMap<(Marketplace, String), Vec<TaskSpec>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, marketplace: Marketplace, action_code: impl Into<String>, steps: Vec<TaskSpec>) {
        self.pipelines.insert((marketplace, action_code.into()), steps);
    }

    pub fn pipeline_for(
        &self,
        marketplace: Marketplace,
        action_code: &str,
    ) -> Result<&[TaskSpec], OrchestratorError> {
        self.pipelines
            .get(&(marketplace, action_code.to_string()))
            .map(|v| v.as_slice())
            .ok_or_else(|| {
                OrchestratorError::InvalidInput(format!(
                    "no task pipeline registered for {action_code} on {}",
                    marketplace.as_str()
                ))
            })
    }
}

/// Resolves a [`TaskType`] to the service that executes it. One instance is
/// shared across the whole dispatcher pool — handlers are stateless and
/// safely shared across workers.
#[derive(Default, Clone)]
pub struct HandlerTable {
    services: HashMap<TaskType, Arc<dyn MarketplaceService>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: TaskType, service: Arc<dyn MarketplaceService>) {
        self.services.insert(task_type, service);
    }

    pub fn get(&self, task_type: TaskType) -> Result<Arc<dyn MarketplaceService>, OrchestratorError> {
        self.services.get(&task_type).cloned().ok_or_else(|| {
            OrchestratorError::InvariantViolation(format!(
                "no handler registered for task type {}",
                task_type.as_str()
            ))
        })
    }
}
