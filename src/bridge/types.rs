use serde_json::Value;
use uuid::Uuid;

use crate::model::Tenant;

/// A request proxied out to the tenant's plugin session.
#[derive(Clone, Debug)]
pub struct BridgeRequest {
    pub request_id: Uuid,
    pub tenant: Tenant,
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub action: String,
    pub payload: Value,
    pub deadline_ms: i64,
}

/// The plugin's answer to one [`BridgeRequest`], correlated by `request_id`.
/// Applying the same response twice is a no-op — response application is
/// idempotent.
#[derive(Clone, Debug)]
pub struct BridgeResponse {
    pub request_id: Uuid,
    pub success: bool,
    pub result: Value,
    pub error: Option<String>,
}
