//! Plugin Bridge (C7): request/response correlation with a browser-extension
//! session, push-mode delivery when the session is live, long-poll fallback
//! otherwise.

pub mod registry;
pub mod types;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::Tenant;

pub use types::{BridgeRequest, BridgeResponse};

struct TenantQueue {
    push: Option<mpsc::Sender<BridgeRequest>>,
    poll_queue: VecDeque<BridgeRequest>,
}

impl TenantQueue {
    fn new() -> Self {
        Self {
            push: None,
            poll_queue: VecDeque::new(),
        }
    }
}

pub struct PluginBridge {
    pending: registry::PendingRegistry,
    tenants: RwLock<HashMap<Tenant, TenantQueue>>,
    queue_capacity: usize,
}

impl PluginBridge {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            pending: registry::PendingRegistry::new(),
            tenants: RwLock::new(HashMap::new()),
            queue_capacity,
        }
    }

    /// Registers a live push session for `tenant`, returning the receiving
    /// end the websocket writer loop drains. Replaces any prior session for
    /// the same tenant without disturbing requests already pending.
    ///
    /// This is also the reattach path: a socket that drops and
    /// reconnects while requests are still awaiting an answer is not a
    /// session loss, so every request still pending for `tenant` is
    /// re-enqueued onto the new session (falling back to the long-poll queue
    /// if the push channel can't take it) instead of being failed. Session
    /// loss is a distinct, explicit event — see [`PluginBridge::detach_session`].
    pub async fn attach_session(&self, tenant: Tenant) -> mpsc::Receiver<BridgeRequest> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        {
            let mut guard = self.tenants.write().await;
            let q = guard.entry(tenant.clone()).or_insert_with(TenantQueue::new);
            q.push = Some(tx);
        }

        for request in self.pending.requests_for_tenant(&tenant) {
            let _ = self.enqueue(request).await;
        }

        rx
    }

    /// Tears down a tenant's live session and fails every request still
    /// awaiting an answer with [`OrchestratorError::SessionLost`].
    /// The embedder calls this on an explicit session-loss notification, not
    /// on a transient reconnect — see [`PluginBridge::attach_session`].
    pub async fn detach_session(&self, tenant: &Tenant) {
        if let Some(q) = self.tenants.write().await.get_mut(tenant) {
            q.push = None;
            q.poll_queue.clear();
        }
        self.pending.fail_all_for_tenant(tenant);
    }

    /// Sends `request` to the plugin and awaits its answer, push mode if a
    /// live session exists, long-poll queue otherwise. Never retries
    /// internally — callers classify [`OrchestratorError`] and
    /// decide.
    pub async fn dispatch(
        &self,
        request: BridgeRequest,
        timeout: Duration,
    ) -> Result<BridgeResponse, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request.clone(), tx);

        if let Err(e) = self.enqueue(request.clone()).await {
            self.pending.remove(request.request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OrchestratorError::UpstreamFailure(
                "plugin bridge response channel dropped".into(),
            )),
            Err(_) => {
                self.pending.remove(request.request_id);
                Err(OrchestratorError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    async fn enqueue(&self, request: BridgeRequest) -> Result<(), OrchestratorError> {
        let mut guard = self.tenants.write().await;
        let q = guard
            .entry(request.tenant.clone())
            .or_insert_with(TenantQueue::new);

        if let Some(sender) = &q.push {
            match sender.try_send(request.clone()) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Push channel saturated; fall through to poll queue.
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    q.push = None;
                }
            }
        }

        if q.poll_queue.len() >= self.queue_capacity {
            return Err(OrchestratorError::ChannelSaturated(request.tenant.to_string()));
        }
        q.poll_queue.push_back(request);
        Ok(())
    }

    /// Long-poll fallback: drains any requests already queued for `tenant`,
    /// otherwise waits up to `max_wait` for one to arrive.
    pub async fn poll(&self, tenant: &Tenant, max_wait: Duration) -> Vec<BridgeRequest> {
        let drained = self.drain(tenant).await;
        if !drained.is_empty() {
            return drained;
        }

        let step = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        while waited < max_wait {
            tokio::time::sleep(step).await;
            waited += step;
            let drained = self.drain(tenant).await;
            if !drained.is_empty() {
                return drained;
            }
        }
        Vec::new()
    }

    async fn drain(&self, tenant: &Tenant) -> Vec<BridgeRequest> {
        let mut guard = self.tenants.write().await;
        match guard.get_mut(tenant) {
            Some(q) if !q.poll_queue.is_empty() => q.poll_queue.drain(..).collect(),
            _ => Vec::new(),
        }
    }

    /// Applies the plugin's answer to a previously dispatched request.
    /// Applying the same `request_id` twice is a no-op — idempotent by
    /// design.
    pub fn report(&self, response: BridgeResponse) {
        self.pending.complete(response);
    }
}

pub type SharedBridge = Arc<PluginBridge>;

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tenant: &Tenant) -> BridgeRequest {
        BridgeRequest {
            request_id: Uuid::new_v4(),
            tenant: tenant.clone(),
            job_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            action: "sync_listing".into(),
            payload: serde_json::json!({}),
            deadline_ms: crate::time::now_ms() as i64 + 30_000,
        }
    }

    #[tokio::test]
    async fn long_poll_delivers_once_report_arrives_after_empty_poll() {
        let bridge = Arc::new(PluginBridge::new(8));
        let tenant = Tenant::new("acme");

        let poll_bridge = bridge.clone();
        let poll_tenant = tenant.clone();
        let poll_task = tokio::spawn(async move {
            poll_bridge.poll(&poll_tenant, Duration::from_millis(500)).await
        });

        // Give the poller a chance to observe an empty queue first.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let req = request(&tenant);
        let req_id = req.request_id;
        let dispatch_bridge = bridge.clone();
        let dispatch_task =
            tokio::spawn(async move { dispatch_bridge.dispatch(req, Duration::from_millis(500)).await });

        let delivered = poll_task.await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].request_id, req_id);

        bridge.report(BridgeResponse {
            request_id: req_id,
            success: true,
            result: serde_json::json!({"ok": true}),
            error: None,
        });

        let outcome = dispatch_task.await.unwrap().unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn push_session_delivers_without_poll() {
        let bridge = Arc::new(PluginBridge::new(8));
        let tenant = Tenant::new("acme");
        let mut rx = bridge.attach_session(tenant.clone()).await;

        let req = request(&tenant);
        let req_id = req.request_id;
        let dispatch_bridge = bridge.clone();
        let dispatch_task =
            tokio::spawn(async move { dispatch_bridge.dispatch(req, Duration::from_millis(500)).await });

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.request_id, req_id);

        bridge.report(BridgeResponse {
            request_id: req_id,
            success: true,
            result: serde_json::Value::Null,
            error: None,
        });

        assert!(dispatch_task.await.unwrap().unwrap().success);
    }

    #[tokio::test]
    async fn detach_session_fails_pending_requests_with_session_lost() {
        let bridge = Arc::new(PluginBridge::new(8));
        let tenant = Tenant::new("acme");
        let _rx = bridge.attach_session(tenant.clone()).await;

        let req = request(&tenant);
        let dispatch_bridge = bridge.clone();
        let dispatch_tenant = tenant.clone();
        let dispatch_task =
            tokio::spawn(async move { dispatch_bridge.dispatch(req, Duration::from_millis(500)).await });

        // Let dispatch register itself as pending before severing the session.
        tokio::time::sleep(Duration::from_millis(20)).await;
        bridge.detach_session(&dispatch_tenant).await;

        let err = dispatch_task.await.unwrap().unwrap_err();
        assert!(matches!(err, OrchestratorError::SessionLost(_)));
    }

    #[tokio::test]
    async fn reattach_redelivers_pending_request_without_failing_it() {
        let bridge = Arc::new(PluginBridge::new(8));
        let tenant = Tenant::new("acme");
        let _first_session = bridge.attach_session(tenant.clone()).await;

        let req = request(&tenant);
        let req_id = req.request_id;
        let dispatch_bridge = bridge.clone();
        let dispatch_task =
            tokio::spawn(async move { dispatch_bridge.dispatch(req, Duration::from_millis(500)).await });

        // Let the request register as pending before the socket "drops".
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Reattach: a fresh session for the same tenant, simulating a
        // reconnect. The pending request must show up on it, not be failed.
        let mut second_session = bridge.attach_session(tenant.clone()).await;
        let redelivered = second_session.recv().await.unwrap();
        assert_eq!(redelivered.request_id, req_id);

        bridge.report(BridgeResponse {
            request_id: req_id,
            success: true,
            result: serde_json::Value::Null,
            error: None,
        });

        assert!(dispatch_task.await.unwrap().unwrap().success);
    }

    #[tokio::test]
    async fn report_with_unknown_request_id_is_a_harmless_no_op() {
        let bridge = PluginBridge::new(8);
        bridge.report(BridgeResponse {
            request_id: Uuid::new_v4(),
            success: true,
            result: serde_json::Value::Null,
            error: None,
        });
    }
}
