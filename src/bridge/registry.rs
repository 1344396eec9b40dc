use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::Tenant;

use super::types::{BridgeRequest, BridgeResponse};

pub type PendingResult = Result<BridgeResponse, OrchestratorError>;

struct Entry {
    request: BridgeRequest,
    tx: oneshot::Sender<PendingResult>,
}

/// Correlates outstanding [`BridgeRequest`](super::types::BridgeRequest)s to
/// the task awaiting their answer, keyed by `request_id`. A
/// short `parking_lot` critical section guards the map; nothing here ever
/// awaits while holding the lock.
#[derive(Default)]
pub struct PendingRegistry {
    inner: Mutex<HashMap<Uuid, Entry>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request: BridgeRequest, tx: oneshot::Sender<PendingResult>) {
        self.inner.lock().insert(request.request_id, Entry { request, tx });
    }

    pub fn remove(&self, request_id: Uuid) {
        self.inner.lock().remove(&request_id);
    }

    /// Snapshots every request still pending for `tenant`, for redelivery to
    /// a newly (re)attached session. Does not remove or complete them — they
    /// stay pending until `complete` or `fail_all_for_tenant` resolves them —
    /// a socket drop-and-reattach must not fail the request.
    pub fn requests_for_tenant(&self, tenant: &Tenant) -> Vec<BridgeRequest> {
        self.inner
            .lock()
            .values()
            .filter(|e| &e.request.tenant == tenant)
            .map(|e| e.request.clone())
            .collect()
    }

    /// Completes a pending request. Returns `false` if `request_id` is
    /// unknown — already completed, timed out, or never existed — which the
    /// caller treats as a harmless duplicate, not an error. Response
    /// application is idempotent.
    pub fn complete(&self, response: BridgeResponse) -> bool {
        let entry = self.inner.lock().remove(&response.request_id);
        match entry {
            Some(entry) => entry.tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Fails every pending request belonging to `tenant` with session-loss
    ///. Used when the plugin session disconnects. Unlike
    /// `complete`, this is a terminal error, not a shaped response — session
    /// loss must never look like a retryable upstream failure to the caller.
    pub fn fail_all_for_tenant(&self, tenant: &Tenant) {
        let mut guard = self.inner.lock();
        let ids: Vec<Uuid> = guard
            .iter()
            .filter(|(_, e)| &e.request.tenant == tenant)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(entry) = guard.remove(&id) {
                let _ = entry.tx.send(Err(OrchestratorError::SessionLost(tenant.to_string())));
            }
        }
    }
}
