use thiserror::Error;

/// Stable error taxonomy for the orchestrator core.
///
/// Every variant is a distinct signalable kind independent of its caller;
/// the dispatcher consults [`OrchestratorError::retry_class`] to decide
/// between retry-with-backoff and terminal failure. Task handlers never
/// retry themselves — they classify and return.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("plugin-bridge channel saturated for tenant {0}")]
    ChannelSaturated(String),

    #[error("marketplace session lost for tenant {0}")]
    SessionLost(String),

    #[error("task timed out after {0}ms")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

/// Classification consulted by the dispatcher's retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Eligible for retry-with-backoff if `retry_count < max_retries`.
    Retryable,
    /// Never retried, regardless of remaining budget.
    Terminal,
}

impl OrchestratorError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            OrchestratorError::RateLimited(_)
            | OrchestratorError::UpstreamFailure(_)
            | OrchestratorError::ChannelSaturated(_)
            | OrchestratorError::Timeout(_) => RetryClass::Retryable,

            OrchestratorError::SessionLost(_)
            | OrchestratorError::Cancelled
            | OrchestratorError::InvalidInput(_)
            | OrchestratorError::NotFound(_)
            | OrchestratorError::IllegalTransition(_)
            | OrchestratorError::InvariantViolation(_) => RetryClass::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_class() == RetryClass::Retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_lost_is_never_retryable() {
        assert!(!OrchestratorError::SessionLost("t1".into()).is_retryable());
    }

    #[test]
    fn timeout_is_retryable() {
        assert!(OrchestratorError::Timeout(30_000).is_retryable());
    }

    #[test]
    fn cancelled_is_terminal() {
        assert_eq!(
            OrchestratorError::Cancelled.retry_class(),
            RetryClass::Terminal
        );
    }
}
