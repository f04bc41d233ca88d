use std::time::Duration;

use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input, rejected before any lock is taken.
    #[error("invalid request: {0}")]
    Validation(&'static str),
    /// Overlaps the listed active allocations, in start order.
    #[error("conflict with allocation(s): {}", join_ids(.0))]
    Conflict(Vec<Ulid>),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("allocation {0} is cancelled")]
    Cancelled(Ulid),
    #[error("timed out after {waited:?} waiting for resource {resource_id}")]
    Timeout {
        resource_id: String,
        waited: Duration,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::Cancelled(_) => "cancelled",
            EngineError::Timeout { .. } => "timeout",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Timeout { .. } | EngineError::WalError(_))
    }
}

fn join_ids(ids: &[Ulid]) -> String {
    ids.iter()
        .map(Ulid::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_names_every_allocation() {
        let a = Ulid::new();
        let b = Ulid::new();
        let msg = EngineError::Conflict(vec![a, b]).to_string();
        assert!(msg.contains(&a.to_string()));
        assert!(msg.contains(&b.to_string()));
    }

    #[test]
    fn timeout_is_retryable_conflict_is_not() {
        let timeout = EngineError::Timeout {
            resource_id: "desk-1".into(),
            waited: Duration::from_millis(10),
        };
        assert!(timeout.is_retryable());
        assert_eq!(timeout.label(), "timeout");
        assert!(!EngineError::Conflict(vec![]).is_retryable());
    }
}
