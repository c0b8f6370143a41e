use ulid::Ulid;

/// Every failure a store, catalog, engine, or ledger operation can surface.
///
/// Only [`EngineError::TransientStore`] is retryable; everything else describes
/// a state of the world that retrying the same call will not change.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("capacity {0} exceeded: all seats occupied")]
    CapacityExceeded(u32),

    #[error("conflict with {with}: {reason}")]
    Conflict { with: Ulid, reason: &'static str },

    #[error("transient store error: {0}")]
    TransientStore(String),

    #[error("validation failed: {0}")]
    Validation(&'static str),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientStore(_))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::CapacityExceeded(_) => "capacity_exceeded",
            EngineError::Conflict { .. } => "conflict",
            EngineError::TransientStore(_) => "transient",
            EngineError::Validation(_) => "validation",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
        }
    }
}
