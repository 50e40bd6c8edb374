//! Core error taxonomy.
//!
//! Every service surfaces failures through this closed set of kinds.
//! Validation and domain errors are never retried; transport errors are
//! retried only by the settlement coordinator (idempotent on execution id).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient funds: required {required:.2}, available {available:.2}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("insufficient shares: required {required}, held {held}")]
    InsufficientShares { required: i64, held: i64 },

    #[error("market is not open (state: {0})")]
    MarketClosed(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("settlement failed for execution {execution_id}: {reason}")]
    SettlementFailed {
        execution_id: uuid::Uuid,
        reason: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code, used in API envelopes and webhook
    /// payloads.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            CoreError::InsufficientShares { .. } => "INSUFFICIENT_SHARES",
            CoreError::MarketClosed(_) => "MARKET_CLOSED",
            CoreError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            CoreError::SettlementFailed { .. } => "SETTLEMENT_FAILED",
            CoreError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a retry can ever succeed. Only transient store/transport
    /// failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Internal(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".to_string()),
            other => CoreError::Internal(other.to_string()),
        }
    }
}
