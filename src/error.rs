use rust_decimal::Decimal;
use std::fmt;
use thiserror::Error;

use crate::execution::{ExecutionResult, RollbackOutcome};

/// Main error type for the risk engine
#[derive(Error, Debug)]
pub enum RiskonError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Rejected before any exchange call
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid instrument rules: {0}")]
    InvalidInstrument(String),

    // Coordination errors
    #[error("Operation already in progress for owner {owner}")]
    LockContention { owner: String },

    // Exchange errors
    #[error("Exchange rejected order ({reason}): {message}")]
    ExchangeRejected {
        reason: RejectReason,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    // Execution errors carrying the full report
    #[error("Order {order_id} not filled after {elapsed_ms}ms, cancelled")]
    FillTimeout {
        order_id: String,
        elapsed_ms: u64,
        report: Box<ExecutionResult>,
    },

    #[error("Protection failed: {reason}; rollback: {rollback}")]
    ProtectionFailed {
        reason: String,
        rollback: RollbackOutcome,
        report: Box<ExecutionResult>,
    },

    #[error("Execution failed: {reason}")]
    ExecutionFailed {
        reason: String,
        report: Box<ExecutionResult>,
    },

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl RiskonError {
    /// Transient failures that a caller with a retry budget may repeat
    pub fn is_retryable(&self) -> bool {
        matches!(self, RiskonError::Network(_))
    }

    /// Execution report attached to post-side-effect failures
    pub fn report(&self) -> Option<&ExecutionResult> {
        match self {
            RiskonError::FillTimeout { report, .. }
            | RiskonError::ProtectionFailed { report, .. }
            | RiskonError::ExecutionFailed { report, .. } => Some(report),
            _ => None,
        }
    }

    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        RiskonError::ExchangeRejected {
            reason,
            message: message.into(),
        }
    }
}

/// Result type alias for RiskonError
pub type Result<T> = std::result::Result<T, RiskonError>;

/// Reasons an exchange gives for refusing an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Rejected,
    InsufficientBalance,
    InvalidParams,
    DuplicateKey,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::Rejected => "rejected",
            RejectReason::InsufficientBalance => "insufficient balance",
            RejectReason::InvalidParams => "invalid params",
            RejectReason::DuplicateKey => "duplicate key",
        };
        f.write_str(s)
    }
}

/// Errors raised synchronously before any exchange side effect
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid range: entry {entry} equals stop {stop}")]
    InvalidRange { entry: Decimal, stop: Decimal },

    #[error("Invalid intent: {0}")]
    InvalidIntent(String),

    #[error("Stop too tight: distance {distance_pct}% is inside the {min_pct}% noise zone")]
    StopTooTight {
        distance_pct: Decimal,
        min_pct: Decimal,
    },

    #[error("Limit violated: {0}")]
    Limit(#[from] LimitViolation),

    #[error("Infeasible plan: {0}")]
    InfeasiblePlan(String),

    #[error("Strategy disabled: {class}")]
    StrategyDisabled { class: String },

    #[error("Reference price required for market entry on {symbol}")]
    MissingReferencePrice { symbol: String },
}

/// Exchange quantization rules and safety limits, in inspection order
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LimitViolation {
    #[error("quantity {qty} below minimum {min}")]
    BelowMinQty { qty: Decimal, min: Decimal },

    #[error("quantity {qty} above maximum {max}")]
    AboveMaxQty { qty: Decimal, max: Decimal },

    #[error("notional {notional} below minimum {min}")]
    BelowMinNotional { notional: Decimal, min: Decimal },

    #[error("leverage {leverage}x above maximum {max}x")]
    LeverageExceeded { leverage: Decimal, max: Decimal },

    #[error("risk ${risk} above limit ${max}")]
    RiskExceeded { risk: Decimal, max: Decimal },

    #[error("margin ${margin} above limit ${max}")]
    MarginExceeded { margin: Decimal, max: Decimal },
}

impl From<LimitViolation> for RiskonError {
    fn from(err: LimitViolation) -> Self {
        RiskonError::Validation(ValidationError::Limit(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_only_network_errors_are_retryable() {
        assert!(RiskonError::Network("reset by peer".into()).is_retryable());
        assert!(!RiskonError::rejected(RejectReason::InsufficientBalance, "no funds").is_retryable());
        assert!(!RiskonError::LockContention { owner: "u1".into() }.is_retryable());
    }

    #[test]
    fn test_limit_violation_converts_to_validation() {
        let err: RiskonError = LimitViolation::BelowMinQty {
            qty: dec!(0.0005),
            min: dec!(0.001),
        }
        .into();

        assert!(matches!(
            err,
            RiskonError::Validation(ValidationError::Limit(LimitViolation::BelowMinQty { .. }))
        ));
        assert!(err.to_string().contains("below minimum"));
    }
}
