//! Domain error model.

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic business failures raised by aggregates and value objects.
///
/// Storage and transport failures are modelled by the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input (negative quantity, empty code, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("not found")]
    NotFound,

    /// Duplicate creation or a stale stream revision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A movement would drive a stock bucket below zero.
    #[error("insufficient stock in {state}: available {available}, requested {requested}")]
    InsufficientStock {
        state: String,
        available: Decimal,
        requested: Decimal,
    },

    /// A workflow status change that is not in the lifecycle's transition table.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn insufficient_stock(
        state: impl Into<String>,
        available: Decimal,
        requested: Decimal,
    ) -> Self {
        Self::InsufficientStock {
            state: state.into(),
            available,
            requested,
        }
    }
}
