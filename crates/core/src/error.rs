//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failure of a domain rule.
///
/// Storage, transport and retry concerns live in the infrastructure errors; a
/// `DomainError` always means the same input would fail the same way again,
/// except for [`DomainError::Conflict`], which depends on what else was written.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Rejected field value (negative price or stock, empty name, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Text that does not parse as an identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A stale concurrency stamp was presented.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Whether re-reading fresh state could make the same change succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
