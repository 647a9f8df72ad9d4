//! # Error Types
//!
//! Domain-specific error types for scholar-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  scholar-core errors (this file)                                       │
//! │  ├── CoreError        - Record decoding and rule violations            │
//! │  └── ValidationError  - Payload / write validation failures            │
//! │                                                                         │
//! │  scholar-db errors                                                     │
//! │  └── DbError          - Local store failures                           │
//! │                                                                         │
//! │  scholar-sync errors                                                   │
//! │  ├── RemoteError      - HTTP / transport failures                      │
//! │  └── CacheError       - What the UI sees (kind + message)              │
//! │                                                                         │
//! │  Flow: ValidationError → DbError → CacheError { kind } → UI            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core model errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A stored status string is not one of the known values.
    #[error("Unknown {field} value: '{value}'")]
    UnknownStatus { field: String, value: String },

    /// A stored JSON payload could not be decoded.
    #[error("Payload for {entity} {id} could not be decoded: {reason}")]
    PayloadDecode {
        entity: String,
        id: String,
        reason: String,
    },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised when a record or queued write is checked at the store boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., bad checksum, bad URL scheme).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

impl ValidationError {
    /// Shorthand for a [`ValidationError::Required`] on `field`.
    pub fn required(field: impl Into<String>) -> Self {
        ValidationError::Required {
            field: field.into(),
        }
    }

    /// Shorthand for a [`ValidationError::InvalidFormat`].
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidFormat {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
