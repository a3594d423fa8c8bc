//! Error types for Plinth using snafu.
//!
//! One taxonomy serves the whole stack: caller mistakes (validation,
//! missing records, uniqueness collisions), concurrency outcomes (version
//! conflicts), server pressure (overload), authorization denials, and
//! substrate faults. The HTTP layer maps each variant to a status code;
//! the engine decides which variants are retried internally.

use snafu::{Location, Snafu};

use crate::validation::ValidationIssue;

/// Unified result type for Plinth operations.
pub type Result<T, E = PlinthError> = std::result::Result<T, E>;

/// Top-level error type for engine and storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PlinthError {
    /// Payload failed schema validation. Never retried.
    #[snafu(display("Validation failed for {collection}: {}", format_issues(issues)))]
    Validation {
        /// Collection whose schema rejected the payload.
        collection: String,
        /// The individual field-level failures.
        issues: Vec<ValidationIssue>,
    },

    /// Record absent.
    #[snafu(display("Record {collection}/{id} not found"))]
    NotFound {
        /// Collection that was searched.
        collection: String,
        /// Record ID that was not found.
        id: String,
    },

    /// A `unique` field collided with an existing record.
    #[snafu(display("Value for unique field {field} already exists in {collection}"))]
    Uniqueness {
        /// Collection holding the conflicting record.
        collection: String,
        /// The unique field that collided.
        field: String,
    },

    /// The `_version` precondition failed. Retried by the engine up to 3x.
    #[snafu(display(
        "Version conflict on {collection}/{id}: expected {expected}, found {actual}"
    ))]
    VersionConflict {
        /// Collection of the contested record.
        collection: String,
        /// Record ID of the contested record.
        id: String,
        /// Version the caller expected.
        expected: i64,
        /// Version actually stored.
        actual: i64,
    },

    /// The write buffer refused the intent because its flush queue is
    /// saturated. Retryable by the caller after a back-off.
    #[snafu(display("Write buffer overloaded ({queued} batches queued); retry later"))]
    Overload {
        /// Frozen batches awaiting commit when the intent was refused.
        queued: usize,
        /// Suggested client back-off in milliseconds.
        retry_after_ms: u64,
    },

    /// Authorization denied by the access policy. Passed through.
    #[snafu(display("Forbidden: {reason}"))]
    Forbidden {
        /// Why the request was denied.
        reason: String,
    },

    /// Lower-level fault from the KV substrate. Not retried.
    #[snafu(display("Substrate error at {location}: {message}"))]
    Substrate {
        /// Error description.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Record encoding or decoding failed.
    #[snafu(display("Serialization error at {location}: {message}"))]
    Serialization {
        /// Error description.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },
}

impl PlinthError {
    /// Returns true for errors that indicate a stale read and are retried
    /// internally by the engine.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlinthError::VersionConflict { .. })
    }

    /// Wraps a substrate fault, capturing the caller's location.
    #[track_caller]
    pub fn substrate(message: impl std::fmt::Display) -> Self {
        let loc = std::panic::Location::caller();
        PlinthError::Substrate {
            message: message.to_string(),
            location: Location::new(loc.file(), loc.line(), loc.column()),
        }
    }

    /// Wraps an encode/decode fault, capturing the caller's location.
    #[track_caller]
    pub fn serialization(message: impl std::fmt::Display) -> Self {
        let loc = std::panic::Location::caller();
        PlinthError::Serialization {
            message: message.to_string(),
            location: Location::new(loc.file(), loc.line(), loc.column()),
        }
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}
