//! Structured validation failures and collection-name checks.
//!
//! Schema-level payload validation lives on [`crate::Schema`]; this module
//! holds the issue type those checks produce and the collection-name rule
//! shared by the engine and the HTTP layer.
//!
//! Collection names match `[A-Za-z0-9_]+`. A leading underscore marks a
//! *system* collection (schema registry, superusers, rate-limit table):
//! addressable through the same CRUD surface but hidden from external
//! clients by the access policy.

use std::fmt;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationIssue {
    /// The field that failed validation.
    pub field: String,
    /// Description of the violated constraint.
    pub constraint: String,
}

impl ValidationIssue {
    /// Creates an issue for `field` violating `constraint`.
    pub fn new(field: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self { field: field.into(), constraint: constraint.into() }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.constraint)
    }
}

/// Validates a collection name against `[A-Za-z0-9_]+`.
///
/// # Errors
///
/// Returns a [`ValidationIssue`] if the name is empty or contains a
/// character outside the whitelist.
pub fn validate_collection_name(name: &str) -> Result<(), ValidationIssue> {
    if name.is_empty() {
        return Err(ValidationIssue::new("collection", "must not be empty"));
    }
    if let Some(pos) = name.find(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
        return Err(ValidationIssue::new(
            "collection",
            format!(
                "contains invalid character {:?} at byte offset {pos}; allowed: [A-Za-z0-9_]",
                name[pos..].chars().next().unwrap_or('\0'),
            ),
        ));
    }
    Ok(())
}

/// Returns true if `name` denotes a system collection (leading underscore).
pub fn is_system_collection(name: &str) -> bool {
    name.starts_with('_')
}
