//! Core types and errors for Plinth.
//!
//! This crate provides the foundational types used throughout the server:
//! - JSON-object records with system fields and versioning
//! - Collection schemas (field descriptors and payload validation)
//! - The unified error taxonomy using snafu
//! - Record ID token generation
//! - RFC 3339 timestamp helpers

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod record;
pub mod schema;
pub mod time;
pub mod token;
pub mod validation;

// Re-export commonly used types at crate root
pub use error::{PlinthError, Result};
pub use record::{
    FIELD_CREATED, FIELD_ID, FIELD_UPDATED, FIELD_VERSION, Record, loosely_equal,
};
pub use schema::{FieldDef, FieldType, Schema};
pub use validation::{ValidationIssue, is_system_collection, validate_collection_name};
