//! Deterministic fixtures.

use plinth_types::{FieldDef, FieldType, Record, Schema};

/// The `posts` schema used across the test suites: required `title`,
/// indexed `owner_id` and `views`, unique `slug`.
pub fn posts_schema() -> Schema {
    Schema::new(vec![
        FieldDef::new("title", FieldType::String).required(),
        FieldDef::new("owner_id", FieldType::String).indexed(),
        FieldDef::new("views", FieldType::Number).indexed(),
        FieldDef::new("slug", FieldType::String).unique(),
    ])
}

/// Builds a record from a JSON literal; panics on non-objects, which is
/// what a test wants.
pub fn record(value: serde_json::Value) -> Record {
    Record::from_value(value).expect("fixture payload must be a JSON object")
}
