//! Collection schemas: field descriptors and payload validation.
//!
//! Each collection has an ordered list of field descriptors. The three
//! system fields `id`, `created`, `updated` are always present and
//! `updated` is always indexed (list queries sort on it by default).
//! Auth collections are materialized with `email` (required, indexed,
//! unique) and `password` (required, private).
//!
//! Schemas are permissive: validation checks declared fields only, and
//! additional properties pass through untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{FIELD_CREATED, FIELD_ID, FIELD_UPDATED, Record};
use crate::validation::ValidationIssue;

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// UTF-8 string.
    String,
    /// JSON number.
    Number,
    /// Boolean.
    Boolean,
    /// Engine-managed field (`id`, `created`, `updated`); not type-checked
    /// by payload validation.
    System,
}

/// A single field descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Present and non-empty on every record.
    #[serde(default)]
    pub required: bool,
    /// At most one record per distinct value within the collection.
    #[serde(default)]
    pub unique: bool,
    /// A secondary-index entry is maintained for this field.
    #[serde(default)]
    pub indexed: bool,
    /// Stripped from records leaving the engine.
    #[serde(default)]
    pub private: bool,
    /// Default value applied by callers on create when the field is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldDef {
    /// Creates a plain field of the given type.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            unique: false,
            indexed: false,
            private: false,
            default: None,
        }
    }

    /// Marks the field required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Marks the field unique (implies a uniqueness key is maintained).
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Marks the field indexed.
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Marks the field private (sanitized away on reads).
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }
}

/// An ordered list of field descriptors for one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Declared fields, in order.
    pub fields: Vec<FieldDef>,
}

impl Schema {
    /// Creates a schema from the given fields, normalizing system fields
    /// (see [`Schema::fill_system_fields`]).
    pub fn new(fields: Vec<FieldDef>) -> Self {
        let mut schema = Self { fields };
        schema.fill_system_fields();
        schema
    }

    /// The schema auto-materialized for auth collections (`users` and the
    /// superuser collection).
    pub fn auth() -> Self {
        Self::new(vec![
            FieldDef::new("email", FieldType::String).required().indexed().unique(),
            FieldDef::new("password", FieldType::String).required().private(),
        ])
    }

    /// Ensures `id`, `created`, `updated` exist as system fields and that
    /// `updated` is indexed. Idempotent.
    pub fn fill_system_fields(&mut self) {
        for name in [FIELD_ID, FIELD_CREATED, FIELD_UPDATED] {
            if !self.fields.iter().any(|f| f.name == name) {
                self.fields.push(FieldDef::new(name, FieldType::System));
            }
        }
        if let Some(updated) = self.fields.iter_mut().find(|f| f.name == FIELD_UPDATED) {
            updated.indexed = true;
        }
    }

    /// Looks up a field descriptor by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields with a maintained secondary index.
    pub fn indexed_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.indexed)
    }

    /// Fields with a uniqueness constraint.
    pub fn unique_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.unique)
    }

    /// Names of fields stripped on the way out.
    pub fn private_field_names(&self) -> Vec<&str> {
        self.fields.iter().filter(|f| f.private).map(|f| f.name.as_str()).collect()
    }

    /// Validates a record payload against the declared fields.
    ///
    /// Enforces: `required` fields present and non-empty; provided values
    /// of `string`/`number`/`boolean` fields match the declared type.
    /// `system` fields are not type-checked here, and undeclared extras
    /// pass through.
    ///
    /// # Errors
    ///
    /// Returns every issue found, not just the first.
    pub fn validate(&self, record: &Record) -> Result<(), Vec<ValidationIssue>> {
        let mut issues = Vec::new();

        for field in &self.fields {
            let value = record.get(&field.name);

            if field.required && !is_present(value) {
                issues.push(ValidationIssue::new(&field.name, "is required"));
                continue;
            }

            let Some(value) = value else { continue };
            if value.is_null() {
                continue;
            }

            let ok = match field.field_type {
                FieldType::String => value.is_string(),
                FieldType::Number => value.is_number(),
                FieldType::Boolean => value.is_boolean(),
                FieldType::System => true,
            };
            if !ok {
                issues.push(ValidationIssue::new(
                    &field.name,
                    format!("expected {}", type_name(field.field_type)),
                ));
            }
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn type_name(t: FieldType) -> &'static str {
    match t {
        FieldType::String => "string",
        FieldType::Number => "number",
        FieldType::Boolean => "boolean",
        FieldType::System => "system",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn posts_schema() -> Schema {
        Schema::new(vec![
            FieldDef::new("title", FieldType::String).required(),
            FieldDef::new("views", FieldType::Number).indexed(),
            FieldDef::new("draft", FieldType::Boolean),
        ])
    }

    fn record(value: serde_json::Value) -> Record {
        Record::from_value(value).expect("object")
    }

    #[test]
    fn test_system_fields_filled_in() {
        let schema = posts_schema();
        for name in [FIELD_ID, FIELD_CREATED, FIELD_UPDATED] {
            let field = schema.field(name).expect("system field present");
            assert_eq!(field.field_type, FieldType::System);
        }
        assert!(schema.field(FIELD_UPDATED).unwrap().indexed, "updated is always indexed");
    }

    #[test]
    fn test_fill_is_idempotent() {
        let mut schema = posts_schema();
        let before = schema.fields.len();
        schema.fill_system_fields();
        assert_eq!(schema.fields.len(), before);
    }

    #[test]
    fn test_auth_schema_shape() {
        let schema = Schema::auth();
        let email = schema.field("email").unwrap();
        assert!(email.required && email.indexed && email.unique);
        let password = schema.field("password").unwrap();
        assert!(password.required && password.private);
        assert_eq!(schema.private_field_names(), vec!["password"]);
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        let schema = posts_schema();
        let r = record(json!({"title": "a", "views": 10, "draft": false, "extra": [1]}));
        assert!(schema.validate(&r).is_ok());
    }

    #[test]
    fn test_validate_required_missing_or_empty() {
        let schema = posts_schema();
        for payload in [json!({}), json!({"title": ""}), json!({"title": null})] {
            let issues = schema.validate(&record(payload)).unwrap_err();
            assert_eq!(issues.len(), 1);
            assert_eq!(issues[0].field, "title");
        }
    }

    #[test]
    fn test_validate_type_mismatches() {
        let schema = posts_schema();
        let r = record(json!({"title": "a", "views": "many", "draft": "yes"}));
        let issues = schema.validate(&r).unwrap_err();
        let fields: Vec<_> = issues.iter().map(|i| i.field.as_str()).collect();
        assert_eq!(fields, vec!["views", "draft"]);
    }

    #[test]
    fn test_validate_skips_null_optionals_and_system() {
        let schema = posts_schema();
        let r = record(json!({"title": "a", "views": null, "id": 12345}));
        // `id` is a system field: not type-checked even though it's a number here.
        assert!(schema.validate(&r).is_ok());
    }

    #[test]
    fn test_schema_serde_round_trip() {
        let schema = posts_schema();
        let encoded = serde_json::to_string(&schema).unwrap();
        let back: Schema = serde_json::from_str(&encoded).unwrap();
        assert_eq!(schema, back);
    }
}
