//! Proptest strategies for Plinth domain types.
//!
//! Reusable generators producing well-formed collections, fields,
//! schemas, and record payloads while still exploring edge cases
//! through random variation.
//!
//! # Usage
//!
//! ```no_run
//! use plinth_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(payload in strategies::arb_payload()) {
//!         // exercise an invariant with a random record payload
//!     }
//! }
//! ```

use plinth_types::{FieldDef, FieldType, Record, Schema};
use proptest::prelude::*;
use serde_json::{Map, Value};

/// A valid collection name: `[A-Za-z][A-Za-z0-9_]{0,15}`, optionally
/// with a leading underscore (a system collection).
pub fn arb_collection_name() -> impl Strategy<Value = String> {
    (proptest::bool::ANY, "[A-Za-z][A-Za-z0-9_]{0,15}")
        .prop_map(|(system, name)| if system { format!("_{name}") } else { name })
}

/// A field name: `[a-z][a-z0-9_]{0,15}`, never a system field name.
pub fn arb_field_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}".prop_filter("system field names are reserved", |name| {
        !matches!(name.as_str(), "id" | "created" | "updated")
    })
}

/// A scalar field type (never `system`).
pub fn arb_field_type() -> impl Strategy<Value = FieldType> {
    prop_oneof![
        Just(FieldType::String),
        Just(FieldType::Number),
        Just(FieldType::Boolean),
    ]
}

/// A field descriptor with random flags.
pub fn arb_field_def() -> impl Strategy<Value = FieldDef> {
    (arb_field_name(), arb_field_type(), any::<[bool; 4]>()).prop_map(
        |(name, field_type, [required, unique, indexed, private])| FieldDef {
            name,
            field_type,
            required,
            unique,
            indexed,
            private,
            default: None,
        },
    )
}

/// A schema of 0-6 declared fields (system fields filled in).
pub fn arb_schema() -> impl Strategy<Value = Schema> {
    proptest::collection::vec(arb_field_def(), 0..6).prop_map(|mut fields| {
        // Duplicate names collapse to the first occurrence, as a hand
        // written schema would.
        fields.dedup_by(|a, b| a.name == b.name);
        Schema::new(fields)
    })
}

/// A scalar JSON value.
pub fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        "[a-z0-9 ]{0,20}".prop_map(Value::from),
        any::<i32>().prop_map(|n| Value::from(n as i64)),
        any::<bool>().prop_map(Value::from),
        Just(Value::Null),
    ]
}

/// A record payload of 0-8 scalar fields.
pub fn arb_payload() -> impl Strategy<Value = Record> {
    proptest::collection::btree_map(arb_field_name(), arb_scalar(), 0..8).prop_map(|fields| {
        let map: Map<String, Value> = fields.into_iter().collect();
        Record::from_map(map)
    })
}

/// A payload that satisfies `schema`: every required field present with
/// a value of the declared type.
pub fn arb_payload_for(schema: &Schema) -> impl Strategy<Value = Record> + use<> {
    let required: Vec<(String, FieldType)> = schema
        .fields
        .iter()
        .filter(|f| f.required && f.field_type != FieldType::System)
        .map(|f| (f.name.clone(), f.field_type))
        .collect();

    arb_payload().prop_flat_map(move |base| {
        let mut strategies: Vec<BoxedStrategy<(String, Value)>> = Vec::new();
        for (name, field_type) in &required {
            let name = name.clone();
            let value: BoxedStrategy<Value> = match field_type {
                FieldType::String => "[a-z]{1,12}".prop_map(Value::from).boxed(),
                FieldType::Number => any::<i32>().prop_map(|n| Value::from(n as i64)).boxed(),
                FieldType::Boolean => any::<bool>().prop_map(Value::from).boxed(),
                FieldType::System => unreachable!("filtered above"),
            };
            strategies.push(value.prop_map(move |v| (name.clone(), v)).boxed());
        }
        (Just(base), strategies).prop_map(|(mut base, required_values)| {
            for (name, value) in required_values {
                base.insert(name, value);
            }
            base
        })
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use plinth_types::validate_collection_name;

    use super::*;

    proptest! {
        #[test]
        fn generated_collection_names_are_valid(name in arb_collection_name()) {
            prop_assert!(validate_collection_name(&name).is_ok());
        }

        #[test]
        fn generated_schemas_carry_system_fields(schema in arb_schema()) {
            prop_assert!(schema.field("id").is_some());
            prop_assert!(schema.field("updated").unwrap().indexed);
        }

        #[test]
        fn payload_for_schema_validates(
            (schema, payload) in arb_schema().prop_flat_map(|schema| {
                let payload = arb_payload_for(&schema);
                (Just(schema), payload)
            })
        ) {
            // Required fields are satisfied; type mismatches can only come
            // from optional base fields colliding with declared names.
            if let Err(issues) = schema.validate(&payload) {
                for issue in issues {
                    prop_assert_ne!(issue.constraint.as_str(), "is required");
                }
            }
        }
    }
}
