//! Key encoding for the three keyspaces.
//!
//! All keys are UTF-8 strings over the ordered KV substrate:
//!
//! - primary rows: `{collection}:{id}`
//! - secondary index: `idx:{collection}:{field}:{value}:{id}` (value =
//!   record id)
//! - uniqueness: `uniq:{collection}:{field}:{value}` (value = owning id)
//! - schemas: `schema:{collection}`
//!
//! Values of `number` fields have their integer digits left-padded to
//! 20 and any fractional digits right-padded to 10, so that
//! lexicographic range scans preserve numeric order. Prefix scans use the
//! inclusive prefix as the low end and the prefix with a `0xFF` byte
//! appended as the exclusive high end; `0xFF` never occurs in UTF-8, so
//! every key with the prefix falls inside the range.

use serde_json::Value;

/// Width of the zero-padded integer digits in numeric index values.
const NUMBER_PAD_WIDTH: usize = 20;

/// Width the fractional digits are right-padded to. Longer fractions
/// are kept whole, so distinct values never collide.
const FRACTION_PAD_WIDTH: usize = 10;

/// Primary row key: `{collection}:{id}`.
pub fn record_key(collection: &str, id: &str) -> String {
    format!("{collection}:{id}")
}

/// Prefix covering every primary row of a collection.
pub fn record_prefix(collection: &str) -> String {
    format!("{collection}:")
}

/// Secondary index entry key: `idx:{collection}:{field}:{value}:{id}`.
pub fn index_key(collection: &str, field: &str, value: &Value, id: &str) -> String {
    format!("idx:{collection}:{field}:{}:{id}", normalize_value(value))
}

/// Prefix covering every index entry for one `(field, value)` pair.
pub fn index_prefix(collection: &str, field: &str, value: &Value) -> String {
    format!("idx:{collection}:{field}:{}:", normalize_value(value))
}

/// Uniqueness key: `uniq:{collection}:{field}:{value}`.
pub fn unique_key(collection: &str, field: &str, value: &Value) -> String {
    format!("uniq:{collection}:{field}:{}", normalize_value(value))
}

/// Schema registry key: `schema:{collection}`.
pub fn schema_key(collection: &str) -> String {
    format!("schema:{collection}")
}

/// Canonical string form of a field value inside index and uniqueness
/// keys. Integer digits of numbers are zero-padded to 20 and fractional
/// digits right-padded to 10 (byte order equals numeric order), strings
/// are raw, booleans spell `true`/`false`, null is empty.
pub fn normalize_value(value: &Value) -> String {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                format!("{i:0width$}", width = NUMBER_PAD_WIDTH)
            } else {
                normalize_float(n.as_f64().unwrap_or(0.0))
            }
        },
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        // Arrays/objects are not indexable; their JSON spelling keeps the
        // key deterministic if one slips through.
        other => other.to_string(),
    }
}

/// Key form of a non-integer number. Padding each side of the decimal
/// point independently keeps byte comparison aligned with numeric
/// comparison: `12.45` and `12.5` share the padded integer digits, and
/// `"4500000000" < "5000000000"` matches `0.45 < 0.5`.
fn normalize_float(value: f64) -> String {
    let text = format!("{value}");
    match text.split_once('.') {
        Some((int_part, frac_part)) => format!(
            "{int_part:0>int_width$}.{frac_part:0<frac_width$}",
            int_width = NUMBER_PAD_WIDTH,
            frac_width = FRACTION_PAD_WIDTH,
        ),
        // Integral value: same form as the integer path.
        None => format!("{text:0>width$}", width = NUMBER_PAD_WIDTH),
    }
}

/// Byte bounds `[prefix, prefix ++ 0xFF)` for a prefix range scan.
pub fn prefix_range(prefix: &str) -> (Vec<u8>, Vec<u8>) {
    let start = prefix.as_bytes().to_vec();
    let mut end = start.clone();
    end.push(0xFF);
    (start, end)
}
