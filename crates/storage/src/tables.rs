//! Table definitions for redb storage.
//!
//! All tables use byte keys and byte values. Keys are UTF-8 strings
//! produced by the engine's key codec, stored as bytes so the codec's
//! `0xFF` range sentinel (a byte that never occurs in UTF-8) is a valid
//! exclusive upper bound for prefix scans.

use redb::TableDefinition;

/// Table definitions for the three keyspaces.
pub struct Tables;

impl Tables {
    /// Primary rows: `{collection}:{id}` → canonical JSON record bytes.
    pub const MAIN: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("main");

    /// Secondary + uniqueness entries:
    /// `idx:{collection}:{field}:{value}:{id}` → record id,
    /// `uniq:{collection}:{field}:{value}` → owning record id.
    pub const INDEXES: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("indexes");

    /// Schema registry rows: `schema:{collection}` → JSON schema bytes.
    pub const META: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("meta");
}

#[cfg(test)]
mod tests {
    use redb::TableHandle;

    use super::*;

    #[test]
    fn test_table_names_unique() {
        let names = [Tables::MAIN.name(), Tables::INDEXES.name(), Tables::META.name()];
        let mut sorted = names.to_vec();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), names.len(), "Table names must be unique");
    }
}
