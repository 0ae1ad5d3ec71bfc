//! Query result rows.
//!
//! Values are always carried as text: the wire format this client negotiates
//! for every parameter and every result column. Typed decoding into Rust
//! types (by OID) is left to the caller.

use crate::protocol::backend::query::RowDescription;
use crate::protocol::types::Oid;

/// Metadata for a single result column.
#[derive(Debug, Clone)]
pub struct ColumnMetadata {
    /// Column name as reported by the server.
    pub name: String,
    /// Data type OID.
    pub type_oid: Oid,
}

impl ColumnMetadata {
    pub(crate) fn from_description(desc: &RowDescription<'_>) -> Vec<Self> {
        desc.iter()
            .map(|field| Self {
                name: field.name.to_string(),
                type_oid: field.type_oid(),
            })
            .collect()
    }
}

/// A single row of a query result.
///
/// Columns are accessed by index or by name against the shared
/// [`ColumnMetadata`] of the result set. A `None` entry represents SQL NULL.
#[derive(Debug, Clone)]
pub struct Row {
    columns: std::sync::Arc<[ColumnMetadata]>,
    values: Vec<Option<String>>,
}

impl Row {
    pub(crate) fn new(columns: std::sync::Arc<[ColumnMetadata]>, values: Vec<Option<String>>) -> Self {
        Self { columns, values }
    }

    /// Column metadata for this row's result set.
    pub fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether this row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a column's text value by position.
    ///
    /// Returns `None` if the column is out of range or the value is NULL;
    /// use [`Row::is_null`] to distinguish the two when that matters.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index)?.as_deref()
    }

    /// Whether the column at `index` is SQL NULL.
    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(None))
    }

    /// Get a column's text value by name (first match).
    pub fn get_by_name(&self, name: &str) -> Option<&str> {
        let index = self.columns.iter().position(|c| c.name == name)?;
        self.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> std::sync::Arc<[ColumnMetadata]> {
        std::sync::Arc::from(vec![
            ColumnMetadata {
                name: "id".to_string(),
                type_oid: crate::protocol::types::oid::INT4,
            },
            ColumnMetadata {
                name: "name".to_string(),
                type_oid: crate::protocol::types::oid::TEXT,
            },
        ])
    }

    #[test]
    fn get_returns_text_value() {
        let row = Row::new(columns(), vec![Some("1".to_string()), Some("alice".to_string())]);
        assert_eq!(row.get(0), Some("1"));
        assert_eq!(row.get_by_name("name"), Some("alice"));
    }

    #[test]
    fn null_column_reports_is_null() {
        let row = Row::new(columns(), vec![Some("1".to_string()), None]);
        assert!(row.is_null(1));
        assert_eq!(row.get(1), None);
    }

    #[test]
    fn unknown_column_name_returns_none() {
        let row = Row::new(columns(), vec![Some("1".to_string()), None]);
        assert_eq!(row.get_by_name("nope"), None);
    }
}
