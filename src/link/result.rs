//! Row and statement result types returned by a link.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One result row, column name to value.
pub type Record = BTreeMap<String, Value>;

/// Outcome of a non-query statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Number of rows inserted, updated or deleted.
    pub rows_affected: u64,
    /// Id of the last inserted row, when the statement inserted any.
    pub last_insert_id: Option<i64>,
}

impl ExecResult {
    /// Create a result affecting `rows` rows.
    pub fn affected(rows: u64) -> Self {
        Self {
            rows_affected: rows,
            last_insert_id: None,
        }
    }
}

/// A set of rows from a SELECT query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rows {
    /// Column names in order.
    pub columns: Vec<String>,
    /// Rows as maps of column name to value.
    pub rows: Vec<Record>,
}

impl Rows {
    /// Create a new empty result set.
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns, rows: Vec::new() }
    }

    /// Create from rows, inferring columns from first row.
    pub fn from_rows(rows: Vec<Record>) -> Self {
        let columns = rows
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        Self { columns, rows }
    }

    /// Add a row.
    pub fn push(&mut self, row: Record) {
        self.rows.push(row);
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Get a row by index.
    pub fn get(&self, index: usize) -> Option<&Record> {
        self.rows.get(index)
    }

    /// Iterate over rows.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.rows.iter()
    }

    /// Iterate mutably, for hooks that post-process fetched rows.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.rows.iter_mut()
    }

    /// Collect one column across all rows, skipping rows without it.
    pub fn column(&self, name: &str) -> Vec<Value> {
        self.rows.iter().filter_map(|r| r.get(name).cloned()).collect()
    }
}

impl IntoIterator for Rows {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_rows_infers_columns() {
        let mut row = Record::new();
        row.insert("id".into(), json!(1));
        row.insert("name".into(), json!("a"));
        let rows = Rows::from_rows(vec![row]);
        assert_eq!(rows.columns, vec!["id".to_string(), "name".to_string()]);
        assert_eq!(rows.column("id"), vec![json!(1)]);
    }

    #[test]
    fn test_empty_rows() {
        let rows = Rows::from_rows(Vec::new());
        assert!(rows.is_empty());
        assert!(rows.columns.is_empty());
    }
}
