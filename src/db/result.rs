use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use super::value::Value;

/// A single result row
///
/// Column names are shared between all rows of one result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Value of the named column, if present
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.columns.iter().zip(&self.values) {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// Fully materialized outcome of one statement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    /// Column names in select order, known even when no row came back
    #[serde(serialize_with = "serialize_columns")]
    pub columns: Arc<[String]>,
    pub rows: Vec<Row>,
    /// Rows inserted, updated, deleted or returned, as reported by the server
    pub rows_affected: u64,
}

fn serialize_columns<S: Serializer>(
    columns: &Arc<[String]>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(columns.iter())
}

impl Default for QueryResult {
    fn default() -> Self {
        Self::new(Vec::new(), 0)
    }
}

impl QueryResult {
    /// Column names are taken from the first row, if any
    pub fn new(rows: Vec<Row>, rows_affected: u64) -> Self {
        let columns = rows
            .first()
            .map(|row| row.columns.clone())
            .unwrap_or_else(|| Arc::from(Vec::new()));
        Self {
            columns,
            rows,
            rows_affected,
        }
    }

    /// Sets the column names, for results whose statement returned no rows
    pub fn with_columns(mut self, columns: Arc<[String]>) -> Self {
        self.columns = columns;
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}
