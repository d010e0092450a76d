//! Record batches: the same table in row-oriented or column-oriented form

use crate::error::{Result, ServingError};
use crate::types::value::Value;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

/// One row: field name to value, in insertion order
pub type Record = IndexMap<String, Value>;

/// Table layout of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    /// Sequence of field maps
    Records,
    /// Column names plus a row-major value matrix
    Split,
}

/// A table of named columns.
///
/// A field absent from a record is a null cell, so `Records` and `Split`
/// convert into each other without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordBatch {
    Records(Vec<Record>),
    Split {
        columns: Vec<String>,
        data: Vec<Vec<Value>>,
    },
}

impl RecordBatch {
    /// Build a column-oriented batch, checking that it is rectangular
    pub fn split(columns: Vec<String>, data: Vec<Vec<Value>>) -> Result<Self> {
        let batch = RecordBatch::Split { columns, data };
        batch.validate()?;
        Ok(batch)
    }

    pub fn orientation(&self) -> Orientation {
        match self {
            RecordBatch::Records(_) => Orientation::Records,
            RecordBatch::Split { .. } => Orientation::Split,
        }
    }

    pub fn num_rows(&self) -> usize {
        match self {
            RecordBatch::Records(rows) => rows.len(),
            RecordBatch::Split { data, .. } => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Column names in first-seen order
    pub fn column_names(&self) -> Vec<String> {
        match self {
            RecordBatch::Records(rows) => {
                let mut names: IndexSet<&str> = IndexSet::new();
                for row in rows {
                    names.extend(row.keys().map(String::as_str));
                }
                names.into_iter().map(str::to_string).collect()
            }
            RecordBatch::Split { columns, .. } => columns.clone(),
        }
    }

    /// Check structural invariants: unique column names and rows as wide as
    /// the column list
    pub fn validate(&self) -> Result<()> {
        if let RecordBatch::Split { columns, data } = self {
            let mut seen = IndexSet::with_capacity(columns.len());
            for column in columns {
                if !seen.insert(column.as_str()) {
                    return Err(ServingError::MalformedPayload(format!(
                        "duplicate column '{}'",
                        column
                    )));
                }
            }
            for (i, row) in data.iter().enumerate() {
                if row.len() != columns.len() {
                    return Err(ServingError::MalformedPayload(format!(
                        "row {} has {} values but there are {} columns",
                        i,
                        row.len(),
                        columns.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Row view of the batch
    pub fn to_records(&self) -> Vec<Record> {
        match self {
            RecordBatch::Records(rows) => rows.clone(),
            RecordBatch::Split { columns, data } => data
                .iter()
                .map(|row| columns.iter().cloned().zip(row.iter().cloned()).collect())
                .collect(),
        }
    }

    /// Assemble a batch of the requested orientation from rows.
    ///
    /// For `Split`, `columns` fixes the column order when given; otherwise the
    /// first-seen order across rows is used. Missing fields become nulls.
    pub fn from_records(
        rows: Vec<Record>,
        orientation: Orientation,
        columns: Option<Vec<String>>,
    ) -> Self {
        match orientation {
            Orientation::Records => RecordBatch::Records(rows),
            Orientation::Split => {
                let columns = columns.unwrap_or_else(|| RecordBatch::Records(rows.clone()).column_names());
                let data = rows
                    .into_iter()
                    .map(|mut row| {
                        columns
                            .iter()
                            .map(|c| row.swap_remove(c).unwrap_or(Value::Null))
                            .collect()
                    })
                    .collect();
                RecordBatch::Split { columns, data }
            }
        }
    }

    /// Same table in the other layout
    pub fn into_orientation(self, orientation: Orientation) -> Self {
        if self.orientation() == orientation {
            return self;
        }
        let columns = self.column_names();
        RecordBatch::from_records(self.to_records(), orientation, Some(columns))
    }

    /// Logical equality with numeric tolerance, independent of layout
    pub fn approx_eq(&self, other: &RecordBatch, tolerance: f64) -> bool {
        if self.num_rows() != other.num_rows() {
            return false;
        }
        self.to_records()
            .iter()
            .zip(other.to_records().iter())
            .all(|(a, b)| records_approx_eq(a, b, tolerance))
    }
}

fn records_approx_eq(a: &Record, b: &Record, tolerance: f64) -> bool {
    let keys: IndexSet<&String> = a.keys().chain(b.keys()).collect();
    keys.into_iter().all(|k| {
        let left = a.get(k).unwrap_or(&Value::Null);
        let right = b.get(k).unwrap_or(&Value::Null);
        left.approx_eq(right, tolerance)
    })
}
