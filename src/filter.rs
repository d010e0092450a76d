//! Output column selection

use crate::error::{Result, ServingError};
use crate::types::{FieldSpec, Record};

/// Validated list of output columns to keep
#[derive(Debug, Clone, PartialEq)]
pub struct OutputFilter {
    columns: Vec<String>,
}

impl OutputFilter {
    /// Check every requested column against the output schema.
    /// Duplicates are dropped, keeping the first occurrence.
    pub fn new(columns: &[String], output_schema: &[FieldSpec]) -> Result<Self> {
        let mut kept: Vec<String> = Vec::with_capacity(columns.len());
        for column in columns {
            if !output_schema.iter().any(|f| &f.name == column) {
                return Err(ServingError::UnknownOutputColumn(column.clone()));
            }
            if !kept.contains(column) {
                kept.push(column.clone());
            }
        }
        Ok(Self { columns: kept })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Keep only the filtered columns, in filter order
    pub fn apply(&self, rows: Vec<Record>) -> Vec<Record> {
        rows.into_iter()
            .map(|mut row| {
                self.columns
                    .iter()
                    .filter_map(|c| row.swap_remove(c).map(|v| (c.clone(), v)))
                    .collect()
            })
            .collect()
    }
}
