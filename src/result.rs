use std::path::PathBuf;

use crate::fit::ShapeFit;
use crate::shape::Variant;


/// Fit of one outline file, keyed by `"{parent_dir}/{file_stem}"`.
#[derive(Debug, Clone, PartialEq)]
pub struct FitRow {
    pub name: String,
    pub source: PathBuf,
    pub fit: ShapeFit,
}

/// All fits of one batch under one variant, in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct FitTable {
    pub batch: String,
    pub variant: Variant,
    pub rows: Vec<FitRow>,
}

impl FitTable {
    pub fn new(batch: impl Into<String>, variant: Variant) -> Self {
        Self {
            batch: batch.into(),
            variant,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names of the written table, starting with the row key.
    pub fn header(&self, extended: bool) -> Vec<&'static str> {
        let mut header = vec!["name"];
        header.extend_from_slice(self.variant.columns());
        if extended {
            header.extend_from_slice(&["rotation", "cost"]);
        }
        header
    }

    /// Formatted fields of one row, matching [`FitTable::header`].
    pub fn record(&self, row: &FitRow, extended: bool) -> Vec<String> {
        let params = &row.fit.params;
        let mut record = vec![row.name.clone()];
        for column in self.variant.columns() {
            record.push(match *column {
                "n" => params.n.to_string(),
                other => value(params, other).to_string(),
            });
        }
        if extended {
            record.push(params.rotation.to_string());
            record.push(row.fit.cost.to_string());
        }
        record
    }

    /// Values of a parameter column, `None` for unknown columns.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        if !["r0", "o", "h", "p", "n", "rotation", "cost"].contains(&name) {
            return None;
        }
        Some(
            self.rows
                .iter()
                .map(|row| match name {
                    "cost" => row.fit.cost,
                    other => value(&row.fit.params, other),
                })
                .collect(),
        )
    }

    /// Number of rows whose selected solve did not converge.
    pub fn unconverged(&self) -> usize {
        self.rows.iter().filter(|row| !row.fit.converged).count()
    }

    pub fn worst_cost(&self) -> Option<f64> {
        self.rows.iter().map(|row| row.fit.cost).reduce(f64::max)
    }
}

fn value(params: &crate::shape::ShapeParams, column: &str) -> f64 {
    match column {
        "r0" => params.r0,
        "o" => params.o,
        "h" => params.h,
        "p" => params.p,
        "n" => params.n as f64,
        "rotation" => params.rotation,
        _ => f64::NAN,
    }
}
