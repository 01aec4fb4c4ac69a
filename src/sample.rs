/*!
# Event tables

Flat, row-major event storage. A table has a fixed row stride (`n_fields`)
and every row is one event. Signal samples use the field order produced by
[`crate::model::FieldTable`]; evaluation points (data) use one column per
observable, in observable order.

Loading events from disk is not handled here. Callers hand tables in through
the [`SampleSource`] trait; [`InMemorySource`] is the in-process implementation.
*/

use std::collections::HashMap;

use crate::error::{FitError, Result};

/// A row-major table of events.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventTable {
    data: Vec<f64>,
    n_fields: usize,
}

impl EventTable {
    /// Wraps `data` as a table of rows with `n_fields` values each.
    ///
    /// # Errors
    /// Fails when `n_fields` is zero with non-empty data, or when the data length is
    /// not a multiple of `n_fields`.
    pub fn new(data: Vec<f64>, n_fields: usize) -> Result<Self> {
        if n_fields == 0 && !data.is_empty() {
            return Err(FitError::DimensionMismatch(
                "event table with zero fields cannot hold data".into(),
            ));
        }
        if n_fields > 0 && data.len() % n_fields != 0 {
            return Err(FitError::DimensionMismatch(format!(
                "event table length {} is not a multiple of the row stride {}",
                data.len(),
                n_fields
            )));
        }
        Ok(Self { data, n_fields })
    }

    /// Builds a table from individual rows. All rows must have the same length.
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> Result<Self> {
        let n_fields = rows.first().map_or(0, |r| r.as_ref().len());
        let mut data = Vec::with_capacity(rows.len() * n_fields);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != n_fields {
                return Err(FitError::DimensionMismatch(format!(
                    "row {i} has {} fields, expected {n_fields}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }
        Self::new(data, n_fields)
    }

    /// An empty table with the given stride.
    pub fn empty(n_fields: usize) -> Self {
        Self {
            data: Vec::new(),
            n_fields,
        }
    }

    pub fn n_events(&self) -> usize {
        if self.n_fields == 0 {
            0
        } else {
            self.data.len() / self.n_fields
        }
    }

    pub fn n_fields(&self) -> usize {
        self.n_fields
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The values of event `i`.
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n_fields..(i + 1) * self.n_fields]
    }

    /// Appends one event. The row length must match the stride.
    pub fn push_row(&mut self, row: &[f64]) -> Result<()> {
        if row.len() != self.n_fields {
            return Err(FitError::DimensionMismatch(format!(
                "cannot append a row of {} fields to a table with stride {}",
                row.len(),
                self.n_fields
            )));
        }
        self.data.extend_from_slice(row);
        Ok(())
    }

    /// Iterates over the values of column `field`.
    pub fn column(&self, field: usize) -> impl Iterator<Item = f64> + '_ {
        self.data
            .chunks_exact(self.n_fields.max(1))
            .map(move |row| row[field])
    }

    /// Copies the listed columns, in the listed order, into a new table.
    pub fn select(&self, fields: &[usize]) -> Result<Self> {
        if let Some(&bad) = fields.iter().find(|&&f| f >= self.n_fields) {
            return Err(FitError::FieldOutOfRange {
                owner: "column selection".into(),
                index: bad,
                n_fields: self.n_fields,
            });
        }
        let mut data = Vec::with_capacity(self.n_events() * fields.len());
        for i in 0..self.n_events() {
            let row = self.row(i);
            data.extend(fields.iter().map(|&f| row[f]));
        }
        Self::new(data, fields.len())
    }

    /// Appends all rows of `other`.
    pub fn extend(&mut self, other: &EventTable) -> Result<()> {
        if other.is_empty() {
            return Ok(());
        }
        if other.n_fields != self.n_fields {
            return Err(FitError::DimensionMismatch(format!(
                "cannot concatenate tables with strides {} and {}",
                self.n_fields, other.n_fields
            )));
        }
        self.data.extend_from_slice(&other.data);
        Ok(())
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}

/// Provides the raw event table of a signal, with columns in the dataset
/// field order of the configuration.
pub trait SampleSource {
    fn load(&self, signal: &str) -> Result<EventTable>;
}

/// A [`SampleSource`] backed by tables kept in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    tables: HashMap<String, EventTable>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the table for `signal`.
    pub fn insert(mut self, signal: impl Into<String>, table: EventTable) -> Self {
        self.tables.insert(signal.into(), table);
        self
    }
}

impl SampleSource for InMemorySource {
    fn load(&self, signal: &str) -> Result<EventTable> {
        self.tables
            .get(signal)
            .cloned()
            .ok_or_else(|| FitError::UnknownName {
                what: "sample for signal",
                name: signal.to_string(),
            })
    }
}
