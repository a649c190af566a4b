use crate::FunctionModel;
use interp::{InterpMode, interp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TableErrors {
    #[error("table needs at least 2 points, got {0}")]
    TooShort(usize),
    #[error("table times ({0}) and values ({1}) must have the same length")]
    LengthMismatch(usize, usize),
    #[error("table times must be strictly increasing")]
    NotIncreasing,
}

/// Piecewise-linear function through `(times[i], values[i])`.
/// Outside the table the first/last values are held.
/// Discontinuous in its derivative at the breakpoints, so a speed table
/// produces acceleration spikes there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TableData")]
pub struct Table {
    times: Vec<f64>,
    values: Vec<f64>,
}

/// Unchecked wire form of a `Table`, validated by `Table::new` on the way in.
#[derive(Deserialize)]
struct TableData {
    times: Vec<f64>,
    values: Vec<f64>,
}

impl TryFrom<TableData> for Table {
    type Error = TableErrors;

    fn try_from(data: TableData) -> Result<Self, Self::Error> {
        Table::new(data.times, data.values)
    }
}

impl Table {
    pub fn new(times: Vec<f64>, values: Vec<f64>) -> Result<Self, TableErrors> {
        if times.len() != values.len() {
            return Err(TableErrors::LengthMismatch(times.len(), values.len()));
        }
        if times.len() < 2 {
            return Err(TableErrors::TooShort(times.len()));
        }
        if times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(TableErrors::NotIncreasing);
        }
        Ok(Self { times, values })
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// index of the segment containing t, None outside the table
    fn segment(&self, t: f64) -> Option<usize> {
        let n = self.times.len();
        if t < self.times[0] || t >= self.times[n - 1] {
            return None;
        }
        // first breakpoint strictly greater than t, minus one
        let upper = self.times.partition_point(|&x| x <= t);
        Some(upper - 1)
    }
}

impl FunctionModel for Table {
    fn value(&self, t: f64) -> f64 {
        interp(&self.times, &self.values, t, &InterpMode::FirstLast)
    }

    fn derivative(&self, t: f64) -> f64 {
        match self.segment(t) {
            Some(i) => (self.values[i + 1] - self.values[i]) / (self.times[i + 1] - self.times[i]),
            None => 0.0,
        }
    }

    fn second_derivative(&self, _t: f64) -> f64 {
        0.0
    }
}
