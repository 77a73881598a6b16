//! Observed-data container consumed by the cost function.
//!
//! Supplies x/y/error arrays and a contiguous sub-range to fit. Histogram
//! data (`x.len() == y.len() + 1`, bin edges) is collapsed to bin centres at
//! construction so downstream code only ever sees point data.

use crate::diagnostics::{Diagnostics, WarningKind};
use crate::error::{FitError, Result};
use ndarray::{s, Array1, ArrayView1};

/// Observed data for one fit: x values, y values and per-point weights over
/// a `[start, end)` sub-range.
#[derive(Debug, Clone)]
pub struct FitData {
    x: Array1<f64>,
    y: Array1<f64>,
    /// `1 / e_i`; zero where the supplied error was non-positive.
    weights: Array1<f64>,
    start: usize,
    end: usize,
}

impl FitData {
    /// Build from x/y/error arrays. Accepts `x.len() == y.len()` (point
    /// data) or `x.len() == y.len() + 1` (histogram bin edges).
    pub fn new(
        x: Array1<f64>,
        y: Array1<f64>,
        e: Array1<f64>,
        diagnostics: &mut Diagnostics,
    ) -> Result<Self> {
        let x = if x.len() == y.len() + 1 {
            bin_centres(&x)
        } else if x.len() == y.len() {
            x
        } else {
            return Err(FitError::DimensionMismatch(format!(
                "x has {} points, y has {}; expected equal or x = y + 1",
                x.len(),
                y.len()
            )));
        };

        if e.len() != y.len() {
            return Err(FitError::DimensionMismatch(format!(
                "e has {} points, y has {}",
                e.len(),
                y.len()
            )));
        }

        let mut weights = Array1::zeros(e.len());
        for (i, &err) in e.iter().enumerate() {
            if err > 0.0 {
                weights[i] = 1.0 / err;
            } else {
                diagnostics.warn(
                    WarningKind::ZeroWeight,
                    format!("data point {} has error {} <= 0; weight set to 0", i, err),
                );
            }
        }

        let end = y.len();
        Ok(Self {
            x,
            y,
            weights,
            start: 0,
            end,
        })
    }

    /// Build with unit weights for every point.
    pub fn unweighted(x: Array1<f64>, y: Array1<f64>) -> Result<Self> {
        let n = y.len();
        let mut diag = Diagnostics::new();
        Self::new(x, y, Array1::ones(n), &mut diag)
    }

    /// Restrict the fit to `[start, end)`.
    pub fn with_range(mut self, start: usize, end: usize) -> Result<Self> {
        if start >= end || end > self.y.len() {
            return Err(FitError::InvalidInput(format!(
                "range [{}, {}) invalid for {} data points",
                start,
                end,
                self.y.len()
            )));
        }
        self.start = start;
        self.end = end;
        Ok(self)
    }

    /// Number of points inside the fit range.
    pub fn n_points(&self) -> usize {
        self.end - self.start
    }

    pub fn x(&self) -> ArrayView1<'_, f64> {
        self.x.slice(s![self.start..self.end])
    }

    pub fn y(&self) -> ArrayView1<'_, f64> {
        self.y.slice(s![self.start..self.end])
    }

    pub fn weights(&self) -> ArrayView1<'_, f64> {
        self.weights.slice(s![self.start..self.end])
    }
}

fn bin_centres(edges: &Array1<f64>) -> Array1<f64> {
    Array1::from_iter(
        edges
            .windows(2)
            .into_iter()
            .map(|w| 0.5 * (w[0] + w[1])),
    )
}
