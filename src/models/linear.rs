//! Straight line: `f(x) = intercept + slope * x`.

use ndarray::{Array1, Array2, ArrayView1};

use crate::error::Result;
use crate::model::Model;

const PARAM_NAMES: [&str; 2] = ["intercept", "slope"];

#[derive(Debug, Clone, Default)]
pub struct Linear {
    params: [f64; 2],
}

impl Linear {
    pub fn new(intercept: f64, slope: f64) -> Self {
        Self {
            params: [intercept, slope],
        }
    }
}

impl Model for Linear {
    fn kind(&self) -> &str {
        "Linear"
    }

    fn n_params(&self) -> usize {
        2
    }

    fn param_name(&self, i: usize) -> &str {
        PARAM_NAMES[i]
    }

    fn param_value(&self, i: usize) -> f64 {
        self.params[i]
    }

    fn set_param_value(&mut self, i: usize, value: f64) {
        self.params[i] = value;
    }

    fn eval(&self, x: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
        let [intercept, slope] = self.params;
        Ok(x.mapv(|xi| intercept + slope * xi))
    }

    fn eval_jacobian(&self, x: ArrayView1<'_, f64>) -> Result<Array2<f64>> {
        let mut jac = Array2::zeros((x.len(), 2));
        for (i, &xi) in x.iter().enumerate() {
            jac[[i, 0]] = 1.0;
            jac[[i, 1]] = xi;
        }
        Ok(jac)
    }

    fn has_analytic_jacobian(&self) -> bool {
        true
    }
}
