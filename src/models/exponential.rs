//! Exponential decay: `f(x) = amplitude * exp(-x / lifetime)`.

use ndarray::{Array1, Array2, ArrayView1};

use crate::error::Result;
use crate::model::Model;

const PARAM_NAMES: [&str; 2] = ["amplitude", "lifetime"];

#[derive(Debug, Clone)]
pub struct ExpDecay {
    params: [f64; 2],
}

impl ExpDecay {
    pub fn new(amplitude: f64, lifetime: f64) -> Self {
        Self {
            params: [amplitude, lifetime],
        }
    }
}

impl Default for ExpDecay {
    fn default() -> Self {
        Self::new(1.0, 1.0)
    }
}

impl Model for ExpDecay {
    fn kind(&self) -> &str {
        "ExpDecay"
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
        let [amplitude, lifetime] = self.params;
        Ok(x.mapv(|xi| amplitude * (-xi / lifetime).exp()))
    }

    fn eval_jacobian(&self, x: ArrayView1<'_, f64>) -> Result<Array2<f64>> {
        let [amplitude, lifetime] = self.params;
        let mut jac = Array2::zeros((x.len(), 2));
        for (i, &xi) in x.iter().enumerate() {
            let e = (-xi / lifetime).exp();
            jac[[i, 0]] = e;
            jac[[i, 1]] = amplitude * e * xi / (lifetime * lifetime);
        }
        Ok(jac)
    }

    fn has_analytic_jacobian(&self) -> bool {
        true
    }
}
