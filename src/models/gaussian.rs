//! Gaussian peak: `f(x) = height * exp(-(x - centre)^2 / (2 * sigma^2))`.

use ndarray::{Array1, Array2, ArrayView1};

use crate::error::Result;
use crate::model::Model;

const PARAM_NAMES: [&str; 3] = ["height", "centre", "sigma"];

#[derive(Debug, Clone)]
pub struct Gaussian {
    params: [f64; 3],
}

impl Gaussian {
    pub fn new(height: f64, centre: f64, sigma: f64) -> Self {
        Self {
            params: [height, centre, sigma],
        }
    }
}

impl Default for Gaussian {
    fn default() -> Self {
        Self::new(1.0, 0.0, 1.0)
    }
}

impl Model for Gaussian {
    fn kind(&self) -> &str {
        "Gaussian"
    }

    fn n_params(&self) -> usize {
        3
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
        let [height, centre, sigma] = self.params;
        let two_sigma_sq = 2.0 * sigma * sigma;
        Ok(x.mapv(|xi| {
            let d = xi - centre;
            height * (-d * d / two_sigma_sq).exp()
        }))
    }

    fn eval_jacobian(&self, x: ArrayView1<'_, f64>) -> Result<Array2<f64>> {
        let [height, centre, sigma] = self.params;
        let two_sigma_sq = 2.0 * sigma * sigma;
        let mut jac = Array2::zeros((x.len(), 3));
        for (i, &xi) in x.iter().enumerate() {
            let d = xi - centre;
            let g = (-d * d / two_sigma_sq).exp();
            jac[[i, 0]] = g;
            jac[[i, 1]] = height * g * d / (sigma * sigma);
            jac[[i, 2]] = height * g * d * d / (sigma * sigma * sigma);
        }
        Ok(jac)
    }

    fn has_analytic_jacobian(&self) -> bool {
        true
    }
}
