//! Numeric Jacobians by finite differences.
//!
//! Steps are relative to the parameter magnitude with an absolute floor, so
//! a parameter sitting at zero still gets a usable step.

use ndarray::{Array1, Array2};

use crate::error::Result;

/// Relative step size as a fraction of each parameter's magnitude.
pub const DEFAULT_REL_STEP: f64 = 0.01;

/// Floor for the absolute step when a parameter is at or near zero.
const MIN_ABS_STEP: f64 = 1e-10;

/// Finite difference scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffMethod {
    /// One extra evaluation per parameter, O(h) error.
    #[default]
    Forward,
    /// Two extra evaluations per parameter, O(h^2) error.
    Central,
}

fn step_for(value: f64, rel_step: f64) -> f64 {
    let h = value.abs() * rel_step;
    if h < MIN_ABS_STEP {
        MIN_ABS_STEP.max(rel_step)
    } else {
        h
    }
}

/// Numeric Jacobian of `f` at `params`, shape `[f(params).len(), params.len()]`.
///
/// `f` is re-invoked with perturbed copies of `params`; the caller's closure
/// is responsible for pushing the values wherever the evaluation needs them.
pub fn jacobian<F>(
    f: &mut F,
    params: &Array1<f64>,
    base: &Array1<f64>,
    method: DiffMethod,
    rel_step: f64,
) -> Result<Array2<f64>>
where
    F: FnMut(&Array1<f64>) -> Result<Array1<f64>>,
{
    let n_out = base.len();
    let n_in = params.len();
    let mut jac = Array2::zeros((n_out, n_in));
    let mut work = params.clone();

    for j in 0..n_in {
        let h = step_for(params[j], rel_step);
        match method {
            DiffMethod::Forward => {
                work[j] = params[j] + h;
                let plus = f(&work)?;
                work[j] = params[j];
                for i in 0..n_out {
                    jac[[i, j]] = (plus[i] - base[i]) / h;
                }
            }
            DiffMethod::Central => {
                work[j] = params[j] + h;
                let plus = f(&work)?;
                work[j] = params[j] - h;
                let minus = f(&work)?;
                work[j] = params[j];
                for i in 0..n_out {
                    jac[[i, j]] = (plus[i] - minus[i]) / (2.0 * h);
                }
            }
        }
    }
    // Leave the evaluation state where the caller had it.
    f(&work)?;
    Ok(jac)
}
