//! Parameter covariance from the residual Jacobian.
//!
//! The covariance of the active parameters is the pseudo-inverse of the
//! Gauss-Newton Hessian `J^T J`, computed through an SVD so that
//! near-linearly-dependent directions are dropped instead of blowing up the
//! whole matrix. Dropped directions leave NaN variances and a warning, never
//! a hard error: the fit result is still useful.

use nalgebra::SVD;
use ndarray::{Array1, Array2, ArrayView2};

use crate::cost::LeastSquaresCost;
use crate::diagnostics::{Diagnostics, WarningKind};
use crate::error::{FitError, Result};
use crate::utils::linalg::to_dmatrix;

/// Default relative singular value cutoff below which a direction counts as
/// degenerate.
pub const DEFAULT_EPSREL: f64 = 1e-12;

/// Covariance of the active parameters, shape `[n_active, n_active]`.
///
/// Singular values below `epsrel` times the largest are dropped; any
/// parameter with weight in a dropped direction gets a NaN variance and a
/// `DegenerateCovariance` warning.
pub fn covariance(
    jac: ArrayView2<'_, f64>,
    epsrel: f64,
    diagnostics: &mut Diagnostics,
) -> Result<Array2<f64>> {
    let n = jac.ncols();
    if n == 0 {
        return Ok(Array2::zeros((0, 0)));
    }

    let j = to_dmatrix(jac);
    let hessian = j.transpose() * &j;
    let svd = SVD::new(hessian, true, true);
    let u = svd
        .u
        .as_ref()
        .ok_or_else(|| FitError::LinearAlgebraError("SVD did not produce U".to_string()))?;
    let v_t = svd
        .v_t
        .as_ref()
        .ok_or_else(|| FitError::LinearAlgebraError("SVD did not produce V^T".to_string()))?;

    let max_sv = svd.singular_values.iter().cloned().fold(0.0f64, f64::max);
    let cutoff = max_sv * epsrel.max(f64::EPSILON);

    let mut degenerate = vec![false; n];
    let mut cov = Array2::zeros((n, n));
    for k in 0..svd.singular_values.len() {
        let s = svd.singular_values[k];
        if s > cutoff {
            // pinv = V * S^-1 * U^T, accumulated one rank-1 term at a time.
            for i in 0..n {
                for jj in 0..n {
                    cov[[i, jj]] += v_t[(k, i)] * u[(jj, k)] / s;
                }
            }
        } else {
            for (i, flag) in degenerate.iter_mut().enumerate() {
                if v_t[(k, i)].abs() > 1e-8 {
                    *flag = true;
                }
            }
        }
    }

    for (i, flag) in degenerate.iter().enumerate() {
        if *flag {
            cov[[i, i]] = f64::NAN;
            diagnostics.warn(
                WarningKind::DegenerateCovariance,
                format!(
                    "active parameter {} lies in a degenerate direction; its uncertainty is undefined",
                    i
                ),
            );
        }
    }
    Ok(cov)
}

/// Jacobian of the FULL parameter vector with respect to the active one.
///
/// Without ties this is a 0/1 scatter matrix. With ties the tied rows are
/// filled by finite differences through the tie expressions, so nonlinear
/// ties get their local linearization.
pub fn tie_transform(cost: &mut LeastSquaresCost) -> Result<Array2<f64>> {
    let p0 = cost.active_params()?;
    let n_active = p0.len();
    let n_full = cost.tree()?.n_params();
    let has_ties = !cost.tree()?.ties().is_empty();

    let mut t = Array2::zeros((n_full, n_active));
    if !has_ties {
        for (ordinal, col) in cost.tree()?.active_indices().into_iter().enumerate() {
            if let Some(col) = col {
                t[[ordinal, col]] = 1.0;
            }
        }
        return Ok(t);
    }

    let f0 = cost.full_params()?;
    let mut p = p0.clone();
    for j in 0..n_active {
        let h = (p0[j].abs() * 1e-6).max(1e-9);
        p[j] = p0[j] + h;
        cost.set_active_params(&p)?;
        let f = cost.full_params()?;
        for i in 0..n_full {
            t[[i, j]] = (f[i] - f0[i]) / h;
        }
        p[j] = p0[j];
    }
    cost.set_active_params(&p0)?;
    Ok(t)
}

/// Spread the active covariance over every parameter: `C_full = T C T^T`
/// where `T` is the tie transform. Fixed parameters get zero rows and
/// columns; tied parameters inherit variance through their expressions.
pub fn to_full_covariance(
    cost: &mut LeastSquaresCost,
    active_cov: &Array2<f64>,
) -> Result<Array2<f64>> {
    let t = tie_transform(cost)?;
    Ok(t.dot(active_cov).dot(&t.t()))
}

/// Standard errors from a covariance diagonal: `sqrt(var)`, NaN where the
/// variance is NaN or negative.
pub fn standard_errors(cov: &Array2<f64>) -> Array1<f64> {
    Array1::from_iter(cov.diag().iter().map(|&v| {
        if v < 0.0 {
            f64::NAN
        } else {
            v.sqrt()
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FitData;
    use crate::model::ModelTree;
    use crate::models::Gaussian;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_well_conditioned_inverse() {
        // J^T J = diag(4, 25) for this Jacobian.
        let jac = array![[2.0, 0.0], [0.0, 5.0]];
        let mut diag = Diagnostics::new();
        let cov = covariance(jac.view(), DEFAULT_EPSREL, &mut diag).unwrap();
        assert!(diag.is_empty());
        assert_relative_eq!(cov[[0, 0]], 0.25);
        assert_relative_eq!(cov[[1, 1]], 0.04);
        assert_relative_eq!(cov[[0, 1]], 0.0);
    }

    #[test]
    fn test_degenerate_direction_gets_nan() {
        // Two identical columns: the difference direction is unconstrained.
        let jac = array![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]];
        let mut diag = Diagnostics::new();
        let cov = covariance(jac.view(), DEFAULT_EPSREL, &mut diag).unwrap();

        assert!(cov[[0, 0]].is_nan());
        assert!(cov[[1, 1]].is_nan());
        assert!(!diag.is_empty());
        assert_eq!(diag.warnings()[0].kind, WarningKind::DegenerateCovariance);
    }

    #[test]
    fn test_scatter_transform_without_ties() {
        let data = FitData::unweighted(array![0.0, 1.0], array![1.0, 1.0]).unwrap();
        let mut tree = ModelTree::leaf(Box::new(Gaussian::new(1.0, 0.0, 1.0)));
        tree.fix("centre").unwrap();
        let mut cost = LeastSquaresCost::with_tree(data, tree);

        let t = tie_transform(&mut cost).unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t[[0, 0]], 1.0);
        assert_eq!(t[[1, 0]], 0.0);
        assert_eq!(t[[1, 1]], 0.0);
        assert_eq!(t[[2, 1]], 1.0);
    }

    #[test]
    fn test_tied_variance_scales_with_tie() {
        let data = FitData::unweighted(array![0.0, 1.0], array![1.0, 1.0]).unwrap();
        let mut tree = ModelTree::composite();
        tree.add_child(tree.root(), Box::new(Gaussian::new(1.0, 0.0, 1.0)))
            .unwrap();
        tree.add_child(tree.root(), Box::new(Gaussian::new(1.0, 5.0, 1.0)))
            .unwrap();
        tree.tie("f1.height", "2 * f0.height").unwrap();
        tree.apply_ties().unwrap();

        let mut cost = LeastSquaresCost::with_tree(data, tree);
        let n_active = cost.n_params().unwrap();
        let active_cov = Array2::eye(n_active);
        let full = to_full_covariance(&mut cost, &active_cov).unwrap();

        let tree = cost.tree().unwrap();
        let src = tree.parameter_index("f0.height").unwrap();
        let dst = tree.parameter_index("f1.height").unwrap();
        // var(2a) = 4 var(a); cov(a, 2a) = 2 var(a).
        assert_relative_eq!(full[[src, src]], 1.0, epsilon = 1e-4);
        assert_relative_eq!(full[[dst, dst]], 4.0, epsilon = 1e-3);
        assert_relative_eq!(full[[src, dst]], 2.0, epsilon = 1e-3);
    }

    #[test]
    fn test_standard_errors() {
        let cov = array![[4.0, 0.0], [0.0, f64::NAN]];
        let se = standard_errors(&cov);
        assert_relative_eq!(se[0], 2.0);
        assert!(se[1].is_nan());
    }
}
