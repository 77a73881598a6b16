//! Bridges between `ndarray` storage and `nalgebra` decompositions.

use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::error::{FitError, Result};

pub fn to_dmatrix(a: ArrayView2<'_, f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

pub fn to_dvector(v: ArrayView1<'_, f64>) -> DVector<f64> {
    DVector::from_iterator(v.len(), v.iter().copied())
}

pub fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

pub fn from_dvector(v: &DVector<f64>) -> Array1<f64> {
    Array1::from_iter(v.iter().copied())
}

/// Solve the damped normal equations `(H + lambda * diag(H)) delta = -g`.
///
/// Tries a Cholesky factorization first (the damped matrix is symmetric and
/// usually positive definite), falling back to an LU solve. Returns `None`
/// when the system is singular even after damping, which the minimizer
/// treats as a rejected step.
pub fn solve_damped(
    hessian: ArrayView2<'_, f64>,
    gradient: ArrayView1<'_, f64>,
    lambda: f64,
) -> Result<Option<Array1<f64>>> {
    let n = gradient.len();
    if hessian.nrows() != n || hessian.ncols() != n {
        return Err(FitError::DimensionMismatch(format!(
            "Hessian is {}x{}, gradient has {} entries",
            hessian.nrows(),
            hessian.ncols(),
            n
        )));
    }

    let mut a = to_dmatrix(hessian);
    for i in 0..n {
        a[(i, i)] += lambda * hessian[[i, i]];
    }
    let b = -to_dvector(gradient);

    if let Some(chol) = Cholesky::new(a.clone()) {
        return Ok(Some(from_dvector(&chol.solve(&b))));
    }
    Ok(a.lu().solve(&b).map(|x| from_dvector(&x)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_round_trip_conversions() {
        let a = array![[1.0, 2.0], [3.0, 4.0]];
        let back = from_dmatrix(&to_dmatrix(a.view()));
        assert_eq!(a, back);

        let v = array![1.0, -2.0, 3.0];
        assert_eq!(v, from_dvector(&to_dvector(v.view())));
    }

    #[test]
    fn test_solve_damped_identity() {
        let h = array![[2.0, 0.0], [0.0, 4.0]];
        let g = array![2.0, 4.0];
        // lambda = 0: delta = -H^-1 g = [-1, -1].
        let delta = solve_damped(h.view(), g.view(), 0.0).unwrap().unwrap();
        assert_relative_eq!(delta[0], -1.0);
        assert_relative_eq!(delta[1], -1.0);

        // Heavy damping shrinks the step.
        let damped = solve_damped(h.view(), g.view(), 9.0).unwrap().unwrap();
        assert_relative_eq!(damped[0], -0.1);
    }

    #[test]
    fn test_solve_damped_singular() {
        let h = array![[0.0, 0.0], [0.0, 0.0]];
        let g = array![1.0, 1.0];
        assert!(solve_damped(h.view(), g.view(), 0.0).unwrap().is_none());
    }
}
