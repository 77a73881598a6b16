//! Weighted least-squares cost over a model tree and observed data.
//!
//! Presents the optimizer with a dense vector of ACTIVE parameters only;
//! fixed and tied parameters are hidden behind the active<->full mapping,
//! which is rebuilt lazily whenever the tree's structure or flag pattern
//! changes underneath us.

use ndarray::{Array1, Array2};

use crate::data::FitData;
use crate::error::{FitError, Result};
use crate::model::ModelTree;
use crate::utils::finite_difference::{self, DiffMethod, DEFAULT_REL_STEP};

/// What the active mapping was built against. Any mismatch means a
/// structural edit or a fix/tie change happened since, and the mapping must
/// be rebuilt before use.
#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    generation: u64,
    n_params: usize,
    active: Vec<bool>,
}

/// The 1/2-free sum of squared weighted residuals, plus linear boundary
/// penalties, as a function of the active parameters.
pub struct LeastSquaresCost {
    tree: Option<ModelTree>,
    data: FitData,
    diff_method: DiffMethod,
    rel_step: f64,
    snapshot: Option<Snapshot>,
    /// Active position -> full ordinal.
    active_map: Vec<usize>,
}

impl LeastSquaresCost {
    pub fn new(data: FitData) -> Self {
        Self {
            tree: None,
            data,
            diff_method: DiffMethod::default(),
            rel_step: DEFAULT_REL_STEP,
            snapshot: None,
            active_map: Vec::new(),
        }
    }

    pub fn with_tree(data: FitData, tree: ModelTree) -> Self {
        let mut cost = Self::new(data);
        cost.set_tree(tree);
        cost
    }

    pub fn set_tree(&mut self, tree: ModelTree) {
        self.tree = Some(tree);
        self.snapshot = None;
    }

    pub fn set_diff_method(&mut self, method: DiffMethod) {
        self.diff_method = method;
    }

    pub fn set_rel_step(&mut self, rel_step: f64) {
        self.rel_step = rel_step;
    }

    pub fn data(&self) -> &FitData {
        &self.data
    }

    pub fn tree(&self) -> Result<&ModelTree> {
        self.tree.as_ref().ok_or(FitError::NoFittingFunction)
    }

    pub fn tree_mut(&mut self) -> Result<&mut ModelTree> {
        // Flags or structure may change through this borrow.
        self.snapshot = None;
        self.tree.as_mut().ok_or(FitError::NoFittingFunction)
    }

    pub fn into_tree(self) -> Result<ModelTree> {
        self.tree.ok_or(FitError::NoFittingFunction)
    }

    /// Rebuild the active<->full mapping if the tree changed since it was
    /// last built.
    fn refresh(&mut self) -> Result<()> {
        let tree = self.tree.as_ref().ok_or(FitError::NoFittingFunction)?;
        let current = Snapshot {
            generation: tree.generation(),
            n_params: tree.n_params(),
            active: tree.active_pattern(),
        };
        if self.snapshot.as_ref() != Some(&current) {
            self.active_map = current
                .active
                .iter()
                .enumerate()
                .filter_map(|(ordinal, &active)| active.then_some(ordinal))
                .collect();
            self.snapshot = Some(current);
        }
        Ok(())
    }

    /// Number of parameters the optimizer sees.
    pub fn n_params(&mut self) -> Result<usize> {
        self.refresh()?;
        Ok(self.active_map.len())
    }

    /// Number of residuals (points in the fit range).
    pub fn n_residuals(&self) -> usize {
        self.data.n_points()
    }

    /// Full ordinals of the active parameters, in optimizer order.
    pub fn active_ordinals(&mut self) -> Result<&[usize]> {
        self.refresh()?;
        Ok(&self.active_map)
    }

    /// Current active parameter values in ordinal order.
    pub fn active_params(&mut self) -> Result<Array1<f64>> {
        self.refresh()?;
        let tree = self.tree.as_ref().ok_or(FitError::NoFittingFunction)?;
        self.active_map
            .iter()
            .map(|&ordinal| tree.get_parameter(ordinal))
            .collect()
    }

    /// Write active parameter values into the tree, then apply ties once so
    /// tied parameters observe the batch.
    pub fn set_active_params(&mut self, params: &Array1<f64>) -> Result<()> {
        self.refresh()?;
        if params.len() != self.active_map.len() {
            return Err(FitError::DimensionMismatch(format!(
                "got {} parameter values, expected {}",
                params.len(),
                self.active_map.len()
            )));
        }
        let tree = self.tree.as_mut().ok_or(FitError::NoFittingFunction)?;
        for (&ordinal, &value) in self.active_map.iter().zip(params.iter()) {
            tree.set_parameter(ordinal, value, false)?;
        }
        tree.apply_ties()
    }

    /// All parameter values (active, fixed and tied) in flat ordinal order,
    /// with ties up to date. Used for the covariance tie transform.
    pub fn full_params(&mut self) -> Result<Array1<f64>> {
        self.refresh()?;
        let tree = self.tree.as_ref().ok_or(FitError::NoFittingFunction)?;
        (0..tree.n_params()).map(|i| tree.get_parameter(i)).collect()
    }

    /// Weighted residuals `w_i * (model(x_i) - y_i)` at the current
    /// parameters. A non-finite entry is a numeric failure.
    pub fn residuals(&mut self) -> Result<Array1<f64>> {
        self.refresh()?;
        let tree = self.tree.as_ref().ok_or(FitError::NoFittingFunction)?;
        let model = tree.eval(self.data.x())?;
        let mut r = Array1::zeros(self.data.n_points());
        for (i, ((m, y), w)) in model
            .iter()
            .zip(self.data.y().iter())
            .zip(self.data.weights().iter())
            .enumerate()
        {
            r[i] = w * (m - y);
            if !r[i].is_finite() {
                return Err(FitError::NumericFailure(format!(
                    "residual {} is not finite",
                    i
                )));
            }
        }
        Ok(r)
    }

    /// Sum of squared weighted residuals plus boundary penalties.
    pub fn cost(&mut self) -> Result<f64> {
        let r = self.residuals()?;
        let mut value = r.dot(&r);
        value += self.penalty()?;
        Ok(value)
    }

    /// Chi-squared without the constraint penalties, for reporting.
    pub fn chi_squared(&mut self) -> Result<f64> {
        let r = self.residuals()?;
        Ok(r.dot(&r))
    }

    fn penalty(&mut self) -> Result<f64> {
        self.refresh()?;
        let tree = self.tree.as_ref().ok_or(FitError::NoFittingFunction)?;
        let mut total = 0.0;
        for (ordinal, constraint) in tree.active_constraints() {
            total += constraint.check(tree.get_parameter(ordinal)?);
        }
        Ok(total)
    }

    /// Jacobian of the weighted residuals with respect to the ACTIVE
    /// parameters, shape `[n_points, n_active]`.
    ///
    /// Analytic when every leaf supplies derivatives, the tree is linear in
    /// its children and no ties couple parameters; numeric finite
    /// differences otherwise.
    pub fn jacobian(&mut self) -> Result<Array2<f64>> {
        self.refresh()?;
        let tree = self.tree.as_ref().ok_or(FitError::NoFittingFunction)?;

        if tree.has_analytic_jacobian() && tree.ties().is_empty() {
            let full = tree.eval_jacobian_full(self.data.x())?;
            let weights = self.data.weights();
            let mut jac = Array2::zeros((self.data.n_points(), self.active_map.len()));
            for (col, &ordinal) in self.active_map.iter().enumerate() {
                for i in 0..self.data.n_points() {
                    jac[[i, col]] = weights[i] * full[[i, ordinal]];
                }
            }
            return Ok(jac);
        }

        let p = self.active_params()?;
        let base = self.residuals()?;
        let method = self.diff_method;
        let rel_step = self.rel_step;
        let mut f = |q: &Array1<f64>| -> Result<Array1<f64>> {
            self.set_active_params(q)?;
            self.residuals()
        };
        finite_difference::jacobian(&mut f, &p, &base, method, rel_step)
    }

    /// Cost, gradient and Gauss-Newton Hessian at the current parameters:
    /// `g = J^T r` plus constraint sub-gradients, `H = J^T J`.
    pub fn cost_grad_hess(&mut self) -> Result<(f64, Array1<f64>, Array2<f64>)> {
        let r = self.residuals()?;
        let jac = self.jacobian()?;

        for &v in jac.iter() {
            if !v.is_finite() {
                return Err(FitError::NumericFailure(
                    "Jacobian entry is not finite".to_string(),
                ));
            }
        }

        let mut cost = r.dot(&r);
        let mut gradient = jac.t().dot(&r);
        let hessian = jac.t().dot(&jac);

        let tree = self.tree.as_ref().ok_or(FitError::NoFittingFunction)?;
        for (ordinal, constraint) in tree.active_constraints() {
            let value = tree.get_parameter(ordinal)?;
            cost += constraint.check(value);
            // active_map is sorted by ordinal, so the gradient row is a
            // binary search away instead of a rescan per constraint.
            if let Ok(active_pos) = self.active_map.binary_search(&ordinal) {
                gradient[active_pos] += constraint.check_derivative(value);
            }
        }

        Ok((cost, gradient, hessian))
    }

    /// Clamp constrained parameters into their intervals before the first
    /// iteration.
    pub fn enforce_constraints(&mut self) -> Result<()> {
        self.snapshot = None;
        self.tree
            .as_mut()
            .ok_or(FitError::NoFittingFunction)?
            .enforce_constraints()
    }
}
