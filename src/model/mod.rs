//! Model abstraction: the leaf contract every fittable component satisfies,
//! the combination policy for composite nodes, and the tree that assembles
//! them with stable parameter addressing.

pub mod constraint;
pub mod tie;
pub mod tree;

use crate::error::{FitError, Result};
use ndarray::{Array1, Array2, ArrayView1};

pub use constraint::{parse_constraints, BoundaryConstraint, DEFAULT_PENALTY_FACTOR};
pub use tie::Tie;
pub use tree::{DroppedBinding, ModelTree, NodeId, ParamRecord};

/// Identifies one parameter by owning node and local position. Node ids are
/// stable across sibling renumbering, so a `ParamRef` survives structural
/// edits that don't remove its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamRef {
    pub node: NodeId,
    pub local: usize,
}

/// Contract every leaf model must satisfy: an ordered list of named
/// parameters and evaluation over a domain, with an optional analytic
/// Jacobian.
///
/// Parameter names must be unique within the leaf. `Send + Sync` lets the
/// tree evaluate composite children in parallel.
pub trait Model: Send + Sync {
    /// Registry name of this model kind, e.g. `"Gaussian"`.
    fn kind(&self) -> &str;

    fn n_params(&self) -> usize;

    fn param_name(&self, i: usize) -> &str;

    fn param_value(&self, i: usize) -> f64;

    fn set_param_value(&mut self, i: usize, value: f64);

    /// Local index of a named parameter, `None` if unknown.
    fn param_index(&self, name: &str) -> Option<usize> {
        (0..self.n_params()).find(|&i| self.param_name(i) == name)
    }

    /// Evaluate the model at the given x values.
    fn eval(&self, x: ArrayView1<'_, f64>) -> Result<Array1<f64>>;

    /// Analytic Jacobian `d f(x_i) / d p_j`, shape `[n_points, n_params]`.
    /// Only called when `has_analytic_jacobian()` returns true.
    fn eval_jacobian(&self, _x: ArrayView1<'_, f64>) -> Result<Array2<f64>> {
        Err(FitError::Other(format!(
            "{} does not provide an analytic Jacobian",
            self.kind()
        )))
    }

    fn has_analytic_jacobian(&self) -> bool {
        false
    }
}

/// How a composite node folds its children's outputs together. The default
/// is summation; a composite node owns its policy, so different non-leaf
/// types can combine differently.
pub trait CombinePolicy: Send + Sync {
    /// Registry name of the policy, e.g. `"sum"`.
    fn name(&self) -> &str;

    /// Write the identity element into the accumulator before any child is
    /// folded in.
    fn init(&self, acc: &mut Array1<f64>);

    /// Fold one child's output into the accumulator. Children are folded in
    /// sibling order.
    fn combine(&self, acc: &mut Array1<f64>, child: &Array1<f64>);

    /// True when the policy is linear in each child, which makes the
    /// composite Jacobian the concatenation of child Jacobians.
    fn is_linear(&self) -> bool {
        false
    }
}

/// Default combination: children's contributions are summed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumPolicy;

impl CombinePolicy for SumPolicy {
    fn name(&self) -> &str {
        "sum"
    }

    fn init(&self, acc: &mut Array1<f64>) {
        acc.fill(0.0);
    }

    fn combine(&self, acc: &mut Array1<f64>, child: &Array1<f64>) {
        *acc += child;
    }

    fn is_linear(&self) -> bool {
        true
    }
}

/// Pointwise product of children, e.g. a profile multiplied by an envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductPolicy;

impl CombinePolicy for ProductPolicy {
    fn name(&self) -> &str {
        "product"
    }

    fn init(&self, acc: &mut Array1<f64>) {
        acc.fill(1.0);
    }

    fn combine(&self, acc: &mut Array1<f64>, child: &Array1<f64>) {
        *acc *= child;
    }
}
