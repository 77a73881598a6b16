//! Parameter ties: a tied parameter's value is computed from an expression
//! over other parameters in the same tree instead of being optimized.
//!
//! A tie stores its target and dependencies as `(node id, local index)`
//! references, never path strings; paths are rendered only for display, so
//! sibling renumbering cannot corrupt a live tie.

use crate::error::Result;
use crate::expr::{Bindings, Expr};
use crate::model::tree::{ModelTree, NodeId};
use crate::model::ParamRef;

/// One parameter tie: `target = expr(deps...)`.
#[derive(Debug, Clone)]
pub struct Tie {
    pub(crate) target: ParamRef,
    pub(crate) expr: Expr,
    /// Variable name as written in the expression, and the parameter it
    /// resolved to.
    pub(crate) deps: Vec<(String, ParamRef)>,
}

struct TreeBindings<'a> {
    tree: &'a ModelTree,
    deps: &'a [(String, ParamRef)],
}

impl Bindings for TreeBindings<'_> {
    fn lookup(&self, name: &str) -> Option<f64> {
        self.deps
            .iter()
            .find(|(var, _)| var == name)
            .map(|(_, param)| self.tree.param_value(*param))
    }
}

impl Tie {
    pub(crate) fn new(target: ParamRef, expr: Expr, deps: Vec<(String, ParamRef)>) -> Self {
        Self { target, expr, deps }
    }

    pub fn target(&self) -> ParamRef {
        self.target
    }

    pub fn dependencies(&self) -> impl Iterator<Item = ParamRef> + '_ {
        self.deps.iter().map(|(_, param)| *param)
    }

    /// Evaluate the tie expression against the current values of its
    /// resolved dependencies.
    pub fn evaluate(&self, tree: &ModelTree) -> Result<f64> {
        let bindings = TreeBindings {
            tree,
            deps: &self.deps,
        };
        self.expr.evaluate(&bindings)
    }

    /// Render `target=expr` with every parameter name rewritten relative to
    /// `anchor`. Returns an empty string when the anchor does not contain
    /// the target.
    pub fn as_string(&self, tree: &ModelTree, anchor: NodeId) -> String {
        let Some(target_name) = tree.relative_name(self.target, anchor) else {
            return String::new();
        };

        let mut expr = self.expr.clone();
        for (var, param) in &self.deps {
            // Dependencies outside the anchor keep root-relative names.
            let renamed = tree
                .relative_name(*param, anchor)
                .or_else(|| tree.relative_name(*param, tree.root()));
            if let Some(new_name) = renamed {
                if *var != new_name {
                    expr.rename_variable(var, &new_name);
                }
            }
        }
        format!("{}={}", target_name, expr)
    }
}
