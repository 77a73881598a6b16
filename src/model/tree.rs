//! The composite model tree.
//!
//! Nodes live in an arena and are addressed by stable small-integer ids, so
//! ties and constraints hold `(NodeId, local)` references that survive
//! sibling renumbering; path strings like `f0.f1.sigma` are computed only at
//! the display/lookup boundary. Structural edits rebuild the flat ordinal
//! table, bump the tree generation and drop (with a report) any binding that
//! pointed into a removed subtree.

use std::collections::{HashMap, HashSet};

use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::diagnostics::{Diagnostics, WarningKind};
use crate::error::{FitError, Result};
use crate::expr::Expr;
use crate::model::constraint::{parse_constraints, BoundaryConstraint};
use crate::model::tie::Tie;
use crate::model::{CombinePolicy, Model, ParamRef, SumPolicy};

/// Stable node identifier, valid until the node is removed from the tree.
pub type NodeId = usize;

pub(crate) enum NodeKind {
    Leaf(Box<dyn Model>),
    Composite {
        children: Vec<NodeId>,
        policy: Box<dyn CombinePolicy>,
    },
}

pub(crate) struct Node {
    parent: Option<NodeId>,
    kind: NodeKind,
}

/// Per-parameter bookkeeping kept outside the leaf models.
#[derive(Debug, Clone, Copy, Default)]
struct ParamAttr {
    fixed: bool,
    tied: bool,
    stderr: f64,
}

/// Which kind of binding a structural edit dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Tie,
    Constraint,
}

/// A tie or constraint dropped because a tree edit removed a parameter it
/// referenced. Reported, never silently discarded.
#[derive(Debug, Clone)]
pub struct DroppedBinding {
    pub kind: BindingKind,
    pub description: String,
}

/// One row of the flattened parameter table, for persistence and reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamRecord {
    pub name: String,
    pub value: f64,
    pub stderr: f64,
    pub active: bool,
    pub tied: bool,
}

/// A tree of leaf models under composite combination nodes, with flat,
/// renumbering-safe parameter addressing.
pub struct ModelTree {
    nodes: Vec<Option<Node>>,
    root: NodeId,
    attrs: HashMap<NodeId, Vec<ParamAttr>>,
    /// Ordinal -> parameter, depth-first over the current structure.
    flat: Vec<ParamRef>,
    ordinal_of: HashMap<ParamRef, usize>,
    ties: Vec<Tie>,
    /// Tie application order: no tie reads a target another tie has not
    /// written yet.
    tie_order: Vec<usize>,
    constraints: Vec<(ParamRef, BoundaryConstraint)>,
    generation: u64,
}

impl ModelTree {
    /// A tree whose root is a single leaf model.
    pub fn leaf(model: Box<dyn Model>) -> Self {
        let n = model.n_params();
        let node = Node {
            parent: None,
            kind: NodeKind::Leaf(model),
        };
        let mut tree = Self {
            nodes: vec![Some(node)],
            root: 0,
            attrs: HashMap::from([(0, vec![ParamAttr::default(); n])]),
            flat: Vec::new(),
            ordinal_of: HashMap::new(),
            ties: Vec::new(),
            tie_order: Vec::new(),
            constraints: Vec::new(),
            generation: 0,
        };
        tree.rebuild_flat();
        tree
    }

    /// A tree whose root is an empty composite with the default (sum)
    /// combination policy.
    pub fn composite() -> Self {
        Self::composite_with_policy(Box::new(SumPolicy))
    }

    /// A tree whose root is an empty composite with an explicit policy.
    pub fn composite_with_policy(policy: Box<dyn CombinePolicy>) -> Self {
        let node = Node {
            parent: None,
            kind: NodeKind::Composite {
                children: Vec::new(),
                policy,
            },
        };
        Self {
            nodes: vec![Some(node)],
            root: 0,
            attrs: HashMap::new(),
            flat: Vec::new(),
            ordinal_of: HashMap::new(),
            ties: Vec::new(),
            tie_order: Vec::new(),
            constraints: Vec::new(),
            generation: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Bumped on every structural edit; cost functions use it for staleness
    /// detection.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| FitError::InvalidInput(format!("node {} does not exist", id)))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| FitError::InvalidInput(format!("node {} does not exist", id)))
    }

    fn leaf_of(&self, id: NodeId) -> Result<&dyn Model> {
        match &self.node(id)?.kind {
            NodeKind::Leaf(model) => Ok(model.as_ref()),
            NodeKind::Composite { .. } => Err(FitError::InvalidInput(format!(
                "node {} is a composite, not a leaf",
                id
            ))),
        }
    }

    pub fn is_composite(&self, id: NodeId) -> bool {
        matches!(
            self.nodes.get(id).and_then(|s| s.as_ref()),
            Some(Node {
                kind: NodeKind::Composite { .. },
                ..
            })
        )
    }

    /// Child ids of a composite node, empty for a leaf.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match self.nodes.get(id).and_then(|s| s.as_ref()) {
            Some(Node {
                kind: NodeKind::Composite { children, .. },
                ..
            }) => children,
            _ => &[],
        }
    }

    pub fn leaf_model(&self, id: NodeId) -> Option<&dyn Model> {
        match &self.nodes.get(id).and_then(|s| s.as_ref())?.kind {
            NodeKind::Leaf(model) => Some(model.as_ref()),
            NodeKind::Composite { .. } => None,
        }
    }

    pub fn policy_name(&self, id: NodeId) -> Option<&str> {
        match &self.nodes.get(id).and_then(|s| s.as_ref())?.kind {
            NodeKind::Composite { policy, .. } => Some(policy.name()),
            NodeKind::Leaf(_) => None,
        }
    }

    // ---- structural edits -------------------------------------------------

    /// Append a leaf model under a composite node. Returns the new node's
    /// id; the flat ordinal table is rebuilt.
    pub fn add_child(&mut self, parent: NodeId, model: Box<dyn Model>) -> Result<NodeId> {
        let n = model.n_params();
        self.require_composite(parent)?;

        let id = self.alloc(Node {
            parent: Some(parent),
            kind: NodeKind::Leaf(model),
        });
        self.attrs.insert(id, vec![ParamAttr::default(); n]);
        self.push_child(parent, id)?;
        self.generation += 1;
        self.rebuild_flat();
        Ok(id)
    }

    /// Append an empty composite node with its own combination policy.
    pub fn add_composite_child(
        &mut self,
        parent: NodeId,
        policy: Box<dyn CombinePolicy>,
    ) -> Result<NodeId> {
        self.require_composite(parent)?;
        let id = self.alloc(Node {
            parent: Some(parent),
            kind: NodeKind::Composite {
                children: Vec::new(),
                policy,
            },
        });
        self.push_child(parent, id)?;
        self.generation += 1;
        self.rebuild_flat();
        Ok(id)
    }

    /// Remove the child at `pos` (and its whole subtree). Later siblings are
    /// renumbered down by one. Any tie or constraint whose target or
    /// dependency pointed into the removed subtree is dropped, reported in
    /// the returned list and warned about on `diagnostics`.
    pub fn remove_child(
        &mut self,
        parent: NodeId,
        pos: usize,
        diagnostics: &mut Diagnostics,
    ) -> Result<Vec<DroppedBinding>> {
        let child = *self.children(parent).get(pos).ok_or_else(|| {
            FitError::InvalidInput(format!("node {} has no child at position {}", parent, pos))
        })?;

        // Collect the subtree before touching anything, and render the
        // descriptions of doomed bindings while their paths still resolve.
        let mut removed = HashSet::new();
        self.collect_subtree(child, &mut removed);

        let mut dropped = Vec::new();
        let mut kept_ties = Vec::new();
        for tie in std::mem::take(&mut self.ties) {
            let orphaned = removed.contains(&tie.target.node)
                || tie.dependencies().any(|d| removed.contains(&d.node));
            if orphaned {
                dropped.push(DroppedBinding {
                    kind: BindingKind::Tie,
                    description: tie.as_string(self, self.root),
                });
                // The target may survive the edit (only a dependency was
                // removed); it is no longer tied then.
                if !removed.contains(&tie.target.node) {
                    if let Some(attr) = self.attr_mut(tie.target) {
                        attr.tied = false;
                    }
                }
            } else {
                kept_ties.push(tie);
            }
        }
        self.ties = kept_ties;

        let root = self.root;
        let mut kept_constraints = Vec::new();
        for (param, constraint) in std::mem::take(&mut self.constraints) {
            if removed.contains(&param.node) {
                let name = self
                    .relative_name(param, root)
                    .unwrap_or_else(|| format!("node {} parameter {}", param.node, param.local));
                dropped.push(DroppedBinding {
                    kind: BindingKind::Constraint,
                    description: format!("constraint on {}", name),
                });
            } else {
                kept_constraints.push((param, constraint));
            }
        }
        self.constraints = kept_constraints;

        // Detach and free the subtree.
        if let NodeKind::Composite { children, .. } = &mut self.node_mut(parent)?.kind {
            children.remove(pos);
        }
        for id in &removed {
            self.nodes[*id] = None;
            self.attrs.remove(id);
        }

        self.generation += 1;
        self.rebuild_flat();
        self.rebuild_tie_order();
        for binding in &dropped {
            diagnostics.warn(WarningKind::DroppedBinding, binding.description.clone());
        }
        Ok(dropped)
    }

    fn require_composite(&self, id: NodeId) -> Result<()> {
        match self.node(id)?.kind {
            NodeKind::Composite { .. } => Ok(()),
            NodeKind::Leaf(_) => Err(FitError::InvalidInput(format!(
                "node {} is a leaf and cannot have children",
                id
            ))),
        }
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        // Freed slots are not reused: ids stay unique within this tree's
        // lifetime, so a stale id can never alias a new node.
        self.nodes.push(Some(node));
        self.nodes.len() - 1
    }

    fn push_child(&mut self, parent: NodeId, id: NodeId) -> Result<()> {
        match &mut self.node_mut(parent)?.kind {
            NodeKind::Composite { children, .. } => {
                children.push(id);
                Ok(())
            }
            NodeKind::Leaf(_) => unreachable!("checked by require_composite"),
        }
    }

    fn collect_subtree(&self, id: NodeId, out: &mut HashSet<NodeId>) {
        out.insert(id);
        for &child in self.children(id) {
            self.collect_subtree(child, out);
        }
    }

    fn rebuild_flat(&mut self) {
        self.flat.clear();
        self.ordinal_of.clear();
        self.collect_params(self.root);
        for (ordinal, param) in self.flat.iter().enumerate() {
            self.ordinal_of.insert(*param, ordinal);
        }
    }

    fn collect_params(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(id).and_then(|s| s.as_ref()) else {
            return;
        };
        match &node.kind {
            NodeKind::Leaf(model) => {
                for local in 0..model.n_params() {
                    self.flat.push(ParamRef { node: id, local });
                }
            }
            NodeKind::Composite { children, .. } => {
                for child in children.clone() {
                    self.collect_params(child);
                }
            }
        }
    }

    // ---- addressing -------------------------------------------------------

    pub fn n_params(&self) -> usize {
        self.flat.len()
    }

    fn param_ref(&self, ordinal: usize) -> Result<ParamRef> {
        self.flat
            .get(ordinal)
            .copied()
            .ok_or_else(|| FitError::ParameterNotFound(format!("ordinal {}", ordinal)))
    }

    /// Current value of a parameter identified by reference.
    pub fn param_value(&self, param: ParamRef) -> f64 {
        self.leaf_model(param.node)
            .map(|m| m.param_value(param.local))
            .unwrap_or(f64::NAN)
    }

    fn set_param_ref(&mut self, param: ParamRef, value: f64) -> Result<()> {
        match &mut self.node_mut(param.node)?.kind {
            NodeKind::Leaf(model) => {
                model.set_param_value(param.local, value);
                Ok(())
            }
            NodeKind::Composite { .. } => Err(FitError::ParameterNotFound(format!(
                "node {} is not a leaf",
                param.node
            ))),
        }
    }

    fn attr(&self, param: ParamRef) -> Option<&ParamAttr> {
        self.attrs.get(&param.node)?.get(param.local)
    }

    fn attr_mut(&mut self, param: ParamRef) -> Option<&mut ParamAttr> {
        self.attrs.get_mut(&param.node)?.get_mut(param.local)
    }

    /// Full path name (`f0.f1.sigma`) of the parameter at `ordinal`.
    pub fn parameter_name(&self, ordinal: usize) -> Result<String> {
        let param = self.param_ref(ordinal)?;
        self.relative_name(param, self.root)
            .ok_or_else(|| FitError::ParameterNotFound(format!("ordinal {}", ordinal)))
    }

    /// Ordinal of a parameter addressed by full path name.
    pub fn parameter_index(&self, full_name: &str) -> Result<usize> {
        let param = self
            .resolve_relative(self.root, full_name)
            .ok_or_else(|| FitError::ParameterNotFound(full_name.to_string()))?;
        self.ordinal_of
            .get(&param)
            .copied()
            .ok_or_else(|| FitError::ParameterNotFound(full_name.to_string()))
    }

    /// Render a parameter's name relative to `anchor`, `None` when the
    /// anchor does not contain the parameter.
    pub fn relative_name(&self, param: ParamRef, anchor: NodeId) -> Option<String> {
        let leaf_name = self.leaf_model(param.node)?.param_name(param.local);

        let mut positions = Vec::new();
        let mut cur = param.node;
        while cur != anchor {
            let parent = self.nodes.get(cur).and_then(|s| s.as_ref())?.parent?;
            let pos = self.children(parent).iter().position(|&c| c == cur)?;
            positions.push(pos);
            cur = parent;
        }

        let mut name = String::new();
        for pos in positions.iter().rev() {
            name.push_str(&format!("f{}.", pos));
        }
        name.push_str(leaf_name);
        Some(name)
    }

    /// Resolve a (possibly `f<k>.`-prefixed) name starting at `anchor`.
    fn resolve_relative(&self, anchor: NodeId, name: &str) -> Option<ParamRef> {
        let mut cur = anchor;
        let mut rest = name;
        loop {
            match &self.nodes.get(cur).and_then(|s| s.as_ref())?.kind {
                NodeKind::Leaf(model) => {
                    let local = model.param_index(rest)?;
                    return Some(ParamRef { node: cur, local });
                }
                NodeKind::Composite { children, .. } => {
                    let stripped = rest.strip_prefix('f')?;
                    let (index_str, remainder) = stripped.split_once('.')?;
                    let pos: usize = index_str.parse().ok()?;
                    cur = *children.get(pos)?;
                    rest = remainder;
                }
            }
        }
    }

    // ---- values, active flags, errors ------------------------------------

    pub fn get_parameter(&self, ordinal: usize) -> Result<f64> {
        let param = self.param_ref(ordinal)?;
        Ok(self.param_value(param))
    }

    /// Write a parameter value. With `notify_ties` every tie is re-applied
    /// afterwards so dependents observe the new value; optimizer-driven
    /// writes pass `false` and apply ties once per batch instead.
    pub fn set_parameter(&mut self, ordinal: usize, value: f64, notify_ties: bool) -> Result<()> {
        let param = self.param_ref(ordinal)?;
        self.set_param_ref(param, value)?;
        if notify_ties {
            self.apply_ties()?;
        }
        Ok(())
    }

    /// True when the parameter is neither fixed nor tied.
    pub fn is_active(&self, ordinal: usize) -> Result<bool> {
        let param = self.param_ref(ordinal)?;
        let attr = self.attr(param).copied().unwrap_or_default();
        Ok(!attr.fixed && !attr.tied)
    }

    /// Position of this parameter in the active-only vector the optimizer
    /// sees, `None` when the parameter is fixed or tied.
    pub fn active_index(&self, ordinal: usize) -> Result<Option<usize>> {
        if !self.is_active(ordinal)? {
            return Ok(None);
        }
        let mut active_pos = 0;
        for i in 0..ordinal {
            if self.is_active(i)? {
                active_pos += 1;
            }
        }
        Ok(Some(active_pos))
    }

    /// Active position per ordinal in a single pass, `None` for fixed or
    /// tied parameters. Use this instead of `active_index` when mapping more
    /// than one ordinal.
    pub fn active_indices(&self) -> Vec<Option<usize>> {
        let mut next = 0;
        (0..self.n_params())
            .map(|ordinal| {
                if self.is_active(ordinal).unwrap_or(false) {
                    next += 1;
                    Some(next - 1)
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        (0..self.n_params())
            .filter(|&i| self.is_active(i).unwrap_or(false))
            .count()
    }

    /// Active-flag pattern over all ordinals, used for staleness snapshots.
    pub fn active_pattern(&self) -> Vec<bool> {
        (0..self.n_params())
            .map(|i| self.is_active(i).unwrap_or(false))
            .collect()
    }

    pub fn fix(&mut self, full_name: &str) -> Result<()> {
        let ordinal = self.parameter_index(full_name)?;
        let param = self.param_ref(ordinal)?;
        if let Some(attr) = self.attr_mut(param) {
            attr.fixed = true;
        }
        Ok(())
    }

    pub fn unfix(&mut self, full_name: &str) -> Result<()> {
        let ordinal = self.parameter_index(full_name)?;
        let param = self.param_ref(ordinal)?;
        let tied = self.attr(param).map(|a| a.tied).unwrap_or(false);
        if tied {
            return Err(FitError::InvalidInput(format!(
                "parameter '{}' is tied; remove the tie before unfixing",
                full_name
            )));
        }
        if let Some(attr) = self.attr_mut(param) {
            attr.fixed = false;
        }
        Ok(())
    }

    pub fn stderr(&self, ordinal: usize) -> Result<f64> {
        let param = self.param_ref(ordinal)?;
        Ok(self.attr(param).map(|a| a.stderr).unwrap_or(0.0))
    }

    pub fn set_stderr(&mut self, ordinal: usize, stderr: f64) -> Result<()> {
        let param = self.param_ref(ordinal)?;
        if let Some(attr) = self.attr_mut(param) {
            attr.stderr = stderr;
        }
        Ok(())
    }

    /// Flattened parameter table: name, value, error and flags per ordinal.
    pub fn parameter_table(&self) -> Result<Vec<ParamRecord>> {
        let mut rows = Vec::with_capacity(self.n_params());
        for ordinal in 0..self.n_params() {
            let param = self.param_ref(ordinal)?;
            let attr = self.attr(param).copied().unwrap_or_default();
            rows.push(ParamRecord {
                name: self.parameter_name(ordinal)?,
                value: self.param_value(param),
                stderr: attr.stderr,
                active: !attr.fixed && !attr.tied,
                tied: attr.tied,
            });
        }
        Ok(rows)
    }

    // ---- ties -------------------------------------------------------------

    /// Tie `target_name` to an expression over other parameters in this
    /// tree. Fails without mutating the tree on a parse error, an
    /// unresolvable name, a direct self-reference or a transitive cycle.
    pub fn tie(&mut self, target_name: &str, expr_text: &str) -> Result<()> {
        let expr = Expr::parse(expr_text)?;
        let target_ordinal = self.parameter_index(target_name)?;
        let target = self.param_ref(target_ordinal)?;

        let mut deps = Vec::new();
        for var in expr.variables() {
            let resolved = self.resolve_tie_variable(target, &var).ok_or_else(|| {
                FitError::UnknownParameterInTie {
                    tie: format!("{}={}", target_name, expr_text),
                    name: var.clone(),
                }
            })?;
            if resolved == target {
                return Err(FitError::SelfReferentialTie(target_name.to_string()));
            }
            deps.push((var, resolved));
        }

        let candidate = Tie::new(target, expr, deps);
        self.check_no_cycle(&candidate, target_name)?;

        // Commit: one tie per target, newest wins.
        self.ties.retain(|t| t.target != target);
        self.ties.push(candidate);
        if let Some(attr) = self.attr_mut(target) {
            attr.tied = true;
        }
        self.rebuild_tie_order();
        Ok(())
    }

    /// Resolution order for a tie variable: the target's own leaf first,
    /// then root-relative, then relative to enclosing composites from the
    /// innermost outward.
    fn resolve_tie_variable(&self, target: ParamRef, var: &str) -> Option<ParamRef> {
        if let Some(model) = self.leaf_model(target.node) {
            if let Some(local) = model.param_index(var) {
                return Some(ParamRef {
                    node: target.node,
                    local,
                });
            }
        }
        if let Some(param) = self.resolve_relative(self.root, var) {
            return Some(param);
        }
        let mut anchor = self.nodes.get(target.node).and_then(|s| s.as_ref())?.parent;
        while let Some(node) = anchor {
            if let Some(param) = self.resolve_relative(node, var) {
                return Some(param);
            }
            anchor = self.nodes.get(node).and_then(|s| s.as_ref())?.parent;
        }
        None
    }

    /// Reject a candidate tie that would close a dependency cycle. The
    /// existing tie set is acyclic, so only paths through the candidate's
    /// target need checking.
    fn check_no_cycle(&self, candidate: &Tie, target_name: &str) -> Result<()> {
        let tie_by_target: HashMap<ParamRef, &Tie> = self
            .ties
            .iter()
            .filter(|t| t.target != candidate.target)
            .chain(std::iter::once(candidate))
            .map(|t| (t.target, t))
            .collect();

        let mut visited = HashSet::new();
        let mut stack: Vec<ParamRef> = candidate.dependencies().collect();
        while let Some(param) = stack.pop() {
            if param == candidate.target {
                return Err(FitError::CyclicTieDependency(target_name.to_string()));
            }
            if !visited.insert(param) {
                continue;
            }
            if let Some(tie) = tie_by_target.get(&param) {
                stack.extend(tie.dependencies());
            }
        }
        Ok(())
    }

    /// Remove the tie on a parameter. Returns whether one existed. The
    /// parameter becomes fixed; the caller may `unfix` it.
    pub fn untie(&mut self, full_name: &str) -> Result<bool> {
        let ordinal = self.parameter_index(full_name)?;
        let param = self.param_ref(ordinal)?;
        let before = self.ties.len();
        self.ties.retain(|t| t.target != param);
        let removed = self.ties.len() != before;
        if removed {
            if let Some(attr) = self.attr_mut(param) {
                attr.tied = false;
                attr.fixed = true;
            }
            self.rebuild_tie_order();
        }
        Ok(removed)
    }

    /// Attach several ties at once: `"a=2*b, f1.c=max(f0.a, 1)"`. Commas
    /// inside function calls do not split clauses.
    pub fn add_ties(&mut self, text: &str) -> Result<()> {
        for clause in split_top_level(text, ',') {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            let (name, expr) = clause.split_once('=').ok_or_else(|| {
                FitError::ParseError(format!("tie clause '{}' has no '='", clause))
            })?;
            self.tie(name.trim(), expr.trim())?;
        }
        Ok(())
    }

    pub fn ties(&self) -> &[Tie] {
        &self.ties
    }

    /// Render the tie on `target_name` relative to `anchor`.
    pub fn tie_as_string(&self, target_name: &str, anchor: NodeId) -> Result<String> {
        let ordinal = self.parameter_index(target_name)?;
        let param = self.param_ref(ordinal)?;
        let tie = self
            .ties
            .iter()
            .find(|t| t.target == param)
            .ok_or_else(|| {
                FitError::ParameterNotFound(format!("no tie on '{}'", target_name))
            })?;
        Ok(tie.as_string(self, anchor))
    }

    /// Evaluate every tie in dependency order and write the results into
    /// their targets. Runs single-threaded: the order is a correctness
    /// dependency.
    pub fn apply_ties(&mut self) -> Result<()> {
        for idx in self.tie_order.clone() {
            let target = self.ties[idx].target;
            let value = self.ties[idx].evaluate(self)?;
            self.set_param_ref(target, value)?;
        }
        Ok(())
    }

    /// Topological order over ties: a tie runs after every tie whose target
    /// it depends on. The attach-time cycle check guarantees this resolves.
    fn rebuild_tie_order(&mut self) {
        let n = self.ties.len();
        let target_to_idx: HashMap<ParamRef, usize> = self
            .ties
            .iter()
            .enumerate()
            .map(|(i, t)| (t.target, i))
            .collect();

        let mut pending: Vec<usize> = (0..n).collect();
        let mut done: HashSet<usize> = HashSet::new();
        let mut order = Vec::with_capacity(n);

        while !pending.is_empty() {
            let mut progressed = false;
            pending.retain(|&i| {
                let ready = self.ties[i].dependencies().all(|dep| {
                    target_to_idx
                        .get(&dep)
                        .map(|j| done.contains(j))
                        .unwrap_or(true)
                });
                if ready {
                    order.push(i);
                    done.insert(i);
                    progressed = true;
                    false
                } else {
                    true
                }
            });
            debug_assert!(progressed, "tie graph must be acyclic after attach checks");
            if !progressed {
                // Defensive: fall back to insertion order for the remainder.
                order.extend(pending.drain(..));
            }
        }
        self.tie_order = order;
    }

    // ---- constraints ------------------------------------------------------

    /// Attach a boundary constraint to a named parameter, replacing any
    /// existing one on the same parameter.
    pub fn constrain(&mut self, full_name: &str, constraint: BoundaryConstraint) -> Result<()> {
        let ordinal = self.parameter_index(full_name)?;
        let param = self.param_ref(ordinal)?;
        self.constraints.retain(|(p, _)| *p != param);
        self.constraints.push((param, constraint));
        Ok(())
    }

    /// Attach constraints from comparator text: `"0.1 < f0.sigma < 5,
    /// f1.height > 0"`.
    pub fn add_constraints(&mut self, text: &str) -> Result<()> {
        for (name, constraint) in parse_constraints(text)? {
            self.constrain(&name, constraint)?;
        }
        Ok(())
    }

    /// Constraints with their current full ordinals. A constraint whose
    /// parameter is inactive is inert and excluded here.
    pub fn active_constraints(&self) -> Vec<(usize, &BoundaryConstraint)> {
        self.constraints
            .iter()
            .filter_map(|(param, c)| {
                let ordinal = *self.ordinal_of.get(param)?;
                match self.is_active(ordinal) {
                    Ok(true) => Some((ordinal, c)),
                    _ => None,
                }
            })
            .collect()
    }

    pub fn n_constraints(&self) -> usize {
        self.constraints.len()
    }

    /// Clamp every actively constrained parameter into its interval, then
    /// re-apply ties. Used to repair a starting guess.
    pub fn enforce_constraints(&mut self) -> Result<()> {
        let updates: Vec<(ParamRef, f64)> = self
            .constraints
            .iter()
            .filter_map(|(param, c)| {
                let ordinal = *self.ordinal_of.get(param)?;
                if !self.is_active(ordinal).ok()? {
                    return None;
                }
                let value = self.param_value(*param);
                let clamped = c.enforce(value);
                (clamped != value).then_some((*param, clamped))
            })
            .collect();

        for (param, value) in updates {
            self.set_param_ref(param, value)?;
        }
        self.apply_ties()
    }

    // ---- evaluation -------------------------------------------------------

    /// Evaluate the whole tree over `x`. Composite nodes fold their
    /// children under their combination policy; children are evaluated in
    /// parallel (the tree is only read in this region).
    pub fn eval(&self, x: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
        self.eval_node(self.root, x)
    }

    fn eval_node(&self, id: NodeId, x: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
        match &self.node(id)?.kind {
            NodeKind::Leaf(model) => model.eval(x),
            NodeKind::Composite { children, policy } => {
                let outputs: Result<Vec<Array1<f64>>> = if children.len() > 1 {
                    children
                        .par_iter()
                        .map(|&child| self.eval_node(child, x))
                        .collect()
                } else {
                    children
                        .iter()
                        .map(|&child| self.eval_node(child, x))
                        .collect()
                };

                let mut acc = Array1::zeros(x.len());
                policy.init(&mut acc);
                for out in outputs? {
                    policy.combine(&mut acc, &out);
                }
                Ok(acc)
            }
        }
    }

    /// True when every leaf supplies an analytic Jacobian and every
    /// composite policy is linear, so the full-model Jacobian is the
    /// concatenation of leaf Jacobians.
    pub fn has_analytic_jacobian(&self) -> bool {
        self.flat.iter().all(|p| {
            self.leaf_model(p.node)
                .map(|m| m.has_analytic_jacobian())
                .unwrap_or(false)
        }) && self.all_policies_linear(self.root)
    }

    fn all_policies_linear(&self, id: NodeId) -> bool {
        match self.nodes.get(id).and_then(|s| s.as_ref()) {
            Some(Node {
                kind: NodeKind::Composite { children, policy },
                ..
            }) => policy.is_linear() && children.iter().all(|&c| self.all_policies_linear(c)),
            _ => true,
        }
    }

    /// Analytic Jacobian of the full model with respect to every flat
    /// parameter, shape `[n_points, n_params]`. Valid only when
    /// `has_analytic_jacobian()`.
    pub fn eval_jacobian_full(&self, x: ArrayView1<'_, f64>) -> Result<Array2<f64>> {
        let mut jac = Array2::zeros((x.len(), self.n_params()));
        let mut col = 0;
        // Flat order is depth-first, so leaf blocks are contiguous.
        let mut leaf_order = Vec::new();
        self.collect_leaves(self.root, &mut leaf_order);
        for leaf in leaf_order {
            let model = self.leaf_of(leaf)?;
            let block = model.eval_jacobian(x)?;
            if block.shape() != [x.len(), model.n_params()] {
                return Err(FitError::DimensionMismatch(format!(
                    "{} Jacobian has shape {:?}, expected [{}, {}]",
                    model.kind(),
                    block.shape(),
                    x.len(),
                    model.n_params()
                )));
            }
            for j in 0..model.n_params() {
                jac.column_mut(col + j).assign(&block.column(j));
            }
            col += model.n_params();
        }
        Ok(jac)
    }

    fn collect_leaves(&self, id: NodeId, out: &mut Vec<NodeId>) {
        match self.nodes.get(id).and_then(|s| s.as_ref()).map(|n| &n.kind) {
            Some(NodeKind::Leaf(_)) => out.push(id),
            Some(NodeKind::Composite { children, .. }) => {
                for &child in children {
                    self.collect_leaves(child, out);
                }
            }
            None => {}
        }
    }
}

/// Split on `sep` at paren depth zero, so function-call argument lists and
/// nested composite groups stay intact.
pub(crate) fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExpDecay, Gaussian, Linear};
    use approx::assert_relative_eq;
    use ndarray::array;

    fn two_gaussian_tree() -> ModelTree {
        let mut tree = ModelTree::composite();
        tree.add_child(tree.root(), Box::new(Gaussian::new(2.0, 0.0, 1.0)))
            .unwrap();
        tree.add_child(tree.root(), Box::new(Gaussian::new(1.0, 5.0, 0.5)))
            .unwrap();
        tree
    }

    #[test]
    fn test_leaf_tree_addressing() {
        let tree = ModelTree::leaf(Box::new(Gaussian::new(2.0, 1.0, 0.5)));
        assert_eq!(tree.n_params(), 3);
        assert_eq!(tree.parameter_name(0).unwrap(), "height");
        assert_eq!(tree.parameter_index("sigma").unwrap(), 2);
        assert_eq!(tree.get_parameter(1).unwrap(), 1.0);
        assert!(matches!(
            tree.parameter_index("nope"),
            Err(FitError::ParameterNotFound(_))
        ));
    }

    #[test]
    fn test_composite_addressing() {
        let tree = two_gaussian_tree();
        assert_eq!(tree.n_params(), 6);
        assert_eq!(tree.parameter_name(0).unwrap(), "f0.height");
        assert_eq!(tree.parameter_name(5).unwrap(), "f1.sigma");
        assert_eq!(tree.parameter_index("f1.centre").unwrap(), 4);
        assert_eq!(
            tree.parameter_name(tree.parameter_index("f0.sigma").unwrap())
                .unwrap(),
            "f0.sigma"
        );
    }

    #[test]
    fn test_nested_composite_addressing() {
        let mut tree = ModelTree::composite();
        tree.add_child(tree.root(), Box::new(Linear::new(0.0, 1.0)))
            .unwrap();
        let inner = tree
            .add_composite_child(tree.root(), Box::new(SumPolicy))
            .unwrap();
        tree.add_child(inner, Box::new(Gaussian::new(1.0, 0.0, 1.0)))
            .unwrap();

        assert_eq!(tree.parameter_name(2).unwrap(), "f1.f0.height");
        assert_eq!(tree.parameter_index("f1.f0.sigma").unwrap(), 4);
    }

    #[test]
    fn test_remove_child_renumbers() {
        let mut tree = ModelTree::composite();
        tree.add_child(tree.root(), Box::new(Gaussian::new(1.0, 0.0, 1.0)))
            .unwrap();
        tree.add_child(tree.root(), Box::new(Linear::new(0.5, 0.1)))
            .unwrap();
        tree.add_child(tree.root(), Box::new(ExpDecay::new(3.0, 2.0)))
            .unwrap();

        let gen_before = tree.generation();
        let mut diag = Diagnostics::new();
        let dropped = tree.remove_child(tree.root(), 1, &mut diag).unwrap();
        assert!(dropped.is_empty());
        assert!(diag.is_empty());
        assert!(tree.generation() > gen_before);

        // The exponential moved from f2 to f1.
        assert_eq!(tree.n_params(), 5);
        assert_eq!(tree.parameter_name(3).unwrap(), "f1.amplitude");
        assert_eq!(tree.parameter_index("f1.lifetime").unwrap(), 4);
        assert!(tree.parameter_index("f2.amplitude").is_err());
    }

    #[test]
    fn test_remove_child_drops_orphaned_bindings() {
        let mut tree = two_gaussian_tree();
        tree.tie("f1.sigma", "2 * f0.sigma").unwrap();
        tree.add_constraints("f0.height > 0").unwrap();
        assert_eq!(tree.ties().len(), 1);

        // Removing f0 orphans both the tie (dependency) and the constraint.
        let mut diag = Diagnostics::new();
        let dropped = tree.remove_child(tree.root(), 0, &mut diag).unwrap();
        assert_eq!(dropped.len(), 2);
        assert!(dropped.iter().any(|d| d.kind == BindingKind::Tie));
        assert!(dropped.iter().any(|d| d.kind == BindingKind::Constraint));
        assert!(tree.ties().is_empty());

        // Each drop is also reported through the diagnostics channel.
        assert_eq!(diag.len(), 2);
        assert!(diag
            .warnings()
            .iter()
            .all(|w| w.kind == WarningKind::DroppedBinding));

        // The surviving parameter is untied again.
        let ordinal = tree.parameter_index("f0.sigma").unwrap();
        assert!(tree.is_active(ordinal).unwrap());
    }

    #[test]
    fn test_active_fixed_partition() {
        let mut tree = two_gaussian_tree();
        tree.fix("f0.centre").unwrap();
        tree.tie("f1.height", "f0.height / 2").unwrap();

        let active: Vec<bool> = tree.active_pattern();
        assert_eq!(active, vec![true, false, true, false, true, true]);
        assert_eq!(tree.active_count(), 4);

        // active_index is None exactly for fixed or tied parameters.
        assert_eq!(tree.active_index(0).unwrap(), Some(0));
        assert_eq!(tree.active_index(1).unwrap(), None);
        assert_eq!(tree.active_index(2).unwrap(), Some(1));
        assert_eq!(tree.active_index(3).unwrap(), None);
        assert_eq!(tree.active_index(4).unwrap(), Some(2));
        assert_eq!(tree.active_index(5).unwrap(), Some(3));

        // The one-pass table agrees with the per-ordinal lookups.
        let table = tree.active_indices();
        for (ordinal, &pos) in table.iter().enumerate() {
            assert_eq!(pos, tree.active_index(ordinal).unwrap());
        }

        tree.unfix("f0.centre").unwrap();
        assert_eq!(tree.active_count(), 5);
        assert!(tree.unfix("f1.height").is_err(), "tied cannot be unfixed");
    }

    #[test]
    fn test_tie_evaluation_and_notify() {
        let mut tree = two_gaussian_tree();
        tree.tie("f1.height", "f0.height / 2").unwrap();

        let src = tree.parameter_index("f0.height").unwrap();
        let dst = tree.parameter_index("f1.height").unwrap();

        tree.set_parameter(src, 10.0, true).unwrap();
        assert_eq!(tree.get_parameter(dst).unwrap(), 5.0);

        // Without notification the tied value is stale until apply_ties.
        tree.set_parameter(src, 4.0, false).unwrap();
        assert_eq!(tree.get_parameter(dst).unwrap(), 5.0);
        tree.apply_ties().unwrap();
        assert_eq!(tree.get_parameter(dst).unwrap(), 2.0);
    }

    #[test]
    fn test_tie_unqualified_same_leaf() {
        let mut tree = ModelTree::leaf(Box::new(Gaussian::new(2.0, 1.0, 0.5)));
        tree.tie("height", "3 * sigma").unwrap();
        tree.apply_ties().unwrap();
        assert_relative_eq!(tree.get_parameter(0).unwrap(), 1.5);
    }

    #[test]
    fn test_tie_chain_order() {
        let mut tree = ModelTree::composite();
        tree.add_child(tree.root(), Box::new(Gaussian::new(1.0, 0.0, 1.0)))
            .unwrap();
        tree.add_child(tree.root(), Box::new(Gaussian::new(1.0, 0.0, 1.0)))
            .unwrap();
        tree.add_child(tree.root(), Box::new(Gaussian::new(1.0, 0.0, 1.0)))
            .unwrap();

        // Attach in an order that would be wrong if applied naively.
        tree.tie("f2.height", "f1.height + 1").unwrap();
        tree.tie("f1.height", "f0.height + 1").unwrap();

        let src = tree.parameter_index("f0.height").unwrap();
        tree.set_parameter(src, 10.0, true).unwrap();
        assert_eq!(
            tree.get_parameter(tree.parameter_index("f1.height").unwrap())
                .unwrap(),
            11.0
        );
        assert_eq!(
            tree.get_parameter(tree.parameter_index("f2.height").unwrap())
                .unwrap(),
            12.0
        );
    }

    #[test]
    fn test_self_tie_rejected_without_mutation() {
        let mut tree = ModelTree::leaf(Box::new(Gaussian::new(2.0, 1.0, 0.5)));
        let err = tree.tie("height", "height + 1").unwrap_err();
        assert!(matches!(err, FitError::SelfReferentialTie(_)));
        assert!(tree.ties().is_empty());
        assert!(tree.is_active(0).unwrap());
    }

    #[test]
    fn test_transitive_cycle_rejected() {
        let mut tree = two_gaussian_tree();
        tree.tie("f0.height", "2 * f1.height").unwrap();
        let err = tree.tie("f1.height", "f0.height - 1").unwrap_err();
        assert!(matches!(err, FitError::CyclicTieDependency(_)));
        // The earlier tie is untouched.
        assert_eq!(tree.ties().len(), 1);
    }

    #[test]
    fn test_unknown_tie_variable() {
        let mut tree = two_gaussian_tree();
        let err = tree.tie("f0.height", "f3.height * 2").unwrap_err();
        assert!(matches!(err, FitError::UnknownParameterInTie { .. }));
    }

    #[test]
    fn test_tie_round_trip_strings() {
        let mut tree = two_gaussian_tree();
        tree.tie("f1.sigma", "2 * f0.sigma").unwrap();

        let rendered = tree.tie_as_string("f1.sigma", tree.root()).unwrap();
        assert_eq!(rendered, "f1.sigma=2 * f0.sigma");

        // Relative to f1 the target is local; the dependency keeps its
        // root-relative name.
        let f1 = tree.children(tree.root())[1];
        let rendered = tree.tie_as_string("f1.sigma", f1).unwrap();
        assert_eq!(rendered, "sigma=2 * f0.sigma");

        // An anchor that does not contain the target renders empty.
        let f0 = tree.children(tree.root())[0];
        let tie = &tree.ties()[0];
        assert_eq!(tie.as_string(&tree, f0), "");
    }

    #[test]
    fn test_add_ties_splits_outside_parens() {
        let mut tree = two_gaussian_tree();
        tree.add_ties("f1.sigma = 2 * f0.sigma, f1.height = max(f0.height, 1)")
            .unwrap();
        assert_eq!(tree.ties().len(), 2);
    }

    #[test]
    fn test_untie_restores_fixed() {
        let mut tree = two_gaussian_tree();
        tree.tie("f1.height", "f0.height").unwrap();
        let ordinal = tree.parameter_index("f1.height").unwrap();
        assert!(!tree.is_active(ordinal).unwrap());

        assert!(tree.untie("f1.height").unwrap());
        assert!(!tree.is_active(ordinal).unwrap(), "untied becomes fixed");
        tree.unfix("f1.height").unwrap();
        assert!(tree.is_active(ordinal).unwrap());
    }

    #[test]
    fn test_composite_eval_sums_children() {
        let tree = two_gaussian_tree();
        let x = array![0.0, 5.0];
        let y = tree.eval(x.view()).unwrap();
        // At x=0 the first Gaussian peaks; at x=5 the second does.
        assert_relative_eq!(y[0], 2.0 + (-50.0f64).exp(), epsilon = 1e-12);
        assert_relative_eq!(y[1], 1.0 + 2.0 * (-12.5f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_product_policy_combination() {
        let mut tree = ModelTree::composite_with_policy(Box::new(crate::model::ProductPolicy));
        tree.add_child(tree.root(), Box::new(Linear::new(2.0, 0.0)))
            .unwrap();
        tree.add_child(tree.root(), Box::new(Linear::new(0.0, 1.0)))
            .unwrap();

        let x = array![1.0, 3.0];
        let y = tree.eval(x.view()).unwrap();
        // (2) * (x) pointwise.
        assert_relative_eq!(y[0], 2.0);
        assert_relative_eq!(y[1], 6.0);
        assert!(!tree.has_analytic_jacobian());
    }

    #[test]
    fn test_analytic_jacobian_concatenation() {
        let tree = two_gaussian_tree();
        assert!(tree.has_analytic_jacobian());

        let x = array![0.0, 1.0, 5.0];
        let jac = tree.eval_jacobian_full(x.view()).unwrap();
        assert_eq!(jac.shape(), &[3, 6]);
        // d/d height at the peak centre is 1 for the owning Gaussian and
        // (numerically) 0 for the distant one.
        assert_relative_eq!(jac[[0, 0]], 1.0, epsilon = 1e-10);
        assert!(jac[[0, 3]].abs() < 1e-10);
    }

    #[test]
    fn test_constraints_inert_when_inactive() {
        let mut tree = two_gaussian_tree();
        tree.add_constraints("f0.sigma > 0.1").unwrap();
        assert_eq!(tree.active_constraints().len(), 1);

        tree.fix("f0.sigma").unwrap();
        assert!(tree.active_constraints().is_empty());
    }

    #[test]
    fn test_enforce_constraints_repairs_start() {
        let mut tree = two_gaussian_tree();
        tree.add_constraints("1 < f0.height < 10").unwrap();
        let ordinal = tree.parameter_index("f0.height").unwrap();
        tree.set_parameter(ordinal, -3.0, false).unwrap();

        tree.enforce_constraints().unwrap();
        assert_eq!(tree.get_parameter(ordinal).unwrap(), 1.0);
    }

    #[test]
    fn test_split_top_level() {
        assert_eq!(
            split_top_level("a=1, b=max(1, 2), c=3", ','),
            vec!["a=1", " b=max(1, 2)", " c=3"]
        );
    }
}
