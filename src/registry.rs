//! Model registry and the text form of a model tree.
//!
//! Trees round-trip through a compact string: leaves are
//! `name=Kind,param=value,...`, siblings are joined with `;`, nested
//! composites are parenthesized and a non-default combination policy is
//! declared with a leading `composite=<policy>` member.

use std::collections::HashMap;

use crate::error::{FitError, Result};
use crate::model::tree::split_top_level;
use crate::model::{CombinePolicy, Model, ModelTree, NodeId, ProductPolicy, SumPolicy};
use crate::models::{ExpDecay, Gaussian, Linear};

type ModelFactory = Box<dyn Fn() -> Box<dyn Model> + Send + Sync>;
type PolicyFactory = Box<dyn Fn() -> Box<dyn CombinePolicy> + Send + Sync>;

/// Maps model kind and policy names to factories, so trees can be built
/// from text.
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelFactory>,
    policies: HashMap<String, PolicyFactory>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in models and policies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("Gaussian", || Box::new(Gaussian::default()));
        registry.register("ExpDecay", || Box::new(ExpDecay::default()));
        registry.register("Linear", || Box::new(Linear::default()));
        registry.register_policy("sum", || Box::new(SumPolicy));
        registry.register_policy("product", || Box::new(ProductPolicy));
        registry
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn() -> Box<dyn Model> + Send + Sync + 'static,
    {
        self.models.insert(kind.to_string(), Box::new(factory));
    }

    pub fn register_policy<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn CombinePolicy> + Send + Sync + 'static,
    {
        self.policies.insert(name.to_string(), Box::new(factory));
    }

    /// Instantiate a registered model kind with its default parameters.
    pub fn create(&self, kind: &str) -> Result<Box<dyn Model>> {
        self.models
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| FitError::UndefinedFunction(kind.to_string()))
    }

    pub fn create_policy(&self, name: &str) -> Result<Box<dyn CombinePolicy>> {
        self.policies
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| FitError::UndefinedFunction(name.to_string()))
    }

    /// Build a model tree from its text form.
    pub fn tree_from_string(&self, text: &str) -> Result<ModelTree> {
        let text = text.trim();
        if text.is_empty() {
            return Err(FitError::ParseError("empty model string".to_string()));
        }

        let clauses = split_top_level(text, ';');
        let single_leaf =
            clauses.len() == 1 && !text.starts_with('(') && !text.starts_with("composite=");
        if single_leaf {
            return Ok(ModelTree::leaf(self.parse_leaf(text)?));
        }

        let (policy_name, body) = split_policy(text);
        let mut tree = ModelTree::composite_with_policy(self.create_policy(policy_name)?);
        let root = tree.root();
        self.add_children(&mut tree, root, body)?;
        Ok(tree)
    }

    fn add_children(&self, tree: &mut ModelTree, parent: NodeId, text: &str) -> Result<()> {
        for clause in split_top_level(text, ';') {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            if let Some(inner) = clause.strip_prefix('(') {
                let inner = inner.strip_suffix(')').ok_or_else(|| {
                    FitError::ParseError(format!("unbalanced parentheses in '{}'", clause))
                })?;
                let (policy_name, body) = split_policy(inner);
                let child = tree.add_composite_child(parent, self.create_policy(policy_name)?)?;
                self.add_children(tree, child, body)?;
            } else {
                let model = self.parse_leaf(clause)?;
                tree.add_child(parent, model)?;
            }
        }
        Ok(())
    }

    /// Parse one `name=Kind,param=value,...` clause.
    fn parse_leaf(&self, clause: &str) -> Result<Box<dyn Model>> {
        let mut fields = clause.split(',').map(str::trim);
        let head = fields
            .next()
            .and_then(|f| f.strip_prefix("name="))
            .ok_or_else(|| {
                FitError::ParseError(format!("model clause '{}' must start with name=", clause))
            })?;

        let mut model = self.create(head.trim())?;
        for field in fields {
            if field.is_empty() {
                continue;
            }
            let (key, value) = field.split_once('=').ok_or_else(|| {
                FitError::ParseError(format!("expected param=value, got '{}'", field))
            })?;
            let key = key.trim();
            let index = model
                .param_index(key)
                .ok_or_else(|| FitError::ParameterNotFound(format!("{}.{}", head, key)))?;
            let value: f64 = value.trim().parse().map_err(|_| {
                FitError::ParseError(format!("'{}' is not a numeric value", value))
            })?;
            model.set_param_value(index, value);
        }
        Ok(model)
    }
}

/// Render a model tree to its text form. Inverse of
/// [`ModelRegistry::tree_from_string`] for registered kinds.
pub fn model_to_string(tree: &ModelTree) -> String {
    serialize_node(tree, tree.root())
}

fn serialize_node(tree: &ModelTree, id: NodeId) -> String {
    if let Some(model) = tree.leaf_model(id) {
        let mut out = format!("name={}", model.kind());
        for i in 0..model.n_params() {
            out.push_str(&format!(",{}={}", model.param_name(i), model.param_value(i)));
        }
        return out;
    }

    let mut parts = Vec::new();
    if let Some(policy) = tree.policy_name(id) {
        if policy != "sum" {
            parts.push(format!("composite={}", policy));
        }
    }
    for &child in tree.children(id) {
        if tree.is_composite(child) {
            parts.push(format!("({})", serialize_node(tree, child)));
        } else {
            parts.push(serialize_node(tree, child));
        }
    }
    parts.join(";")
}

/// Split off a leading `composite=<policy>` member; defaults to `sum`.
fn split_policy(text: &str) -> (&str, &str) {
    let clauses = split_top_level(text, ';');
    if let Some(first) = clauses.first() {
        if let Some(policy) = first.trim().strip_prefix("composite=") {
            let rest = &text[first.len()..];
            return (policy.trim(), rest.strip_prefix(';').unwrap_or(rest));
        }
    }
    ("sum", text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_round_trip() {
        let registry = ModelRegistry::with_builtins();
        let text = "name=Gaussian,height=2,centre=1,sigma=0.5";
        let tree = registry.tree_from_string(text).unwrap();

        assert_eq!(tree.n_params(), 3);
        assert_eq!(tree.get_parameter(0).unwrap(), 2.0);
        assert_eq!(tree.get_parameter(2).unwrap(), 0.5);
        assert_eq!(model_to_string(&tree), text);
    }

    #[test]
    fn test_composite_round_trip() {
        let registry = ModelRegistry::with_builtins();
        let text = "name=Gaussian,height=2,centre=1,sigma=0.5;name=Linear,intercept=0,slope=0.1";
        let tree = registry.tree_from_string(text).unwrap();

        assert!(tree.is_composite(tree.root()));
        assert_eq!(tree.n_params(), 5);
        assert_eq!(tree.parameter_index("f1.slope").unwrap(), 4);
        assert_eq!(model_to_string(&tree), text);
    }

    #[test]
    fn test_nested_product_round_trip() {
        let registry = ModelRegistry::with_builtins();
        let text = "name=Linear,intercept=1,slope=0;\
                    (composite=product;name=Gaussian,height=1,centre=0,sigma=1;name=Linear,intercept=0,slope=1)";
        let tree = registry.tree_from_string(text).unwrap();

        let inner = tree.children(tree.root())[1];
        assert_eq!(tree.policy_name(inner), Some("product"));
        assert_eq!(tree.parameter_index("f1.f0.sigma").unwrap(), 4);
        assert_eq!(model_to_string(&tree), text);
    }

    #[test]
    fn test_partial_params_keep_defaults() {
        let registry = ModelRegistry::with_builtins();
        let tree = registry.tree_from_string("name=Gaussian,sigma=3").unwrap();
        // height/centre stay at their defaults.
        assert_eq!(tree.get_parameter(0).unwrap(), 1.0);
        assert_eq!(tree.get_parameter(2).unwrap(), 3.0);
    }

    #[test]
    fn test_unknown_kind_and_param() {
        let registry = ModelRegistry::with_builtins();
        assert!(matches!(
            registry.tree_from_string("name=Lorentzian"),
            Err(FitError::UndefinedFunction(_))
        ));
        assert!(matches!(
            registry.tree_from_string("name=Gaussian,width=1"),
            Err(FitError::ParameterNotFound(_))
        ));
        assert!(matches!(
            registry.tree_from_string("height=1"),
            Err(FitError::ParseError(_))
        ));
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = ModelRegistry::with_builtins();
        registry.register("Peak", || Box::new(Gaussian::new(5.0, 0.0, 2.0)));
        let tree = registry.tree_from_string("name=Peak").unwrap();
        assert_eq!(tree.get_parameter(0).unwrap(), 5.0);
    }
}
