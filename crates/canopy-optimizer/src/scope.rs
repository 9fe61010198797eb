//! Scope trees and their decomposition into flat models.

use std::fmt;

use serde_json::{Map, Value};
use tracing::{debug, info};

use canopy_types::{CanopyResult, Domain, DomainKind, ScopeError};

use crate::model::{Model, ModelParameters};
use crate::strategy::ModelStrategy;

/// Reserved keys in a scope description.
const EXCLUSIVE_KEY: &str = "exclusive";
const OPTIONAL_KEY: &str = "optional";
const MODEL_KEY: &str = "model";

/// One named entry of a [`Scope`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeChild {
    Scope(Scope),
    Domain(Domain),
    /// A constant, treated as a single-valued discrete domain.
    Fixed(Value),
}

impl From<Scope> for ScopeChild {
    fn from(scope: Scope) -> Self {
        Self::Scope(scope)
    }
}

impl From<Domain> for ScopeChild {
    fn from(domain: Domain) -> Self {
        Self::Domain(domain)
    }
}

impl From<Value> for ScopeChild {
    fn from(value: Value) -> Self {
        Self::Fixed(value)
    }
}

impl fmt::Display for ScopeChild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scope(scope) => write!(f, "{scope}"),
            Self::Domain(domain) => write!(f, "{domain}"),
            Self::Fixed(value) => write!(f, "{value}"),
        }
    }
}

/// A node of a hyperparameter search space.
///
/// Children of a plain scope are combined: every model it produces holds a
/// domain from each child. Children of an `exclusive` scope are
/// alternatives: each produces its own models. An `optional` scope adds one
/// more, empty, alternative.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    children: Vec<(String, ScopeChild)>,
    exclusive: bool,
    optional: bool,
    model_strategy: ModelStrategy,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn with_model_strategy(mut self, strategy: ModelStrategy) -> Self {
        self.set_model_strategy(strategy);
        self
    }

    /// Builder form of [`Scope::add_child`].
    pub fn with_child(
        mut self,
        name: impl Into<String>,
        child: impl Into<ScopeChild>,
    ) -> CanopyResult<Self> {
        self.add_child(name, child)?;
        Ok(self)
    }

    /// Add a named child. A name already in use is rejected and the scope
    /// is left as it was.
    pub fn add_child(
        &mut self,
        name: impl Into<String>,
        child: impl Into<ScopeChild>,
    ) -> CanopyResult<()> {
        let name = name.into();
        let mut child = child.into();
        if let Some(existing) = self.get(&name) {
            return Err(ScopeError::DuplicateChild {
                existing: existing.to_string(),
                duplicate: child.to_string(),
                name,
            }
            .into());
        }
        if let ScopeChild::Scope(scope) = &mut child {
            scope.set_model_strategy(self.model_strategy);
        }
        self.children.push((name, child));
        Ok(())
    }

    /// Add every child of `other`. Fails without changing this scope if any
    /// name is already in use.
    pub fn merge(&mut self, other: Scope) -> CanopyResult<()> {
        for (name, child) in &other.children {
            if let Some(existing) = self.get(name) {
                return Err(ScopeError::DuplicateChild {
                    name: name.clone(),
                    existing: existing.to_string(),
                    duplicate: child.to_string(),
                }
                .into());
            }
        }
        for (name, child) in other.children {
            self.add_child(name, child)?;
        }
        Ok(())
    }

    /// Set the strategy for this scope and every scope below it.
    pub fn set_model_strategy(&mut self, strategy: ModelStrategy) {
        self.model_strategy = strategy;
        for (_, child) in &mut self.children {
            if let ScopeChild::Scope(scope) = child {
                scope.set_model_strategy(strategy);
            }
        }
    }

    pub fn model_strategy(&self) -> ModelStrategy {
        self.model_strategy
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&ScopeChild> {
        self.children
            .iter()
            .find(|(child_name, _)| child_name == name)
            .map(|(_, child)| child)
    }

    /// Children in insertion order.
    pub fn children(&self) -> impl Iterator<Item = (&str, &ScopeChild)> {
        self.children.iter().map(|(name, child)| (name.as_str(), child))
    }

    /// Flatten this scope into models with default parameters.
    pub fn split(&self) -> Vec<Model> {
        self.split_with(ModelParameters::default())
    }

    /// Flatten this scope into one model per combination of exclusive
    /// branches. Every domain in the result is a copy of the one in the
    /// tree, stamped with its slash-delimited path; the tree is untouched.
    pub fn split_with(&self, parameters: ModelParameters) -> Vec<Model> {
        let models = self.split_at("", parameters);
        info!(
            models = models.len(),
            strategy = %self.model_strategy,
            "Split scope into models"
        );
        models
    }

    fn new_model(&self, parameters: ModelParameters) -> Model {
        Model::new(self.model_strategy).with_parameters(parameters)
    }

    fn split_at(&self, path: &str, parameters: ModelParameters) -> Vec<Model> {
        let mut models = if self.exclusive {
            Vec::new()
        } else {
            vec![self.new_model(parameters)]
        };

        for (name, child) in &self.children {
            let child_path = format!("{path}/{name}");
            match child {
                ScopeChild::Scope(scope) => {
                    let submodels = scope.split_at(&child_path, parameters);
                    if self.exclusive {
                        models.extend(submodels);
                    } else {
                        let mut product = Vec::with_capacity(models.len() * submodels.len());
                        for model in &models {
                            for submodel in &submodels {
                                let mut branch = model.copy();
                                branch.reassign_id();
                                branch.merge(submodel);
                                product.push(branch);
                            }
                        }
                        models = product;
                    }
                }
                ScopeChild::Domain(domain) => {
                    let domain = domain.clone().with_new_id().with_path(child_path);
                    models = self.add_leaf(models, domain, parameters);
                }
                ScopeChild::Fixed(value) => {
                    let domain = Domain::fixed(value.clone()).with_path(child_path);
                    models = self.add_leaf(models, domain, parameters);
                }
            }
        }

        if self.optional {
            models.push(self.new_model(parameters));
        }

        debug!(path = %path, models = models.len(), "Split scope level");
        models
    }

    /// A leaf is a new branch of an exclusive scope, or joins every branch
    /// built so far otherwise.
    fn add_leaf(
        &self,
        mut models: Vec<Model>,
        domain: Domain,
        parameters: ModelParameters,
    ) -> Vec<Model> {
        if self.exclusive || models.is_empty() {
            models.push(self.new_model(parameters).with_domains([domain]));
        } else {
            for model in &mut models {
                model.add_domain(domain.clone());
            }
        }
        models
    }

    /// Build a scope tree from a JSON description.
    ///
    /// `exclusive` and `optional` set the flags and `model` names the model
    /// strategy for the whole tree. An object whose `type` names a domain
    /// variant becomes a domain, any other object a nested scope, and any
    /// other value a fixed child.
    pub fn from_json(spec: &Value) -> CanopyResult<Self> {
        let mut scope = Self::from_json_at(spec, "")?;
        scope.set_model_strategy(scope.model_strategy);
        Ok(scope)
    }

    fn from_json_at(spec: &Value, path: &str) -> CanopyResult<Self> {
        let invalid = |message: String| ScopeError::InvalidDefinition {
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            message,
        };
        let Value::Object(entries) = spec else {
            return Err(invalid(format!("expected an object, got {spec}")).into());
        };

        let mut scope = Self::new();
        for (key, value) in entries {
            match key.as_str() {
                EXCLUSIVE_KEY => {
                    scope.exclusive = value
                        .as_bool()
                        .ok_or_else(|| invalid(format!("'{key}' must be a boolean")))?;
                }
                OPTIONAL_KEY => {
                    scope.optional = value
                        .as_bool()
                        .ok_or_else(|| invalid(format!("'{key}' must be a boolean")))?;
                }
                MODEL_KEY => {
                    let tag = value
                        .as_str()
                        .ok_or_else(|| invalid(format!("'{key}' must be a strategy tag")))?;
                    scope.model_strategy = ModelStrategy::from_tag(tag)?;
                }
                _ => {
                    let child_path = format!("{path}/{key}");
                    let child = match value {
                        Value::Object(object) if is_domain_spec(object) => {
                            ScopeChild::Domain(Domain::from_json(value)?)
                        }
                        Value::Object(_) => {
                            ScopeChild::Scope(Self::from_json_at(value, &child_path)?)
                        }
                        other => ScopeChild::Fixed(other.clone()),
                    };
                    scope.add_child(key.as_str(), child)?;
                }
            }
        }
        Ok(scope)
    }
}

fn is_domain_spec(object: &Map<String, Value>) -> bool {
    object
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(DomainKind::is_type_tag)
}

/// Two scopes are equal when they split into the same models, in any order.
impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        let ours = self.split_at("", ModelParameters::default());
        let mut theirs = other.split_at("", ModelParameters::default());
        if ours.len() != theirs.len() {
            return false;
        }
        for model in &ours {
            match theirs.iter().position(|candidate| candidate == model) {
                Some(index) => {
                    theirs.swap_remove(index);
                }
                None => return false,
            }
        }
        true
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.children.iter().map(|(name, _)| name.as_str()).collect();
        write!(
            f,
            "Scope(exclusive={}, optional={}, children=[{}])",
            self.exclusive,
            self.optional,
            names.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paths(model: &Model) -> Vec<&str> {
        model.domains().iter().map(|d| d.path.as_str()).collect()
    }

    fn sorted_paths(models: &[Model]) -> Vec<Vec<&str>> {
        let mut all: Vec<Vec<&str>> = models.iter().map(paths).collect();
        all.sort();
        all
    }

    #[test]
    fn empty_scope_yields_one_empty_model() {
        let models = Scope::new().split();
        assert_eq!(models.len(), 1);
        assert!(models[0].is_empty());
    }

    #[test]
    fn empty_exclusive_scope_yields_nothing() {
        assert!(Scope::new().exclusive(true).split().is_empty());
    }

    #[test]
    fn exclusive_scope_branches_per_child() {
        let scope = Scope::new()
            .exclusive(true)
            .with_child("a", json!(1))
            .unwrap()
            .with_child("b", json!(2))
            .unwrap();
        let models = scope.split();
        assert_eq!(models.len(), 2);
        assert_eq!(sorted_paths(&models), vec![vec!["/a"], vec!["/b"]]);
    }

    #[test]
    fn plain_scope_combines_children() {
        let scope = Scope::new()
            .with_child("b", json!(2))
            .unwrap()
            .with_child("a", Domain::uniform(0.0, 1.0).unwrap())
            .unwrap();
        let models = scope.split();
        assert_eq!(models.len(), 1);
        assert_eq!(paths(&models[0]), vec!["/a", "/b"]);
    }

    #[test]
    fn optional_scope_adds_empty_branch() {
        let scope = Scope::new().optional(true).with_child("a", json!(1)).unwrap();
        let models = scope.split();
        assert_eq!(models.len(), 2);
        assert_eq!(sorted_paths(&models), vec![vec![], vec!["/a"]]);
    }

    #[test]
    fn nested_exclusive_scopes_form_cross_product() {
        let optimizer = Scope::new()
            .exclusive(true)
            .with_child("sgd", Scope::new().with_child("lr", json!(0.1)).unwrap())
            .unwrap()
            .with_child("adam", Scope::new().with_child("beta", json!(0.9)).unwrap())
            .unwrap();
        let activation = Scope::new()
            .exclusive(true)
            .with_child("relu", json!("relu"))
            .unwrap()
            .with_child("tanh", json!("tanh"))
            .unwrap();
        let root = Scope::new()
            .with_child("layers", json!(3))
            .unwrap()
            .with_child("optimizer", optimizer)
            .unwrap()
            .with_child("activation", activation)
            .unwrap();

        let models = root.split();
        assert_eq!(models.len(), 4);
        assert_eq!(
            sorted_paths(&models),
            vec![
                vec!["/activation/relu", "/layers", "/optimizer/adam/beta"],
                vec!["/activation/relu", "/layers", "/optimizer/sgd/lr"],
                vec!["/activation/tanh", "/layers", "/optimizer/adam/beta"],
                vec!["/activation/tanh", "/layers", "/optimizer/sgd/lr"],
            ]
        );

        let mut ids: Vec<&str> = models.iter().map(Model::id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn optional_subscope_can_be_omitted() {
        let root = Scope::new()
            .with_child("x", json!(1))
            .unwrap()
            .with_child(
                "dropout",
                Scope::new().optional(true).with_child("rate", json!(0.5)).unwrap(),
            )
            .unwrap();
        let models = root.split();
        assert_eq!(
            sorted_paths(&models),
            vec![vec!["/dropout/rate", "/x"], vec!["/x"]]
        );
    }

    #[test]
    fn split_leaves_tree_domains_untouched() {
        let domain = Domain::discrete(vec![json!(1), json!(2)]).unwrap();
        let original_id = domain.id.clone();
        let scope = Scope::new().with_child("d", domain).unwrap();

        let models = scope.split();
        match scope.get("d") {
            Some(ScopeChild::Domain(d)) => {
                assert_eq!(d.path, "");
                assert_eq!(d.id, original_id);
            }
            other => panic!("unexpected child {other:?}"),
        }
        assert_eq!(models[0].domains()[0].path, "/d");
        assert_ne!(models[0].domains()[0].id, original_id);
    }

    #[test]
    fn split_carries_model_parameters() {
        let params = ModelParameters {
            update_complexity: false,
            priority_update_freq: 3,
        };
        let scope = Scope::new().with_child("a", json!(1)).unwrap();
        for model in scope.split_with(params) {
            assert_eq!(model.parameters(), params);
        }
    }

    #[test]
    fn duplicate_child_is_rejected_without_change() {
        let mut scope = Scope::new().with_child("lr", json!(1)).unwrap();
        let err = scope.add_child("lr", json!(2)).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("lr:1"));
        assert!(message.contains("lr:2"));
        assert_eq!(scope.len(), 1);
        assert_eq!(scope.get("lr"), Some(&ScopeChild::Fixed(json!(1))));
    }

    #[test]
    fn merge_is_all_or_nothing() {
        let mut scope = Scope::new().with_child("a", json!(1)).unwrap();
        let other = Scope::new()
            .with_child("b", json!(2))
            .unwrap()
            .with_child("a", json!(3))
            .unwrap();
        assert!(scope.merge(other).is_err());
        assert_eq!(scope.len(), 1);
        assert!(!scope.contains("b"));

        let other = Scope::new().with_child("c", json!(4)).unwrap();
        scope.merge(other).unwrap();
        assert_eq!(scope.len(), 2);
        assert!(scope.contains("c"));
    }

    #[test]
    fn structural_equality_ignores_child_order() {
        let a = Scope::new()
            .with_child("x", json!(1))
            .unwrap()
            .with_child("y", json!(2))
            .unwrap();
        let b = Scope::new()
            .with_child("y", json!(2))
            .unwrap()
            .with_child("x", json!(1))
            .unwrap();
        assert_eq!(a, b);

        let c = Scope::new().exclusive(true);
        assert_ne!(a, c);
    }

    #[test]
    fn from_json_builds_tree() {
        let spec = json!({
            "model": "random",
            "batch_size": 32,
            "lr": {"type": "ContinuousDomain", "distribution": "loguniform", "args": [1e-4, 1e-1]},
            "optimizer": {
                "exclusive": true,
                "sgd": {"momentum": {"type": "DiscreteDomain", "domain": [0.0, 0.9]}},
                "adam": {"amsgrad": true}
            }
        });
        let scope = Scope::from_json(&spec).unwrap();
        assert_eq!(scope.len(), 3);
        assert_eq!(scope.get("batch_size"), Some(&ScopeChild::Fixed(json!(32))));
        assert!(matches!(scope.get("lr"), Some(ScopeChild::Domain(_))));
        match scope.get("optimizer") {
            Some(ScopeChild::Scope(inner)) => {
                assert!(inner.is_exclusive());
                assert_eq!(inner.len(), 2);
            }
            other => panic!("unexpected child {other:?}"),
        }

        let models = scope.split();
        assert_eq!(
            sorted_paths(&models),
            vec![
                vec!["/batch_size", "/lr", "/optimizer/adam/amsgrad"],
                vec!["/batch_size", "/lr", "/optimizer/sgd/momentum"],
            ]
        );
    }

    #[test]
    fn from_json_keeps_document_order() {
        let spec: Value =
            serde_json::from_str(r#"{"zeta": 1, "exclusive": false, "alpha": 2, "mid": {"b": 3, "a": 4}}"#)
                .unwrap();
        let scope = Scope::from_json(&spec).unwrap();
        let names: Vec<&str> = scope.children().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        match scope.get("mid") {
            Some(ScopeChild::Scope(mid)) => {
                let names: Vec<&str> = mid.children().map(|(name, _)| name).collect();
                assert_eq!(names, vec!["b", "a"]);
            }
            other => panic!("unexpected child {other:?}"),
        }
    }

    #[test]
    fn from_json_rejects_bad_input() {
        assert!(Scope::from_json(&json!([1, 2])).is_err());
        assert!(Scope::from_json(&json!({"exclusive": "yes"})).is_err());
        assert!(Scope::from_json(&json!({"model": "tpe"})).is_err());
        assert!(Scope::from_json(&json!({"x": {"type": "DiscreteDomain", "domain": []}})).is_err());
    }

    #[test]
    fn strategy_cascades_to_children() {
        let inner = Scope::new().with_child("a", json!(1)).unwrap();
        let scope = Scope::new()
            .with_child("inner", inner)
            .unwrap()
            .with_model_strategy(ModelStrategy::Random);
        match scope.get("inner") {
            Some(ScopeChild::Scope(s)) => assert_eq!(s.model_strategy(), ModelStrategy::Random),
            other => panic!("unexpected child {other:?}"),
        }
        assert!(scope
            .split()
            .iter()
            .all(|m| m.strategy() == ModelStrategy::Random));
    }
}
