//! Flat hyperparameter models and their evaluation history.

use std::cell::Cell;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use canopy_types::{CanopyResult, Domain, ModelError};

use crate::priority::length_scale_sensitivity;
use crate::strategy::ModelStrategy;
use crate::trial::{nest_parameters, TrialResult, TrialValue};

/// A model handle that lineage links and model groups can share.
pub type SharedModel = Arc<Mutex<Model>>;

/// Constructor parameters that travel with a serialized model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// Recompute complexity when domains are added.
    pub update_complexity: bool,
    /// Recompute priority every this many results; `<= 0` never recomputes.
    pub priority_update_freq: i64,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            update_complexity: true,
            priority_update_freq: 10,
        }
    }
}

/// Serialized form of a [`Model`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelRecord {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    domains: Vec<Domain>,
    results: Vec<TrialResult>,
    priority: f64,
    complexity: f64,
    #[serde(default)]
    priority_stale: bool,
    #[serde(default)]
    rank: Option<usize>,
    model_parameters: ModelParameters,
}

/// A flat set of domains plus the results observed when sampling them.
///
/// Domains are kept sorted by path so that feature vectors built from them
/// line up across copies and serialization round-trips.
///
/// `complexity` and `priority` are cached. Complexity is recomputed on read
/// after a domain was added (if `update_complexity` is set); priority is
/// recomputed on read once every `priority_update_freq` results.
#[derive(Debug)]
pub struct Model {
    id: String,
    strategy: ModelStrategy,
    domains: Vec<Domain>,
    results: Vec<TrialResult>,
    parameters: ModelParameters,
    complexity: Cell<f64>,
    complexity_stale: Cell<bool>,
    priority: f64,
    priority_stale: bool,
    rank: Option<usize>,
    parent: Option<Weak<Mutex<Model>>>,
}

impl Model {
    pub fn new(strategy: ModelStrategy) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            strategy,
            domains: Vec::new(),
            results: Vec::new(),
            parameters: ModelParameters::default(),
            complexity: Cell::new(1.0),
            complexity_stale: Cell::new(false),
            priority: 1.0,
            priority_stale: false,
            rank: None,
            parent: None,
        }
    }

    pub fn with_parameters(mut self, parameters: ModelParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_domains(mut self, domains: impl IntoIterator<Item = Domain>) -> Self {
        for domain in domains {
            self.add_domain(domain);
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn strategy(&self) -> ModelStrategy {
        self.strategy
    }

    pub fn parameters(&self) -> ModelParameters {
        self.parameters
    }

    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    pub fn results(&self) -> &[TrialResult] {
        &self.results
    }

    pub fn result(&self, result_id: &str) -> Option<&TrialResult> {
        self.results.iter().find(|r| r.id == result_id)
    }

    /// Number of domains.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn rank(&self) -> Option<usize> {
        self.rank
    }

    pub fn set_rank(&mut self, rank: Option<usize>) {
        self.rank = rank;
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Give this model a fresh identity.
    pub(crate) fn reassign_id(&mut self) {
        self.id = Uuid::new_v4().to_string();
    }

    pub fn add_domain(&mut self, domain: Domain) {
        self.domains.push(domain);
        self.domains.sort_by(|a, b| a.path.cmp(&b.path));
        self.complexity_stale.set(true);
    }

    /// Append the other model's domains to this one.
    ///
    /// Result histories are not merged: results observed under one branch
    /// of a decomposition say nothing about another.
    pub fn merge(&mut self, other: &Model) {
        if other.domains.is_empty() {
            return;
        }
        self.domains.extend(other.domains.iter().cloned());
        self.domains.sort_by(|a, b| a.path.cmp(&b.path));
        self.complexity_stale.set(true);
    }

    /// Copy of this model with the same id, domains, results, and
    /// parameters, unlinked from any lineage.
    pub fn copy(&self) -> Self {
        Self {
            id: self.id.clone(),
            strategy: self.strategy,
            domains: self.domains.clone(),
            results: self.results.clone(),
            parameters: self.parameters,
            complexity: Cell::new(self.complexity.get()),
            complexity_stale: Cell::new(self.complexity_stale.get()),
            priority: self.priority,
            priority_stale: self.priority_stale,
            rank: self.rank,
            parent: None,
        }
    }

    /// Copy of `parent` that forwards every result it records, and every
    /// outcome registered on it, to `parent`.
    ///
    /// The parent link is only ever set here, on a model that has just been
    /// created, so lineage cannot form a cycle.
    pub fn copy_inheriting(parent: &SharedModel) -> Self {
        let mut model = parent.lock().copy();
        model.parent = Some(Arc::downgrade(parent));
        model
    }

    fn live_parent(&self) -> Result<Option<SharedModel>, ModelError> {
        match &self.parent {
            None => Ok(None),
            Some(weak) => weak
                .upgrade()
                .map(Some)
                .ok_or_else(|| ModelError::ReferentUnavailable {
                    kind: "parent model",
                    id: self.id.clone(),
                }),
        }
    }

    /// Record a new result, forwarding it up the lineage.
    pub fn add_result(&mut self, mut result: TrialResult) -> CanopyResult<()> {
        let parent = self.live_parent()?;

        result.attach_model(&self.id);
        if let Some(parent) = &parent {
            parent.lock().add_result(result.clone())?;
        }
        self.results.push(result);

        if let Ok(freq) = usize::try_from(self.parameters.priority_update_freq) {
            if freq > 0 && self.results.len() % freq == 0 {
                self.priority_stale = true;
            }
        }
        Ok(())
    }

    /// Draw a new hyperparameterization using the thread-local generator.
    pub fn generate(&mut self) -> CanopyResult<(String, Map<String, Value>)> {
        self.generate_with(&mut rand::thread_rng())
    }

    /// Draw one value from every domain, record a pending result for them,
    /// and return its id with the values nested by domain path.
    pub fn generate_with<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
    ) -> CanopyResult<(String, Map<String, Value>)> {
        self.live_parent()?;
        let values = self.strategy.draw(&mut self.domains, rng)?;

        let mut result = TrialResult::new(&self.id);
        let result_id = result.id.clone();
        for (domain, value) in self.domains.iter().zip(&values) {
            result.add_value(TrialValue::new(value.clone(), domain, &result_id));
        }

        let params = nest_parameters(
            self.domains
                .iter()
                .map(|d| d.path.as_str())
                .zip(values),
        );

        self.add_result(result)?;
        debug!(model = %self.id, result = %result_id, "Generated hyperparameters");
        Ok((result_id, params))
    }

    /// Record the outcome of evaluating a generated result.
    ///
    /// Returns how many times this result has now been submitted, and, when
    /// `loss` is `None`, the parameters that were tried.
    pub fn register_result(
        &mut self,
        result_id: &str,
        loss: Option<f64>,
        results: Option<Value>,
    ) -> CanopyResult<(u32, Option<Map<String, Value>>)> {
        let index = self.result_index(result_id)?;
        let params = match loss {
            None => Some(self.results[index].parameters(&self.domains)?),
            Some(_) => None,
        };

        let submissions = self.record_outcome(result_id, loss, results)?;
        if loss.is_none() {
            warn!(model = %self.id, result = %result_id, "Evaluation reported no loss");
        }
        Ok((submissions, params))
    }

    fn result_index(&self, result_id: &str) -> Result<usize, ModelError> {
        self.results
            .iter()
            .position(|r| r.id == result_id)
            .ok_or_else(|| ModelError::ResultNotFound {
                result_id: result_id.to_string(),
            })
    }

    /// Update loss, results, and submission count here and on every
    /// ancestor. Ancestors may lack domains added after branching, so no
    /// parameters are rebuilt on the way up.
    fn record_outcome(
        &mut self,
        result_id: &str,
        loss: Option<f64>,
        results: Option<Value>,
    ) -> CanopyResult<u32> {
        let parent = self.live_parent()?;
        let index = self.result_index(result_id)?;
        if let Some(parent) = &parent {
            parent
                .lock()
                .record_outcome(result_id, loss, results.clone())?;
        }

        let result = &mut self.results[index];
        result.record_outcome(loss, results);
        Ok(result.submissions)
    }

    /// Product of all domain complexities.
    pub fn complexity(&self) -> f64 {
        if self.parameters.update_complexity && self.complexity_stale.get() {
            let product = self.domains.iter().map(Domain::complexity).product();
            self.complexity.set(product);
            self.complexity_stale.set(false);
        }
        self.complexity.get()
    }

    /// Whether the next [`Model::complexity`] read will recompute.
    pub fn is_complexity_stale(&self) -> bool {
        self.parameters.update_complexity && self.complexity_stale.get()
    }

    /// Current priority, refitting with the thread-local generator if due.
    pub fn priority(&mut self) -> f64 {
        self.priority_with(&mut rand::thread_rng())
    }

    /// Current priority, refitting with `rng` if due.
    pub fn priority_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> f64 {
        if self.is_priority_stale() {
            let rows = self.feature_matrix();
            self.priority = length_scale_sensitivity(&rows, rng);
            self.priority_stale = false;
            debug!(
                model = %self.id,
                rows = rows.len(),
                priority = self.priority,
                "Recomputed priority"
            );
        }
        self.priority
    }

    /// The last computed priority, without refitting.
    pub fn cached_priority(&self) -> f64 {
        self.priority
    }

    /// Whether the next [`Model::priority`] read will refit.
    pub fn is_priority_stale(&self) -> bool {
        self.parameters.priority_update_freq > 0 && self.priority_stale
    }

    /// One row per result with a finite loss: the numeric value for each
    /// domain, in domain order, followed by the loss. Results missing a
    /// value for some domain are left out.
    pub fn feature_matrix(&self) -> Vec<Vec<f64>> {
        let mut rows = Vec::with_capacity(self.results.len());
        'results: for result in &self.results {
            let Some(loss) = result.loss.filter(|l| l.is_finite()) else {
                continue;
            };
            let mut row = Vec::with_capacity(self.domains.len() + 1);
            for domain in &self.domains {
                let numeric = result
                    .values
                    .iter()
                    .find(|v| v.domain.id() == domain.id)
                    .map(|v| v.to_numeric(&self.domains));
                match numeric {
                    Some(Ok(x)) => row.push(x),
                    _ => {
                        debug!(result = %result.id, domain = %domain.path, "Skipping incomplete row");
                        continue 'results;
                    }
                }
            }
            row.push(loss);
            rows.push(row);
        }
        rows
    }

    pub fn to_json(&self) -> CanopyResult<Value> {
        let record = ModelRecord {
            kind: self.strategy.tag().to_string(),
            id: self.id.clone(),
            domains: self.domains.clone(),
            results: self.results.clone(),
            priority: self.priority,
            complexity: self.complexity(),
            priority_stale: self.priority_stale,
            rank: self.rank,
            model_parameters: self.parameters,
        };
        Ok(serde_json::to_value(record)?)
    }

    /// Rebuild a model from [`Model::to_json`] output. Every result is
    /// re-attached to the rebuilt model; nothing is returned on error.
    pub fn from_json(spec: &Value) -> CanopyResult<Self> {
        let record: ModelRecord = serde_json::from_value(spec.clone())?;
        let strategy = ModelStrategy::from_tag(&record.kind)?;

        for domain in &record.domains {
            domain.validate()?;
        }

        let mut results = record.results;
        for result in &mut results {
            result.attach_values(&record.domains)?;
            result.attach_model(&record.id);
        }

        let mut domains = record.domains;
        domains.sort_by(|a, b| a.path.cmp(&b.path));
        let complexity_stale = record.model_parameters.update_complexity && !domains.is_empty();

        Ok(Self {
            id: record.id,
            strategy,
            domains,
            results,
            parameters: record.model_parameters,
            complexity: Cell::new(record.complexity),
            complexity_stale: Cell::new(complexity_stale),
            priority: record.priority,
            priority_stale: record.priority_stale,
            rank: record.rank,
            parent: None,
        })
    }
}

/// Structural equality: the same number of domains, each with an equal
/// counterpart in the other model.
impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        self.domains.len() == other.domains.len()
            && self
                .domains
                .iter()
                .all(|d| other.domains.iter().any(|o| d == o))
    }
}
