//! A collection of shared model handles addressed by model id.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Map, Value};

use canopy_optimizer::{Model, SharedModel};
use canopy_types::{validation_error, CanopyResult, ModelError};

/// The models of one search, in split order.
#[derive(Debug, Default, Clone)]
pub struct ModelGroup {
    models: Vec<SharedModel>,
}

impl ModelGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_models(models: Vec<Model>) -> CanopyResult<Self> {
        let mut group = Self::new();
        for model in models {
            group.insert(model)?;
        }
        Ok(group)
    }

    /// Add a model; its id must not already be in the group.
    pub fn insert(&mut self, model: Model) -> CanopyResult<SharedModel> {
        if self.position(model.id()).is_some() {
            return Err(validation_error!("duplicate model id {}", model.id()));
        }
        let handle = Arc::new(Mutex::new(model));
        self.models.push(Arc::clone(&handle));
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn handles(&self) -> &[SharedModel] {
        &self.models
    }

    pub fn ids(&self) -> Vec<String> {
        self.models.iter().map(|m| m.lock().id().to_string()).collect()
    }

    pub fn position(&self, model_id: &str) -> Option<usize> {
        self.models.iter().position(|m| m.lock().id() == model_id)
    }

    pub fn get(&self, model_id: &str) -> Option<SharedModel> {
        self.position(model_id).map(|i| Arc::clone(&self.models[i]))
    }

    fn require(&self, model_id: &str) -> CanopyResult<SharedModel> {
        self.get(model_id).ok_or_else(|| {
            ModelError::ModelNotFound {
                model_id: model_id.to_string(),
            }
            .into()
        })
    }

    pub fn generate(&self, model_id: &str) -> CanopyResult<(String, Map<String, Value>)> {
        self.generate_with(model_id, &mut rand::thread_rng())
    }

    pub fn generate_with<R: Rng + ?Sized>(
        &self,
        model_id: &str,
        rng: &mut R,
    ) -> CanopyResult<(String, Map<String, Value>)> {
        self.require(model_id)?.lock().generate_with(rng)
    }

    pub fn register_result(
        &self,
        model_id: &str,
        result_id: &str,
        loss: Option<f64>,
        results: Option<Value>,
    ) -> CanopyResult<(u32, Option<Map<String, Value>>)> {
        self.require(model_id)?
            .lock()
            .register_result(result_id, loss, results)
    }

    /// Current priority of every model, refitting those that are due.
    pub fn priorities_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        self.models
            .iter()
            .map(|m| m.lock().priority_with(&mut *rng))
            .collect()
    }

    pub fn complexities(&self) -> Vec<f64> {
        self.models.iter().map(|m| m.lock().complexity()).collect()
    }

    /// Record each model's position in `order` as its rank.
    pub fn apply_ranking(&self, order: &[usize]) {
        for (rank, &index) in order.iter().enumerate() {
            if let Some(model) = self.models.get(index) {
                model.lock().set_rank(Some(rank));
            }
        }
    }

    pub fn to_json(&self) -> CanopyResult<Vec<Value>> {
        self.models.iter().map(|m| m.lock().to_json()).collect()
    }

    pub fn from_json(records: &[Value]) -> CanopyResult<Self> {
        let models = records
            .iter()
            .map(Model::from_json)
            .collect::<CanopyResult<Vec<_>>>()?;
        Self::from_models(models)
    }
}
