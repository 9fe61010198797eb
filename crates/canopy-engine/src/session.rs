//! The in-process search dispatcher.

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use canopy_data::JsonStorage;
use canopy_optimizer::{Model, Scope};
use canopy_types::{config_error, validation_error, CanopyResult};

use crate::config::SessionConfig;
use crate::group::ModelGroup;

/// Lifecycle state of a search session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Pending,
    Running,
}

/// Aggregate counters for a search session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub models: usize,
    pub generated: usize,
    pub registered: usize,
    /// Registrations without a finite loss.
    pub failed: usize,
    pub best_loss: Option<f64>,
    pub best_model: Option<String>,
    pub best_result: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_checkpoint: Option<DateTime<Utc>>,
}

impl SessionStatus {
    pub fn new(models: usize) -> Self {
        Self {
            state: SessionState::Pending,
            models,
            generated: 0,
            registered: 0,
            failed: 0,
            best_loss: None,
            best_model: None,
            best_result: None,
            started_at: None,
            last_checkpoint: None,
        }
    }

    pub fn mark_running(&mut self) {
        if self.state == SessionState::Pending {
            self.state = SessionState::Running;
            self.started_at = Some(Utc::now());
        }
    }

    /// Returns `true` when `loss` is a new best.
    pub fn record_registration(
        &mut self,
        model_id: &str,
        result_id: &str,
        loss: Option<f64>,
    ) -> bool {
        self.registered += 1;
        let Some(loss) = loss.filter(|l| l.is_finite()) else {
            self.failed += 1;
            return false;
        };
        if self.best_loss.map_or(true, |best| loss < best) {
            self.best_loss = Some(loss);
            self.best_model = Some(model_id.to_string());
            self.best_result = Some(result_id.to_string());
            true
        } else {
            false
        }
    }
}

/// A hyperparameterization to evaluate, and where to report its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub model_id: String,
    pub result_id: String,
    pub params: Map<String, Value>,
}

/// Drives one search over a model group.
///
/// Every generate and register call goes through `&mut self`, so one session
/// is the single writer for all of its models.
#[derive(Debug)]
pub struct SearchSession {
    config: SessionConfig,
    group: ModelGroup,
    status: SessionStatus,
    storage: Option<JsonStorage>,
    rng: ChaCha8Rng,
    since_checkpoint: usize,
}

impl SearchSession {
    /// Split `scope` with the configured strategy and model parameters.
    pub fn new(config: SessionConfig, scope: &Scope) -> CanopyResult<Self> {
        let mut scope = scope.clone();
        scope.set_model_strategy(config.strategy()?);
        let models = scope.split_with(config.model_parameters());
        Self::from_models(config, models)
    }

    pub fn from_models(config: SessionConfig, models: Vec<Model>) -> CanopyResult<Self> {
        let storage = match &config.store_path {
            Some(path) => Some(JsonStorage::new(path, config.keep_previous)?),
            None => None,
        };
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let group = ModelGroup::from_models(models)?;
        info!(
            "Session '{}' tracking {} models (ranking: {})",
            config.name,
            group.len(),
            config.ranking
        );

        Ok(Self {
            status: SessionStatus::new(group.len()),
            config,
            group,
            storage,
            rng,
            since_checkpoint: 0,
        })
    }

    /// Rebuild a session from the configured store's latest checkpoint.
    pub async fn resume(config: SessionConfig) -> CanopyResult<Self> {
        let path = config
            .store_path
            .clone()
            .ok_or_else(|| config_error!("resuming a session requires a store path"))?;
        let models = JsonStorage::new(&path, config.keep_previous)?.load().await?;
        let mut session = Self::from_models(config, models)?;
        for handle in session.group.handles() {
            let model = handle.lock();
            session.status.generated += model.results().len();
            for result in model.results().iter().filter(|r| r.submissions > 0) {
                session
                    .status
                    .record_registration(model.id(), &result.id, result.loss);
            }
        }
        info!(
            registered = session.status.registered,
            failed = session.status.failed,
            best_loss = ?session.status.best_loss,
            "Resumed session '{}'",
            session.config.name
        );
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn group(&self) -> &ModelGroup {
        &self.group
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Rank the models with the configured method and record their ranks.
    pub fn rank(&mut self) -> Vec<usize> {
        let order = self.config.ranking.rank(&self.group, &mut self.rng);
        self.group.apply_ranking(&order);
        order
    }

    /// Generate a hyperparameterization from the top-ranked model.
    pub fn suggest(&mut self) -> CanopyResult<Suggestion> {
        let order = self.rank();
        let index = *order.first().ok_or_else(|| {
            validation_error!("session '{}' has no models to sample", self.config.name)
        })?;
        let model_id = self.group.handles()[index].lock().id().to_string();

        let (result_id, params) = self.group.generate_with(&model_id, &mut self.rng)?;
        self.status.mark_running();
        self.status.generated += 1;
        debug!(model = %model_id, result = %result_id, "Dispatched suggestion");

        Ok(Suggestion {
            model_id,
            result_id,
            params,
        })
    }

    /// Register the outcome of a suggestion. Returns how many times that
    /// result has been reported.
    pub async fn report(
        &mut self,
        model_id: &str,
        result_id: &str,
        loss: Option<f64>,
        results: Option<Value>,
    ) -> CanopyResult<u32> {
        let (submissions, _) = self
            .group
            .register_result(model_id, result_id, loss, results)?;
        if self.status.record_registration(model_id, result_id, loss) {
            info!(model = %model_id, result = %result_id, loss = ?loss, "New best loss");
        }

        self.since_checkpoint += 1;
        let every = self.config.checkpoint_every;
        if every > 0 && self.since_checkpoint >= every {
            self.checkpoint().await?;
        }
        Ok(submissions)
    }

    /// Save every model to the configured store.
    pub async fn checkpoint(&mut self) -> CanopyResult<()> {
        let storage = self.storage.as_ref().ok_or_else(|| {
            config_error!("no store path configured for session '{}'", self.config.name)
        })?;
        let records = self.group.to_json()?;
        storage.save_records(records).await?;
        self.since_checkpoint = 0;
        self.status.last_checkpoint = Some(Utc::now());
        Ok(())
    }
}
