//! Session configuration.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use canopy_optimizer::{ModelParameters, ModelStrategy};
use canopy_types::{config_error, CanopyResult};

use crate::ranking::RankingMethod;

pub const STORE_ENV: &str = "CANOPY_STORE";
pub const KEEP_PREVIOUS_ENV: &str = "CANOPY_KEEP_PREVIOUS";
pub const PRIORITY_FREQ_ENV: &str = "CANOPY_PRIORITY_FREQ";
pub const SEED_ENV: &str = "CANOPY_SEED";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub name: String,

    /// Tag of the model strategy every split model uses.
    pub model_strategy: String,

    pub update_complexity: bool,

    /// Results between priority refits; `<= 0` never refits.
    pub priority_update_freq: i64,

    pub ranking: RankingMethod,

    /// Checkpoint location. Without one, checkpointing is unavailable.
    pub store_path: Option<PathBuf>,

    /// Number of previous checkpoints kept on disk.
    pub keep_previous: usize,

    /// Checkpoint after this many registrations; 0 only checkpoints on
    /// request.
    pub checkpoint_every: usize,

    /// Seed for ranking and priority sampling.
    pub seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let parameters = ModelParameters::default();
        Self {
            name: "canopy".to_string(),
            model_strategy: ModelStrategy::default().tag().to_string(),
            update_complexity: parameters.update_complexity,
            priority_update_freq: parameters.priority_update_freq,
            ranking: RankingMethod::default(),
            store_path: None,
            keep_previous: 1,
            checkpoint_every: 0,
            seed: None,
        }
    }
}

impl SessionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_model_strategy(mut self, strategy: ModelStrategy) -> Self {
        self.model_strategy = strategy.tag().to_string();
        self
    }

    pub fn with_ranking(mut self, ranking: RankingMethod) -> Self {
        self.ranking = ranking;
        self
    }

    pub fn with_priority_update_freq(mut self, freq: i64) -> Self {
        self.priority_update_freq = freq;
        self
    }

    pub fn with_update_complexity(mut self, update: bool) -> Self {
        self.update_complexity = update;
        self
    }

    pub fn with_store(mut self, path: impl Into<PathBuf>, keep_previous: usize) -> Self {
        self.store_path = Some(path.into());
        self.keep_previous = keep_previous;
        self
    }

    pub fn with_checkpoint_every(mut self, n: usize) -> Self {
        self.checkpoint_every = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn model_parameters(&self) -> ModelParameters {
        ModelParameters {
            update_complexity: self.update_complexity,
            priority_update_freq: self.priority_update_freq,
        }
    }

    pub fn strategy(&self) -> CanopyResult<ModelStrategy> {
        Ok(ModelStrategy::from_tag(&self.model_strategy)?)
    }

    /// Defaults overlaid with the `CANOPY_*` environment variables.
    pub fn from_env() -> CanopyResult<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay settings found through `lookup` on this configuration.
    pub fn overlay<F>(mut self, lookup: F) -> CanopyResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(store) = lookup(STORE_ENV) {
            self.store_path = Some(PathBuf::from(store));
        }
        if let Some(keep) = lookup(KEEP_PREVIOUS_ENV) {
            self.keep_previous = parse_var(KEEP_PREVIOUS_ENV, &keep)?;
        }
        if let Some(freq) = lookup(PRIORITY_FREQ_ENV) {
            self.priority_update_freq = parse_var(PRIORITY_FREQ_ENV, &freq)?;
        }
        if let Some(seed) = lookup(SEED_ENV) {
            self.seed = Some(parse_var(SEED_ENV, &seed)?);
        }
        Ok(self)
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> CanopyResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| config_error!("{key} has an invalid value: {raw:?}"))
}
