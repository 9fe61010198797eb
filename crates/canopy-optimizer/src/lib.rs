//! # canopy-optimizer
//!
//! Hyperparameter search-space decomposition and model bookkeeping for Canopy.
//!
//! A [`Scope`] tree describes a branching search space; [`Scope::split`]
//! flattens it into independent [`Model`]s. Each model samples its domains,
//! records the [`TrialResult`]s reported back for them, and scores itself by
//! complexity and by a Gaussian-process priority heuristic.

mod model;
mod priority;
mod scope;
mod strategy;
mod trial;

pub use model::{Model, ModelParameters, SharedModel};
pub use priority::{length_scale_sensitivity, RESAMPLE_ROUNDS};
pub use scope::{Scope, ScopeChild};
pub use strategy::ModelStrategy;
pub use trial::{nest_parameters, Link, TrialResult, TrialValue};
