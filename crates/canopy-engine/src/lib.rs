//! # canopy-engine
//!
//! Search orchestration for Canopy: session configuration, model groups,
//! ranking, and the dispatcher that hands out hyperparameterizations and
//! collects their outcomes.

pub mod config;
pub mod group;
pub mod ranking;
pub mod session;

pub use config::SessionConfig;
pub use group::ModelGroup;
pub use ranking::RankingMethod;
pub use session::{SearchSession, SessionState, SessionStatus, Suggestion};
