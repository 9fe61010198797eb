//! Model-generation strategies and the tag registry used to look them up.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use canopy_types::{CanopyResult, Domain, ModelError};

/// How a model draws new hyperparameterizations from its domains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStrategy {
    /// Independent draws from every domain.
    #[default]
    Random,
}

impl ModelStrategy {
    /// All registered strategies.
    pub const ALL: [ModelStrategy; 1] = [ModelStrategy::Random];

    /// Look up a strategy by its type tag.
    pub fn from_tag(tag: &str) -> Result<Self, ModelError> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.tag() == tag)
            .ok_or_else(|| ModelError::UnknownStrategy {
                tag: tag.to_string(),
            })
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Random => "random",
        }
    }

    /// Draw one value per domain, in the order given.
    pub fn draw<R: Rng + ?Sized>(
        &self,
        domains: &mut [Domain],
        rng: &mut R,
    ) -> CanopyResult<Vec<Value>> {
        match self {
            Self::Random => domains.iter_mut().map(|d| d.generate(&mut *rng)).collect(),
        }
    }
}

impl fmt::Display for ModelStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ModelStrategy {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_tag(s)
    }
}
