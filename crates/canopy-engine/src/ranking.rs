//! Ranking methods: turn a model group into a sampling order.

use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use canopy_types::CanopyError;

use crate::group::ModelGroup;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingMethod {
    /// Uniformly random order.
    Random,
    /// Highest priority first.
    Priority,
    /// Highest complexity first.
    Complexity,
    /// Highest priority first, ties broken by highest complexity.
    #[default]
    PriorityComplexity,
}

impl RankingMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Priority => "priority",
            Self::Complexity => "complexity",
            Self::PriorityComplexity => "priority_complexity",
        }
    }

    /// A permutation of `0..group.len()`, best model first.
    ///
    /// Reading priorities may refit models whose priority is due, which is
    /// why `rng` is needed for every method.
    pub fn rank<R: Rng + ?Sized>(&self, group: &ModelGroup, rng: &mut R) -> Vec<usize> {
        let mut order: Vec<usize> = (0..group.len()).collect();
        match self {
            Self::Random => order.shuffle(rng),
            Self::Priority => {
                let priorities = group.priorities_with(rng);
                order.sort_by(|&a, &b| priorities[b].total_cmp(&priorities[a]));
            }
            Self::Complexity => {
                let complexities = group.complexities();
                order.sort_by(|&a, &b| complexities[b].total_cmp(&complexities[a]));
            }
            Self::PriorityComplexity => {
                let priorities = group.priorities_with(rng);
                let complexities = group.complexities();
                order.sort_by(|&a, &b| {
                    priorities[b]
                        .total_cmp(&priorities[a])
                        .then_with(|| complexities[b].total_cmp(&complexities[a]))
                });
            }
        }
        order
    }
}

impl fmt::Display for RankingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RankingMethod {
    type Err = CanopyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "random" => Ok(Self::Random),
            "priority" => Ok(Self::Priority),
            "complexity" => Ok(Self::Complexity),
            "priority_complexity" => Ok(Self::PriorityComplexity),
            other => Err(CanopyError::Config(format!("unknown ranking method: {other}"))),
        }
    }
}
