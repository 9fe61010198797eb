//! Hyperparameter domains: the value generators a model samples from.
//!
//! A [`Domain`] is opaque to the decomposition and ranking code. All it has
//! to do is produce a value, map a value back to a number, report a
//! complexity score, and round-trip through JSON.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{CanopyResult, DomainError};

/// Half-width of the central 99% interval of a standard normal.
const NORMAL_Z_99: f64 = 2.575_829_303_548_901;

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

/// Continuous probability distributions a [`Domain`] can draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    /// Uniform on `[loc, loc + scale)`.
    Uniform,
    /// Gaussian with mean `loc` and standard deviation `scale`.
    #[serde(alias = "norm")]
    Normal,
    /// Log-uniform on `[a, b)`, `0 < a < b`.
    #[serde(alias = "reciprocal")]
    LogUniform,
}

impl Distribution {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uniform => "uniform",
            Self::Normal => "normal",
            Self::LogUniform => "loguniform",
        }
    }

    /// Names of the positional arguments, in order.
    fn arg_names(&self) -> [&'static str; 2] {
        match self {
            Self::Uniform | Self::Normal => ["loc", "scale"],
            Self::LogUniform => ["a", "b"],
        }
    }

    fn default_arg(&self, name: &str) -> Option<f64> {
        match (self, name) {
            (Self::Uniform | Self::Normal, "loc") => Some(0.0),
            (Self::Uniform | Self::Normal, "scale") => Some(1.0),
            _ => None,
        }
    }
}

/// Resolved distribution parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Params {
    first: f64,
    second: f64,
}

/// The variant-specific part of a [`Domain`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainKind {
    /// Values drawn from a continuous distribution.
    #[serde(rename = "ContinuousDomain")]
    Continuous {
        distribution: Distribution,
        #[serde(default)]
        args: Vec<f64>,
        #[serde(default)]
        kws: BTreeMap<String, f64>,
    },
    /// Values drawn with replacement from a finite set.
    #[serde(rename = "DiscreteDomain")]
    Discrete { domain: Vec<Value> },
    /// Values drawn round-robin, without replacement, from a finite set.
    #[serde(rename = "ExhaustiveDomain")]
    Exhaustive {
        domain: Vec<Value>,
        #[serde(default)]
        idx: usize,
    },
}

impl DomainKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Continuous { .. } => "ContinuousDomain",
            Self::Discrete { .. } => "DiscreteDomain",
            Self::Exhaustive { .. } => "ExhaustiveDomain",
        }
    }

    /// Whether a JSON `type` tag names a domain variant.
    pub fn is_type_tag(tag: &str) -> bool {
        matches!(tag, "ContinuousDomain" | "DiscreteDomain" | "ExhaustiveDomain")
    }
}

/// A single hyperparameter domain.
///
/// `path` locates the domain in the flattened hyperparameter namespace
/// (`/optimizer/lr`) and is assigned when a scope is split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    #[serde(default = "fresh_id")]
    pub id: String,
    #[serde(default)]
    pub path: String,
    #[serde(flatten)]
    pub kind: DomainKind,
}

impl Domain {
    /// A continuous domain. `args` are positional distribution parameters,
    /// `kws` named ones (`loc`/`scale` or `a`/`b`); named parameters win.
    pub fn continuous(
        distribution: Distribution,
        args: Vec<f64>,
        kws: BTreeMap<String, f64>,
    ) -> CanopyResult<Self> {
        let domain = Self::from_kind(DomainKind::Continuous {
            distribution,
            args,
            kws,
        });
        domain.validate()?;
        Ok(domain)
    }

    pub fn uniform(low: f64, high: f64) -> CanopyResult<Self> {
        Self::continuous(Distribution::Uniform, vec![low, high - low], BTreeMap::new())
    }

    pub fn normal(mean: f64, std_dev: f64) -> CanopyResult<Self> {
        Self::continuous(Distribution::Normal, vec![mean, std_dev], BTreeMap::new())
    }

    pub fn log_uniform(low: f64, high: f64) -> CanopyResult<Self> {
        Self::continuous(Distribution::LogUniform, vec![low, high], BTreeMap::new())
    }

    pub fn discrete(values: Vec<Value>) -> CanopyResult<Self> {
        let domain = Self::from_kind(DomainKind::Discrete { domain: values });
        domain.validate()?;
        Ok(domain)
    }

    pub fn exhaustive(values: Vec<Value>) -> CanopyResult<Self> {
        let domain = Self::from_kind(DomainKind::Exhaustive {
            domain: values,
            idx: 0,
        });
        domain.validate()?;
        Ok(domain)
    }

    /// A single-valued discrete domain standing in for a constant.
    pub fn fixed(value: Value) -> Self {
        Self::from_kind(DomainKind::Discrete {
            domain: vec![value],
        })
    }

    fn from_kind(kind: DomainKind) -> Self {
        Self {
            id: fresh_id(),
            path: String::new(),
            kind,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Same definition under a new identity.
    pub fn with_new_id(mut self) -> Self {
        self.id = fresh_id();
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Check the variant-specific invariants.
    pub fn validate(&self) -> CanopyResult<()> {
        match &self.kind {
            DomainKind::Continuous { .. } => {
                self.params()?;
            }
            DomainKind::Discrete { domain } | DomainKind::Exhaustive { domain, .. } => {
                if domain.is_empty() {
                    return Err(DomainError::Empty {
                        path: self.path.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn params(&self) -> Result<Params, DomainError> {
        match &self.kind {
            DomainKind::Continuous {
                distribution,
                args,
                kws,
            } => resolve_params(*distribution, args, kws),
            _ => Err(DomainError::InvalidDistribution {
                distribution: self.type_name().to_string(),
                message: "not a continuous domain".to_string(),
            }),
        }
    }

    /// Draw one value. Exhaustive domains advance their cursor.
    pub fn generate<R: Rng + ?Sized>(&mut self, rng: &mut R) -> CanopyResult<Value> {
        let value = match &mut self.kind {
            DomainKind::Continuous {
                distribution,
                args,
                kws,
            } => {
                let Params { first, second } = resolve_params(*distribution, args, kws)?;
                let u: f64 = rng.gen();
                let x = match distribution {
                    Distribution::Uniform => first + second * u,
                    Distribution::Normal => {
                        // Box-Muller; 1 - u keeps the log argument in (0, 1].
                        let v: f64 = rng.gen();
                        let z = (-2.0 * (1.0 - u).ln()).sqrt() * (2.0 * PI * v).cos();
                        first + second * z
                    }
                    Distribution::LogUniform => {
                        let (ln_a, ln_b) = (first.ln(), second.ln());
                        (ln_a + u * (ln_b - ln_a)).exp()
                    }
                };
                Value::from(x)
            }
            DomainKind::Discrete { domain } => {
                if domain.is_empty() {
                    return Err(DomainError::Empty {
                        path: self.path.clone(),
                    }
                    .into());
                }
                domain[rng.gen_range(0..domain.len())].clone()
            }
            DomainKind::Exhaustive { domain, idx } => {
                if domain.is_empty() {
                    return Err(DomainError::Empty {
                        path: self.path.clone(),
                    }
                    .into());
                }
                let value = domain[*idx % domain.len()].clone();
                *idx = (*idx + 1) % domain.len();
                value
            }
        };
        Ok(value)
    }

    /// Map a generated value to a number usable as a regression feature.
    pub fn map_to_index(&self, value: &Value) -> Result<f64, DomainError> {
        let not_found = || DomainError::ValueNotInDomain {
            value: value.to_string(),
            path: self.path.clone(),
        };
        match &self.kind {
            DomainKind::Continuous { .. } => value.as_f64().ok_or_else(not_found),
            DomainKind::Discrete { domain } | DomainKind::Exhaustive { domain, .. } => domain
                .iter()
                .position(|candidate| candidate == value)
                .map(|i| i as f64)
                .ok_or_else(not_found),
        }
    }

    /// Size/uncertainty score. Continuous domains score `2 + w` where `w`
    /// is the width of the central 99% interval; finite sets score
    /// `2 - 1/n`, so a constant contributes 1 to a product.
    pub fn complexity(&self) -> f64 {
        match &self.kind {
            DomainKind::Continuous { distribution, .. } => match self.params() {
                Ok(Params { first, second }) => {
                    let width = match distribution {
                        Distribution::Uniform => second,
                        Distribution::Normal => 2.0 * NORMAL_Z_99 * second,
                        Distribution::LogUniform => second - first,
                    };
                    2.0 + width.abs()
                }
                Err(_) => 2.0,
            },
            DomainKind::Discrete { domain } | DomainKind::Exhaustive { domain, .. } => {
                if domain.is_empty() {
                    1.0
                } else {
                    2.0 - 1.0 / domain.len() as f64
                }
            }
        }
    }

    pub fn to_json(&self) -> CanopyResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(spec: &Value) -> CanopyResult<Self> {
        let domain: Self = serde_json::from_value(spec.clone())?;
        domain.validate()?;
        Ok(domain)
    }
}

fn resolve_params(
    distribution: Distribution,
    args: &[f64],
    kws: &BTreeMap<String, f64>,
) -> Result<Params, DomainError> {
    let invalid = |message: String| DomainError::InvalidDistribution {
        distribution: distribution.name().to_string(),
        message,
    };

    if args.len() > 2 {
        return Err(invalid(format!("expected at most 2 arguments, got {}", args.len())));
    }

    let mut resolved = [0.0; 2];
    for (slot, name) in distribution.arg_names().iter().enumerate() {
        resolved[slot] = kws
            .get(*name)
            .copied()
            .or_else(|| args.get(slot).copied())
            .or_else(|| distribution.default_arg(name))
            .ok_or_else(|| invalid(format!("missing parameter '{name}'")))?;
    }
    if resolved.iter().any(|v| !v.is_finite()) {
        return Err(invalid("parameters must be finite".to_string()));
    }

    let params = Params {
        first: resolved[0],
        second: resolved[1],
    };
    match distribution {
        Distribution::Uniform | Distribution::Normal if params.second <= 0.0 => {
            Err(invalid(format!("scale must be positive, got {}", params.second)))
        }
        Distribution::LogUniform if params.first <= 0.0 || params.second <= params.first => {
            Err(invalid(format!(
                "bounds must satisfy 0 < a < b, got a={} b={}",
                params.first, params.second
            )))
        }
        _ => Ok(params),
    }
}

/// Structural equality: same path and same definition. Identity and the
/// exhaustive cursor are not part of it.
impl PartialEq for Domain {
    fn eq(&self, other: &Self) -> bool {
        if self.path != other.path {
            return false;
        }
        match (&self.kind, &other.kind) {
            (
                DomainKind::Exhaustive { domain: a, .. },
                DomainKind::Exhaustive { domain: b, .. },
            ) => a == b,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DomainKind::Continuous {
                distribution,
                args,
                kws,
            } => write!(
                f,
                "{}({}, args={:?}, kws={:?})",
                self.type_name(),
                distribution.name(),
                args,
                kws
            ),
            DomainKind::Discrete { domain } | DomainKind::Exhaustive { domain, .. } => {
                write!(f, "{}({})", self.type_name(), Value::from(domain.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use serde_json::json;

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().map(|v| json!(v)).collect()
    }

    #[test]
    fn discrete_generate_stays_in_domain() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut d = Domain::discrete(ints(&[1, 2, 3, 4, 5])).unwrap();
        for _ in 0..500 {
            let v = d.generate(&mut rng).unwrap();
            let idx = d.map_to_index(&v).unwrap();
            assert!((0.0..5.0).contains(&idx));
        }
    }

    #[test]
    fn exhaustive_generate_is_round_robin() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut d = Domain::exhaustive(ints(&[1, 2, 3, 4, 5])).unwrap();
        for i in 0..20 {
            let v = d.generate(&mut rng).unwrap();
            assert_eq!(d.map_to_index(&v).unwrap(), (i % 5) as f64);
        }
        match &d.kind {
            DomainKind::Exhaustive { idx, .. } => assert_eq!(*idx, 0),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn uniform_respects_support() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut d = Domain::uniform(-2.0, 3.0).unwrap();
        for _ in 0..500 {
            let v = d.generate(&mut rng).unwrap().as_f64().unwrap();
            assert!((-2.0..3.0).contains(&v), "out of bounds: {v}");
        }
        assert!((d.complexity() - 7.0).abs() < 1e-12);
    }

    #[test]
    fn log_uniform_respects_support() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut d = Domain::log_uniform(1e-5, 1e-1).unwrap();
        for _ in 0..500 {
            let v = d.generate(&mut rng).unwrap().as_f64().unwrap();
            assert!((1e-5..=1e-1).contains(&v), "out of bounds: {v}");
        }
    }

    #[test]
    fn normal_samples_are_finite_and_centered() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut d = Domain::normal(10.0, 0.5).unwrap();
        let n = 2000;
        let mean = (0..n)
            .map(|_| d.generate(&mut rng).unwrap().as_f64().unwrap())
            .sum::<f64>()
            / n as f64;
        assert!((mean - 10.0).abs() < 0.1, "mean drifted: {mean}");
    }

    #[test]
    fn keyword_parameters_override_positional() {
        let mut kws = BTreeMap::new();
        kws.insert("scale".to_string(), 4.0);
        let d = Domain::continuous(Distribution::Uniform, vec![1.0, 1.0], kws).unwrap();
        assert!((d.complexity() - 6.0).abs() < 1e-12);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(Domain::uniform(1.0, 1.0).is_err());
        assert!(Domain::log_uniform(0.0, 1.0).is_err());
        assert!(Domain::discrete(vec![]).is_err());
        assert!(Domain::exhaustive(vec![]).is_err());
        assert!(Domain::continuous(Distribution::LogUniform, vec![], BTreeMap::new()).is_err());
    }

    #[test]
    fn fixed_value_has_unit_complexity() {
        let d = Domain::fixed(json!("adam"));
        assert_eq!(d.complexity(), 1.0);
        assert_eq!(d.map_to_index(&json!("adam")).unwrap(), 0.0);
        assert!(d.map_to_index(&json!("sgd")).is_err());
    }

    #[test]
    fn discrete_to_json_contract() {
        let d = Domain::discrete(ints(&[1, 2, 3])).unwrap().with_path("/a");
        let spec = d.to_json().unwrap();
        assert_eq!(spec["type"], "DiscreteDomain");
        assert_eq!(spec["path"], "/a");
        assert_eq!(spec["domain"], json!([1, 2, 3]));
        assert_eq!(spec["id"], json!(d.id));
    }

    #[test]
    fn continuous_to_json_contract() {
        let d = Domain::uniform(0.0, 1.0).unwrap();
        let spec = d.to_json().unwrap();
        assert_eq!(spec["type"], "ContinuousDomain");
        assert_eq!(spec["path"], "");
        assert_eq!(spec["distribution"], "uniform");
        assert_eq!(spec["args"], json!([0.0, 1.0]));
        assert_eq!(spec["kws"], json!({}));
    }

    #[test]
    fn exhaustive_from_json_restores_cursor() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut d = Domain::exhaustive(ints(&[1, 2, 3])).unwrap().with_path("/x");
        d.generate(&mut rng).unwrap();

        let spec = d.to_json().unwrap();
        assert_eq!(spec["idx"], 1);

        let mut back = Domain::from_json(&spec).unwrap();
        assert_eq!(back, d);
        assert_eq!(back.id, d.id);
        assert_eq!(back.generate(&mut rng).unwrap(), json!(2));
    }

    #[test]
    fn from_json_rejects_malformed_input() {
        assert!(Domain::from_json(&json!({"type": "DiscreteDomain"})).is_err());
        assert!(Domain::from_json(&json!({"type": "Nope", "domain": [1]})).is_err());
        assert!(Domain::from_json(&json!({
            "type": "ContinuousDomain",
            "distribution": "uniform",
            "args": [0.0, -1.0]
        }))
        .is_err());
    }

    #[test]
    fn missing_id_gets_generated() {
        let d = Domain::from_json(&json!({"type": "DiscreteDomain", "domain": [1]})).unwrap();
        assert!(!d.id.is_empty());
        assert_eq!(d.path, "");
    }

    #[test]
    fn structural_equality_ignores_identity_and_cursor() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let a = Domain::exhaustive(ints(&[1, 2])).unwrap().with_path("/p");
        let mut b = a.clone();
        b.id = "other".to_string();
        b.generate(&mut rng).unwrap();
        assert_eq!(a, b);

        let c = a.clone().with_path("/q");
        assert_ne!(a, c);
    }

    #[test]
    fn distribution_names_and_aliases_deserialize() {
        for dist in [Distribution::Uniform, Distribution::Normal, Distribution::LogUniform] {
            let parsed: Distribution = serde_json::from_value(json!(dist.name())).unwrap();
            assert_eq!(parsed, dist);
        }
        let norm: Distribution = serde_json::from_value(json!("norm")).unwrap();
        assert_eq!(norm, Distribution::Normal);

        let d = Domain::from_json(&json!({
            "type": "ContinuousDomain",
            "distribution": "reciprocal",
            "args": [1e-3, 1.0]
        }))
        .unwrap();
        assert!(matches!(
            d.kind,
            DomainKind::Continuous { distribution: Distribution::LogUniform, .. }
        ));
        assert!(serde_json::from_value::<Distribution>(json!("beta")).is_err());
    }
}
