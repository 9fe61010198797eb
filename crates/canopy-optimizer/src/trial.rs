//! Evaluation results and the values that produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use canopy_types::{CanopyResult, Domain, ModelError};

/// A non-owning reference to another entity, by id.
///
/// A `Bound` link was created against a live entity and resolves through
/// whatever owns that entity (a model's domain list, a model group). A
/// `Detached` link only carries the id; it shows up while a result is being
/// rebuilt from JSON and has not yet been attached to its model. Both forms
/// serialize to the bare id string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Link {
    Bound(String),
    Detached(String),
}

impl Link {
    pub fn id(&self) -> &str {
        match self {
            Self::Bound(id) | Self::Detached(id) => id,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, Self::Bound(_))
    }

    pub fn bind(&mut self) {
        if let Self::Detached(id) = self {
            *self = Self::Bound(std::mem::take(id));
        }
    }

    /// Resolve against a set of candidates. A detached link, or a bound one
    /// whose referent is no longer present, is `ReferentUnavailable`.
    pub fn resolve<'a, T, F>(
        &self,
        kind: &'static str,
        candidates: &'a [T],
        id_of: F,
    ) -> Result<&'a T, ModelError>
    where
        F: Fn(&T) -> &str,
    {
        let unavailable = || ModelError::ReferentUnavailable {
            kind,
            id: self.id().to_string(),
        };
        match self {
            Self::Detached(_) => Err(unavailable()),
            Self::Bound(id) => candidates
                .iter()
                .find(|candidate| id_of(candidate) == id)
                .ok_or_else(unavailable),
        }
    }
}

impl Serialize for Link {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.id())
    }
}

impl<'de> Deserialize<'de> for Link {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::Detached)
    }
}

/// One sampled hyperparameter value, tied to the domain that produced it
/// and the result it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialValue {
    pub value: Value,
    pub domain: Link,
    #[serde(default)]
    pub result: Option<Link>,
}

impl TrialValue {
    pub fn new(value: Value, domain: &Domain, result_id: &str) -> Self {
        Self {
            value,
            domain: Link::Bound(domain.id.clone()),
            result: Some(Link::Bound(result_id.to_string())),
        }
    }

    /// Look up the producing domain among `domains`.
    pub fn domain<'a>(&self, domains: &'a [Domain]) -> Result<&'a Domain, ModelError> {
        self.domain.resolve("domain", domains, |d| d.id.as_str())
    }

    /// Numeric feature for this value, via the domain's index mapping.
    pub fn to_numeric(&self, domains: &[Domain]) -> CanopyResult<f64> {
        let domain = self.domain(domains)?;
        Ok(domain.map_to_index(&self.value)?)
    }

    pub fn to_json(&self) -> CanopyResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// The outcome of evaluating one generated hyperparameterization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub id: String,
    pub model: Option<Link>,
    pub loss: Option<f64>,
    /// Auxiliary metrics reported alongside the loss.
    pub results: Option<Value>,
    pub values: Vec<TrialValue>,
    /// How many times an outcome has been registered for this id.
    #[serde(default)]
    pub submissions: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub registered_at: Option<DateTime<Utc>>,
}

impl TrialResult {
    pub fn new(model_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            model: Some(Link::Bound(model_id.to_string())),
            loss: None,
            results: None,
            values: Vec::new(),
            submissions: 0,
            created_at: Utc::now(),
            registered_at: None,
        }
    }

    pub fn add_value(&mut self, value: TrialValue) {
        self.values.push(value);
    }

    /// Whether the loss is usable as a regression target.
    pub fn has_finite_loss(&self) -> bool {
        self.loss.is_some_and(f64::is_finite)
    }

    pub(crate) fn record_outcome(&mut self, loss: Option<f64>, results: Option<Value>) {
        self.loss = loss;
        self.results = results;
        self.submissions += 1;
        self.registered_at = Some(Utc::now());
    }

    /// Rebuild the nested parameter mapping from this result's values.
    pub fn parameters(&self, domains: &[Domain]) -> CanopyResult<Map<String, Value>> {
        let mut entries = Vec::with_capacity(self.values.len());
        for value in &self.values {
            let domain = value.domain(domains)?;
            entries.push((domain.path.as_str(), value.value.clone()));
        }
        Ok(nest_parameters(entries))
    }

    pub fn to_json(&self) -> CanopyResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild a result against the domains of the model it belongs to.
    ///
    /// Value links are checked against `domains` and bound; the model link
    /// stays detached until the owning model attaches the result.
    pub fn from_json(spec: &Value, domains: &[Domain]) -> CanopyResult<Self> {
        let mut result: Self = serde_json::from_value(spec.clone())?;
        result.attach_values(domains)?;
        Ok(result)
    }

    pub(crate) fn attach_values(&mut self, domains: &[Domain]) -> CanopyResult<()> {
        for value in &mut self.values {
            if !domains.iter().any(|d| d.id == value.domain.id()) {
                return Err(ModelError::Malformed {
                    entity: "result",
                    message: format!(
                        "result {} references unknown domain {}",
                        self.id,
                        value.domain.id()
                    ),
                }
                .into());
            }
            value.domain.bind();
            match &mut value.result {
                Some(link) if link.id() == self.id => link.bind(),
                Some(link) => {
                    return Err(ModelError::Malformed {
                        entity: "value",
                        message: format!(
                            "value of result {} claims to belong to result {}",
                            self.id,
                            link.id()
                        ),
                    }
                    .into())
                }
                None => value.result = Some(Link::Bound(self.id.clone())),
            }
        }
        Ok(())
    }

    pub(crate) fn attach_model(&mut self, model_id: &str) {
        self.model = Some(Link::Bound(model_id.to_string()));
    }
}

/// Turn slash-delimited paths into a nested mapping: every segment but the
/// last becomes one level of nesting, the last is the key for the value.
/// Empty segments are skipped.
pub fn nest_parameters<'a, I>(entries: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (&'a str, Value)>,
{
    let mut root = Map::new();
    for (path, value) in entries {
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let leaf = segments.pop().unwrap_or_default();
        insert_nested(&mut root, &segments, leaf, value);
    }
    root
}

fn insert_nested(map: &mut Map<String, Value>, segments: &[&str], leaf: &str, value: Value) {
    match segments.split_first() {
        None => {
            map.insert(leaf.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(child) = slot {
                insert_nested(child, rest, leaf, value);
            }
        }
    }
}
