use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod versions;

pub use versions::{resolve_version_groups, VersionGroup, VersionSelections, VersionedEntity};

pub type DefinitionId = u64;

/// What a definition computes. Decides which evaluation endpoint is used.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    #[default]
    Indicator,
    Strategy,
}

impl DefinitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefinitionKind::Indicator => "indicator",
            DefinitionKind::Strategy => "strategy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDefinitionKindError;

impl fmt::Display for ParseDefinitionKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown definition kind")
    }
}

impl std::error::Error for ParseDefinitionKindError {}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DefinitionKind {
    type Err = ParseDefinitionKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "indicator" | "ind" => Ok(DefinitionKind::Indicator),
            "strategy" | "strat" => Ok(DefinitionKind::Strategy),
            _ => Err(ParseDefinitionKindError),
        }
    }
}

/// Indicators and strategies are numbered independently, so an id alone is
/// ambiguous. This pair is what identifies a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefinitionKey {
    pub kind: DefinitionKind,
    pub id: DefinitionId,
}

impl DefinitionKey {
    pub fn new(kind: DefinitionKind, id: DefinitionId) -> Self {
        Self { kind, id }
    }

    pub fn indicator(id: DefinitionId) -> Self {
        Self::new(DefinitionKind::Indicator, id)
    }

    pub fn strategy(id: DefinitionId) -> Self {
        Self::new(DefinitionKind::Strategy, id)
    }
}

impl fmt::Display for DefinitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.id)
    }
}

/// One user-tunable parameter and its current default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputParam {
    pub name: String,
    pub default: Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl InputParam {
    pub fn new(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            default: default.into(),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// Ordered parameter list of one instance. Starts as a copy of the definition's
/// schema and accumulates the user's edits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(default)]
    pub inputs: Vec<InputParam>,
}

impl InputSchema {
    pub fn new(inputs: Vec<InputParam>) -> Self {
        Self { inputs }
    }

    pub fn from_definition(definition: &Definition) -> Self {
        Self::new(definition.input_schema.clone())
    }

    pub fn get(&self, name: &str) -> Option<&InputParam> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Overlay `updates` by parameter name. Names not in the schema are ignored;
    /// parameters without an update (or with a `null` one) keep their current default.
    pub fn merged(&self, updates: &Map<String, Value>) -> InputSchema {
        let inputs = self
            .inputs
            .iter()
            .map(|param| match updates.get(&param.name) {
                Some(value) if !value.is_null() => InputParam {
                    default: value.clone(),
                    ..param.clone()
                },
                _ => param.clone(),
            })
            .collect();
        InputSchema { inputs }
    }

    /// Name -> current default, in schema order.
    pub fn values(&self) -> Map<String, Value> {
        self.inputs
            .iter()
            .map(|p| (p.name.clone(), p.default.clone()))
            .collect()
    }
}

fn default_version() -> u32 {
    1
}

/// A computable published in the registry. Read-only from the client's side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    pub id: DefinitionId,
    pub name: String,
    #[serde(default)]
    pub kind: DefinitionKind,
    #[serde(default)]
    pub parent_id: Option<DefinitionId>,
    #[serde(default = "default_version")]
    pub version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub input_schema: Vec<InputParam>,
}

impl Definition {
    pub fn key(&self) -> DefinitionKey {
        DefinitionKey::new(self.kind, self.id)
    }

    pub fn initial_inputs(&self) -> InputSchema {
        InputSchema::from_definition(self)
    }
}
