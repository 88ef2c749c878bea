use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use indicator_registry::{DefinitionId, DefinitionKey, DefinitionKind, InputSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_core::Series;

pub type InstanceId = u32;

/// Opaque annotation emitted alongside a result (log lines, markers, ...).
pub type Annotation = Value;

const PANEL_PREFIX: &str = "panel-";

/// Layout identity of one instance: `panel-<kind>-<definitionId>-<instanceId>`.
///
/// The cache and the layout only share this string, never references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PanelKey {
    pub definition: DefinitionKey,
    pub instance_id: InstanceId,
}

impl PanelKey {
    pub fn for_instance(definition: DefinitionKey, instance_id: InstanceId) -> Self {
        Self {
            definition,
            instance_id,
        }
    }

    pub fn kind(&self) -> DefinitionKind {
        self.definition.kind
    }

    pub fn definition_id(&self) -> DefinitionId {
        self.definition.id
    }
}

impl fmt::Display for PanelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PANEL_PREFIX}{}-{}", self.definition, self.instance_id)
    }
}

impl From<PanelKey> for String {
    fn from(key: PanelKey) -> Self {
        key.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePanelKeyError;

impl fmt::Display for ParsePanelKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("not an instance panel key")
    }
}

impl std::error::Error for ParsePanelKeyError {}

impl FromStr for PanelKey {
    type Err = ParsePanelKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix(PANEL_PREFIX).ok_or(ParsePanelKeyError)?;
        let mut parts = rest.splitn(3, '-');
        let (Some(kind), Some(def), Some(inst)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ParsePanelKeyError);
        };
        let kind = match kind {
            "indicator" => DefinitionKind::Indicator,
            "strategy" => DefinitionKind::Strategy,
            _ => return Err(ParsePanelKeyError),
        };
        let id = def.parse().map_err(|_| ParsePanelKeyError)?;
        let instance_id = inst.parse().map_err(|_| ParsePanelKeyError)?;
        Ok(Self::for_instance(DefinitionKey::new(kind, id), instance_id))
    }
}

/// What a successful evaluation produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeOutput {
    pub result: Series,
    #[serde(default)]
    pub prints: Vec<Annotation>,
    /// Strategy runs also return a trade summary; indicators leave this empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
}

impl ComputeOutput {
    pub fn new(result: Series, prints: Vec<Annotation>) -> Self {
        Self {
            result,
            prints,
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: Value) -> Self {
        self.summary = Some(summary);
        self
    }
}

fn visible_by_default() -> bool {
    true
}

/// One parameterized, independently displayed evaluation of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub inputs: InputSchema,
    pub result: Series,
    #[serde(default)]
    pub prints: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
    #[serde(default = "visible_by_default")]
    pub visible: bool,
}

impl Instance {
    pub fn new(id: InstanceId, inputs: InputSchema, output: ComputeOutput) -> Self {
        Self {
            id,
            inputs,
            result: output.result,
            prints: output.prints,
            summary: output.summary,
            visible: true,
        }
    }

    /// Swap computed data and the inputs that produced it in one step.
    pub(crate) fn replace_computed(&mut self, inputs: InputSchema, output: ComputeOutput) {
        self.inputs = inputs;
        self.result = output.result;
        self.prints = output.prints;
        self.summary = output.summary;
    }
}

/// All live instances of one definition. Never kept once empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub definition_id: DefinitionId,
    #[serde(default)]
    pub kind: DefinitionKind,
    pub name: String,
    pub instances: BTreeMap<InstanceId, Instance>,
    /// Next id handed out by `add_instance`; ids are never reused within an entry.
    #[serde(default)]
    pub(crate) next_instance_id: InstanceId,
}

impl CacheEntry {
    pub(crate) fn new(definition: DefinitionKey, name: String) -> Self {
        Self {
            definition_id: definition.id,
            kind: definition.kind,
            name,
            instances: BTreeMap::new(),
            next_instance_id: 1,
        }
    }

    pub fn key(&self) -> DefinitionKey {
        DefinitionKey::new(self.kind, self.definition_id)
    }

    pub fn panel_key(&self, instance_id: InstanceId) -> PanelKey {
        PanelKey::for_instance(self.key(), instance_id)
    }

    pub fn instance(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.get(&id)
    }

    pub fn last_instance_id(&self) -> Option<InstanceId> {
        self.instances.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub(crate) fn allocate_id(&mut self) -> InstanceId {
        let floor = self.last_instance_id().map_or(1, |last| last + 1);
        let id = self.next_instance_id.max(floor);
        self.next_instance_id = id + 1;
        id
    }

    /// Restored state may predate the counter or carry a stale one.
    pub(crate) fn normalize(&mut self) {
        let floor = self.last_instance_id().map_or(1, |last| last + 1);
        self.next_instance_id = self.next_instance_id.max(floor);
    }
}
