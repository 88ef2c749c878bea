use std::collections::{BTreeMap, HashMap};

use indicator_registry::{DefinitionKey, DefinitionKind, InputSchema};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use ts_core::MarketContext;

use crate::gateway::{RecomputeError, RecomputeGateway, RecomputeRequest};
use crate::instance::{CacheEntry, ComputeOutput, Instance, InstanceId, PanelKey};

/// Proof that a recompute was issued for one instance, carrying the merged
/// inputs that will be written back if the response is still current.
#[derive(Debug, Clone, PartialEq)]
pub struct RecomputeTicket {
    pub key: PanelKey,
    pub token: u64,
    pub inputs: InputSchema,
}

impl RecomputeTicket {
    pub fn kind(&self) -> DefinitionKind {
        self.key.kind()
    }

    pub fn request(&self, context: &MarketContext) -> Result<RecomputeRequest, RecomputeError> {
        Ok(RecomputeRequest {
            kind: self.key.kind(),
            definition_id: self.key.definition_id(),
            inputs: self.inputs.values(),
            context: context.require()?,
        })
    }
}

/// What happened to the cache when a recompute response was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Inputs, result and prints were replaced together.
    Updated,
    /// The definition is gone; the instance was removed and its panel must be too.
    Evicted { key: PanelKey, entry_removed: bool },
    /// A newer recompute was issued for the same instance after this one.
    Stale,
    /// The instance no longer exists.
    Dropped,
}

/// Cache of computed instances keyed by definition (kind and id), then by
/// instance id.
#[derive(Debug, Default)]
pub struct ComputationCache {
    entries: BTreeMap<DefinitionKey, CacheEntry>,
    /// Token of the newest outstanding recompute per instance.
    pending: HashMap<PanelKey, u64>,
    next_token: u64,
}

impl ComputationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries. Empty entries are dropped.
    pub fn from_entries(entries: impl IntoIterator<Item = CacheEntry>) -> Self {
        let entries = entries
            .into_iter()
            .filter(|entry| !entry.is_empty())
            .map(|mut entry| {
                entry.normalize();
                (entry.key(), entry)
            })
            .collect();
        Self {
            entries,
            ..Self::default()
        }
    }

    /// Entries in key order, as persisted.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn entries(&self) -> &BTreeMap<DefinitionKey, CacheEntry> {
        &self.entries
    }

    pub fn entry(&self, definition: DefinitionKey) -> Option<&CacheEntry> {
        self.entries.get(&definition)
    }

    pub fn get(&self, key: PanelKey) -> Option<&Instance> {
        self.entries
            .get(&key.definition)
            .and_then(|e| e.instance(key.instance_id))
    }

    pub fn contains(&self, key: PanelKey) -> bool {
        self.get(key).is_some()
    }

    pub fn definitions(&self) -> impl Iterator<Item = DefinitionKey> + '_ {
        self.entries.keys().copied()
    }

    pub fn instance_ids(&self, definition: DefinitionKey) -> Vec<InstanceId> {
        self.entries
            .get(&definition)
            .map(|e| e.instances.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn panel_keys(&self) -> Vec<PanelKey> {
        self.entries
            .values()
            .flat_map(|e| e.instances.keys().map(move |id| e.panel_key(*id)))
            .collect()
    }

    /// Number of definitions with at least one instance.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn instance_count(&self) -> usize {
        self.entries.values().map(CacheEntry::len).sum()
    }

    /// Attach another instance of a definition. The returned key is what the
    /// caller registers with the layout.
    pub fn add_instance(
        &mut self,
        definition: DefinitionKey,
        name: impl Into<String>,
        inputs: InputSchema,
        output: ComputeOutput,
    ) -> PanelKey {
        let name = name.into();
        let entry = self
            .entries
            .entry(definition)
            .or_insert_with(|| CacheEntry::new(definition, name.clone()));
        entry.name = name;
        let instance_id = entry.allocate_id();
        entry
            .instances
            .insert(instance_id, Instance::new(instance_id, inputs, output));
        info!(%definition, instance_id, "instance added");
        PanelKey::for_instance(definition, instance_id)
    }

    /// Re-run the active panel: overwrite the highest-id instance in place, or
    /// create instance 1 when the definition has none.
    pub fn replace_last_or_create(
        &mut self,
        definition: DefinitionKey,
        name: impl Into<String>,
        inputs: InputSchema,
        output: ComputeOutput,
    ) -> PanelKey {
        let last = self
            .entries
            .get(&definition)
            .and_then(CacheEntry::last_instance_id);
        let Some(instance_id) = last else {
            return self.add_instance(definition, name, inputs, output);
        };

        let key = PanelKey::for_instance(definition, instance_id);
        if let Some(entry) = self.entries.get_mut(&definition) {
            entry.name = name.into();
            if let Some(instance) = entry.instances.get_mut(&instance_id) {
                instance.replace_computed(inputs, output);
            }
        }
        // A response for the overwritten data must not land on top of it.
        self.pending.remove(&key);
        info!(%definition, instance_id, "instance replaced");
        key
    }

    /// Remove one instance, and the whole entry if it was the last.
    pub fn remove_instance(&mut self, key: PanelKey) -> Option<PanelKey> {
        let entry = self.entries.get_mut(&key.definition)?;
        entry.instances.remove(&key.instance_id)?;
        let entry_removed = entry.is_empty();
        if entry_removed {
            self.entries.remove(&key.definition);
        }
        self.pending.remove(&key);
        info!(%key, entry_removed, "instance removed");
        Some(key)
    }

    /// Flip visibility only. Returns the new flag.
    pub fn toggle_visibility(&mut self, key: PanelKey) -> Option<bool> {
        let instance = self
            .entries
            .get_mut(&key.definition)?
            .instances
            .get_mut(&key.instance_id)?;
        instance.visible = !instance.visible;
        debug!(%key, visible = instance.visible, "visibility toggled");
        Some(instance.visible)
    }

    /// Merge `updates` into the instance's current inputs and issue a new
    /// request token. Nothing in the cache changes until the ticket is applied.
    pub fn begin_recompute(
        &mut self,
        key: PanelKey,
        updates: &Map<String, Value>,
    ) -> Option<RecomputeTicket> {
        let inputs = self.get(key)?.inputs.merged(updates);

        self.next_token += 1;
        let token = self.next_token;
        self.pending.insert(key, token);
        debug!(%key, token, "recompute issued");
        Some(RecomputeTicket { key, token, inputs })
    }

    /// Write a gateway response back. Responses for removed instances or
    /// superseded tokens are discarded; `NotFound` evicts; any other failure is
    /// returned with the cache unchanged.
    pub fn apply_recompute(
        &mut self,
        ticket: RecomputeTicket,
        response: Result<ComputeOutput, RecomputeError>,
    ) -> Result<ApplyOutcome, RecomputeError> {
        let key = ticket.key;
        if !self.contains(key) {
            debug!(%key, token = ticket.token, "response for removed instance dropped");
            return Ok(ApplyOutcome::Dropped);
        }
        if self.pending.get(&key) != Some(&ticket.token) {
            debug!(%key, token = ticket.token, "stale response dropped");
            return Ok(ApplyOutcome::Stale);
        }
        self.pending.remove(&key);

        match response {
            Ok(output) => {
                if let Some(instance) = self
                    .entries
                    .get_mut(&key.definition)
                    .and_then(|e| e.instances.get_mut(&key.instance_id))
                {
                    instance.replace_computed(ticket.inputs, output);
                }
                debug!(%key, token = ticket.token, "recompute applied");
                Ok(ApplyOutcome::Updated)
            }
            Err(RecomputeError::NotFound) => {
                self.remove_instance(key);
                let entry_removed = !self.entries.contains_key(&key.definition);
                info!(%key, entry_removed, "definition gone, instance evicted");
                Ok(ApplyOutcome::Evicted { key, entry_removed })
            }
            Err(err) => {
                warn!(%key, token = ticket.token, error = %err, "recompute failed");
                Err(err)
            }
        }
    }

    /// Merge, evaluate and apply in one call.
    ///
    /// Returns `Ok(ApplyOutcome::Dropped)` when the instance does not exist.
    pub async fn update_inputs<G>(
        &mut self,
        gateway: &G,
        context: &MarketContext,
        key: PanelKey,
        updates: &Map<String, Value>,
    ) -> Result<ApplyOutcome, RecomputeError>
    where
        G: RecomputeGateway + ?Sized,
    {
        let Some(ticket) = self.begin_recompute(key, updates) else {
            return Ok(ApplyOutcome::Dropped);
        };
        let response = match ticket.request(context) {
            Ok(request) => gateway.recompute(&request).await,
            Err(err) => Err(err),
        };
        self.apply_recompute(ticket, response)
    }
}
