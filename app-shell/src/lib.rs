//! One chart session: the computation cache, the panel layout and the market
//! context they are evaluated against, plus their persistence.
//!
//! The cache and the layout never reference each other. Every operation that
//! creates or destroys an instance here also registers or unregisters its
//! panel key, so the two stay in step. Removing an instance, or losing it to
//! eviction, also drops its rect.

use compute_cache::{
    ApplyOutcome, CacheEntry, ComputationCache, ComputeOutput, PanelKey, RecomputeError,
    RecomputeGateway, RecomputeTicket,
};
use indicator_registry::{Definition, DefinitionKey, InputSchema};
use panel_layout::{
    LayoutRect, LayoutSnapshot, LayoutSync, RectPatch, CHART_KEY, DEFAULT_SHARED_WIDTH,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use ts_core::{MarketContext, TimeFrame};

pub mod storage;

pub use storage::{FileStorage, MemoryStorage, PersistError, PersistencePolicy, Storage};

pub const CACHE_NAMESPACE: &str = "indicator-data";

/// How a session starts and what it keeps between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub cache_persistence: PersistencePolicy,
    pub layout_persistence: PersistencePolicy,
    pub default_synced_key: String,
    pub initial_width: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_persistence: PersistencePolicy::persist(CACHE_NAMESPACE),
            layout_persistence: PersistencePolicy::Ephemeral,
            default_synced_key: CHART_KEY.to_string(),
            initial_width: DEFAULT_SHARED_WIDTH,
        }
    }
}

impl SessionConfig {
    pub fn with_cache_persistence(mut self, policy: PersistencePolicy) -> Self {
        self.cache_persistence = policy;
        self
    }

    pub fn with_layout_persistence(mut self, policy: PersistencePolicy) -> Self {
        self.layout_persistence = policy;
        self
    }

    pub fn with_initial_width(mut self, width: u32) -> Self {
        self.initial_width = width;
        self
    }

    fn fresh_layout(&self) -> LayoutSync {
        LayoutSync::new(self.default_synced_key.clone(), self.initial_width)
    }
}

/// Explicit per-session state holder. Callers own it and pass it by reference.
pub struct ChartSession<S: Storage> {
    config: SessionConfig,
    storage: S,
    cache: ComputationCache,
    layout: LayoutSync,
    context: MarketContext,
}

impl<S: Storage> ChartSession<S> {
    /// Empty session; nothing is read from `storage`.
    pub fn new(config: SessionConfig, storage: S) -> Self {
        let layout = config.fresh_layout();
        Self {
            config,
            storage,
            cache: ComputationCache::new(),
            layout,
            context: MarketContext::default(),
        }
    }

    /// Session seeded from whatever each store's policy kept. Every restored
    /// instance gets its synced panel back.
    pub fn restore(config: SessionConfig, storage: S) -> Result<Self, PersistError> {
        let cache = match config.cache_persistence.namespace() {
            Some(ns) => match storage.load(ns)? {
                Some(json) => {
                    let entries: Vec<CacheEntry> = serde_json::from_str(&json)?;
                    ComputationCache::from_entries(entries)
                }
                None => ComputationCache::new(),
            },
            None => ComputationCache::new(),
        };

        let mut layout = match config.layout_persistence.namespace() {
            Some(ns) => match storage.load(ns)? {
                Some(json) => LayoutSync::restore(serde_json::from_str::<LayoutSnapshot>(&json)?),
                None => config.fresh_layout(),
            },
            None => config.fresh_layout(),
        };

        let keys = cache.panel_keys();
        for key in &keys {
            layout.register_synced_panel(*key);
        }
        info!(
            definitions = cache.len(),
            instances = keys.len(),
            "session restored"
        );

        Ok(Self {
            config,
            storage,
            cache,
            layout,
            context: MarketContext::default(),
        })
    }

    /// Write every store whose policy is `Persist`.
    pub fn persist(&mut self) -> Result<(), PersistError> {
        if let Some(ns) = self.config.cache_persistence.namespace() {
            let json = serde_json::to_string(&self.cache.snapshot())?;
            self.storage.save(ns, &json)?;
            debug!(namespace = ns, "cache persisted");
        }
        if let Some(ns) = self.config.layout_persistence.namespace() {
            let json = serde_json::to_string(&self.layout.snapshot())?;
            self.storage.save(ns, &json)?;
            debug!(namespace = ns, "layout persisted");
        }
        Ok(())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    pub fn cache(&self) -> &ComputationCache {
        &self.cache
    }

    pub fn layout(&self) -> &LayoutSync {
        &self.layout
    }

    pub fn context(&self) -> &MarketContext {
        &self.context
    }

    // ---------- Market context ----------------------------------------------

    pub fn set_symbol(&mut self, symbol: impl Into<String>) {
        self.context.symbol = Some(symbol.into());
    }

    pub fn set_interval(&mut self, interval: TimeFrame) {
        self.context.interval = Some(interval);
    }

    pub fn set_end(&mut self, end: impl Into<String>) {
        self.context.end = end.into();
    }

    pub fn set_context(&mut self, context: MarketContext) {
        self.context = context;
    }

    // ---------- Instances ----------------------------------------------------

    pub fn add_instance(
        &mut self,
        definition: DefinitionKey,
        name: impl Into<String>,
        inputs: InputSchema,
        output: ComputeOutput,
    ) -> PanelKey {
        let key = self.cache.add_instance(definition, name, inputs, output);
        self.layout.register_synced_panel(key);
        key
    }

    /// Attach a new instance seeded with the definition's own defaults.
    pub fn attach(&mut self, definition: &Definition, output: ComputeOutput) -> PanelKey {
        self.add_instance(
            definition.key(),
            definition.name.clone(),
            definition.initial_inputs(),
            output,
        )
    }

    pub fn replace_last_or_create(
        &mut self,
        definition: DefinitionKey,
        name: impl Into<String>,
        inputs: InputSchema,
        output: ComputeOutput,
    ) -> PanelKey {
        let key = self
            .cache
            .replace_last_or_create(definition, name, inputs, output);
        self.layout.register_synced_panel(key);
        key
    }

    pub fn remove_instance(&mut self, key: PanelKey) -> Option<PanelKey> {
        let key = self.cache.remove_instance(key)?;
        self.layout.remove_panel(&key.to_string());
        Some(key)
    }

    pub fn toggle_visibility(&mut self, key: PanelKey) -> Option<bool> {
        self.cache.toggle_visibility(key)
    }

    /// Merge `updates`, evaluate against the current context and apply. An
    /// evicted instance loses its panel too.
    ///
    /// The session stays mutably borrowed until the gateway answers, so only
    /// one recompute can be in flight through this call. Callers that need
    /// several outstanding at once must use [`begin_recompute`] and
    /// [`apply_recompute`] and send the requests themselves.
    ///
    /// [`begin_recompute`]: ChartSession::begin_recompute
    /// [`apply_recompute`]: ChartSession::apply_recompute
    pub async fn update_inputs<G>(
        &mut self,
        gateway: &G,
        key: PanelKey,
        updates: &Map<String, Value>,
    ) -> Result<ApplyOutcome, RecomputeError>
    where
        G: RecomputeGateway + ?Sized,
    {
        let outcome = self
            .cache
            .update_inputs(gateway, &self.context, key, updates)
            .await;
        self.after_apply(outcome)
    }

    /// First half of a recompute whose request is sent by the caller.
    pub fn begin_recompute(
        &mut self,
        key: PanelKey,
        updates: &Map<String, Value>,
    ) -> Option<RecomputeTicket> {
        self.cache.begin_recompute(key, updates)
    }

    pub fn apply_recompute(
        &mut self,
        ticket: RecomputeTicket,
        response: Result<ComputeOutput, RecomputeError>,
    ) -> Result<ApplyOutcome, RecomputeError> {
        let outcome = self.cache.apply_recompute(ticket, response);
        self.after_apply(outcome)
    }

    fn after_apply(
        &mut self,
        outcome: Result<ApplyOutcome, RecomputeError>,
    ) -> Result<ApplyOutcome, RecomputeError> {
        match &outcome {
            Ok(ApplyOutcome::Evicted { key, .. }) => {
                self.layout.remove_panel(&key.to_string());
            }
            Err(err) => warn!(error = %err, "recompute not applied"),
            Ok(_) => {}
        }
        outcome
    }

    // ---------- Layout -------------------------------------------------------

    pub fn set_layout(&mut self, raw: Vec<LayoutRect>) {
        self.layout.set_layout(raw);
    }

    pub fn update_single_rect(&mut self, key: &str, patch: RectPatch) -> bool {
        self.layout.update_single_rect(key, patch)
    }

    pub fn set_shared_width(&mut self, width: u32) {
        self.layout.set_shared_width(width);
    }

    pub fn toggle_auxiliary_panel(&mut self, on: bool) {
        self.layout.toggle_auxiliary_panel(on);
    }

    pub fn add_custom_panel(&mut self, rect: LayoutRect) -> bool {
        self.layout.add_custom_panel(rect)
    }

    pub fn remove_custom_panel(&mut self, key: &str) -> bool {
        self.layout.remove_custom_panel(key)
    }
}
