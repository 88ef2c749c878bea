//! Client-side cache of computed indicator and strategy instances.
//!
//! Each definition owns a set of independently parameterized instances. Edits
//! are merged into an instance's inputs and sent to a [`RecomputeGateway`];
//! the response replaces inputs, result and prints together, evicts the
//! instance when the definition is gone, or leaves everything untouched on
//! failure. Every recompute carries a per-instance token so a slow, earlier
//! response can never overwrite a newer one.

pub mod cache;
pub mod gateway;
pub mod instance;

pub use cache::{ApplyOutcome, ComputationCache, RecomputeTicket};
pub use gateway::{RecomputeError, RecomputeGateway, RecomputeRequest};
pub use indicator_registry::DefinitionKey;
pub use instance::{
    Annotation, CacheEntry, ComputeOutput, Instance, InstanceId, PanelKey, ParsePanelKeyError,
};
