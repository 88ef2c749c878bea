use async_trait::async_trait;
use indicator_registry::{DefinitionId, DefinitionKind};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use ts_core::{MarketContextError, ResolvedContext};

use crate::instance::ComputeOutput;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecomputeError {
    /// The definition no longer exists server-side. Evicts instead of failing.
    #[error("definition not found")]
    NotFound,
    #[error("market context incomplete: {0}")]
    MissingContext(#[from] MarketContextError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("evaluation service returned status {0}")]
    Status(u16),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("evaluation service unavailable: {0}")]
    Unavailable(String),
}

impl RecomputeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RecomputeError::NotFound)
    }

    /// Everything except `NotFound` leaves the cache untouched.
    pub fn is_transient(&self) -> bool {
        !self.is_not_found()
    }
}

/// Everything the evaluation service needs for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecomputeRequest {
    pub kind: DefinitionKind,
    pub definition_id: DefinitionId,
    pub inputs: Map<String, Value>,
    pub context: ResolvedContext,
}

/// External service evaluating a definition against market data.
#[async_trait]
pub trait RecomputeGateway: Send + Sync {
    async fn recompute(&self, request: &RecomputeRequest) -> Result<ComputeOutput, RecomputeError>;
}
