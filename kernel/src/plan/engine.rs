// Statement Engine Boundary
//
// Parsing and executing statements belongs to an external engine. This
// module defines the contract the control plane drives it through,
// including the cooperative cancellation checkpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::metadata::MetadataStore;
use crate::plan::PlanId;

/// Errors an engine reports back to the control plane.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("malformed statement: {0}")]
    Malformed(String),

    #[error("execution failed: {0}")]
    Failed(String),

    /// Work stopped at a checkpoint after cancellation was requested.
    #[error("interrupted")]
    Interrupted,

    /// The engine hit a broken internal invariant. `context` names where.
    #[error("internal engine error: {message}")]
    Internal { message: String, context: String },
}

/// Executes administrative statements on behalf of the coordinator.
///
/// `prepare` runs synchronously inside `execute` and must be quick;
/// `run` happens on a blocking worker and may take arbitrarily long, as
/// long as it calls [`ExecutionContext::checkpoint`] regularly.
pub trait StatementEngine: Send + Sync + 'static {
    type Prepared: Send + 'static;

    fn prepare(&self, statement: &str) -> Result<Self::Prepared, EngineError>;

    fn run(&self, prepared: Self::Prepared, ctx: &ExecutionContext) -> Result<(), EngineError>;
}

/// Shared cancellation intent for one plan. Once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a running statement may see of the node executing it.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    plan_id: PlanId,
    cancel: CancelToken,
    store: Arc<MetadataStore>,
}

impl ExecutionContext {
    pub fn new(plan_id: PlanId, cancel: CancelToken, store: Arc<MetadataStore>) -> Self {
        Self {
            plan_id,
            cancel,
            store,
        }
    }

    pub fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Safe point for cancellation: returns `Err(Interrupted)` once the
    /// plan has been asked to stop.
    pub fn checkpoint(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Interrupted)
        } else {
            Ok(())
        }
    }
}
