//! Error types for the reconciliation core.

use thiserror::Error;

/// Invariant violations detected before any step is planned.
///
/// These are programming or supplier errors, not runtime conditions to
/// recover from; `set_target` rejects them at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("duplicate resource id in state: {id}")]
    DuplicateId { id: String },
}

/// State store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot load failed: {0}")]
    Load(String),

    #[error("snapshot save failed: {0}")]
    Save(String),

    #[error("snapshot payload corrupt: {0}")]
    Corrupt(String),
}

/// Errors surfaced by the engine entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// The engine task has stopped and can no longer accept requests.
    #[error("engine task unavailable")]
    Closed,
}
