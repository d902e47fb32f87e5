//! Reconciliation core for the edged supervisor.
//!
//! Keeps a device's actual state converging toward a cloud-declared target:
//! diff target vs. current, apply an ordered set of add/remove/update steps
//! through a resource adapter, persist a snapshot after every applied step,
//! and emit lifecycle events. The loop itself is resource-kind-agnostic;
//! everything concrete lives behind the [`ResourceAdapter`] and
//! [`StateStore`] contracts.

pub mod adapter;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod plan;
pub mod resource;
pub mod store;
pub mod testing;

pub use adapter::ResourceAdapter;
pub use engine::{spawn, Engine, EngineHandle, ReconciliationResult, SetTargetOutcome};
pub use error::{EngineError, PlanError, StoreError};
pub use events::{EventBus, ReconcileEvent};
pub use executor::{execute_step, StepFailure};
pub use plan::{plan, PlanPolicy, ReconciliationStep, StepAction};
pub use resource::{ManagedResource, ResourceKind, ResourceSet, StateSnapshot};
pub use store::{MemoryStore, StateStore};
