//! Step executor: applies one planned step through the adapter.

use serde::{Deserialize, Serialize};

use crate::adapter::ResourceAdapter;
use crate::plan::{ReconciliationStep, StepAction};

/// A single failed step, keyed by the resource it applied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub resource_id: String,
    pub message: String,
}

/// Apply one step: exactly one adapter call, no retry.
///
/// Adapter failure is wrapped per resource and returned as data; nothing
/// propagates past this boundary.
pub async fn execute_step(
    step: &ReconciliationStep,
    adapter: &dyn ResourceAdapter,
) -> Result<(), StepFailure> {
    let outcome = match step.action {
        StepAction::Add => adapter.create(&step.resource).await,
        StepAction::Update => adapter.update(&step.resource).await,
        StepAction::Remove => adapter.remove(&step.resource.id).await,
    };

    outcome.map_err(|e| StepFailure {
        resource_id: step.resource.id.clone(),
        message: format!("{e:#}"),
    })
}
