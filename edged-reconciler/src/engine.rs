//! Reconciliation engine: owns target and current state for one resource
//! kind and drives the plan/execute/persist loop.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::adapter::ResourceAdapter;
use crate::error::{EngineError, PlanError};
use crate::events::{EventBus, ReconcileEvent};
use crate::executor::{execute_step, StepFailure};
use crate::plan::{plan, PlanPolicy, StepAction};
use crate::resource::{ManagedResource, ResourceKind, ResourceSet, StateSnapshot};
use crate::store::StateStore;

/// Aggregate outcome of one reconciliation pass.
///
/// `success` is false iff `errors` is non-empty; steps applied before a
/// failure are retained in current state either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub success: bool,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub errors: Vec<StepFailure>,
    pub finished_at: DateTime<Utc>,
}

/// Outcome of a `set_target` request routed through an [`EngineHandle`].
#[derive(Debug)]
pub enum SetTargetOutcome {
    /// The target was planned and the pass ran; inspect the result for
    /// per-resource failures.
    Applied(ReconciliationResult),
    /// A newer target arrived before this one was planned; it was dropped
    /// without ever being applied (most recent target wins).
    Superseded,
}

/// Reconciliation engine for one resource kind.
///
/// The engine is single-writer by construction: `set_target` and
/// `reconcile` take `&mut self`, so at most one pass can be in flight.
/// Concurrent callers go through [`spawn`] and the [`EngineHandle`].
pub struct Engine {
    kind: ResourceKind,
    target: ResourceSet,
    current: ResourceSet,
    policy: PlanPolicy,
    adapter: Arc<dyn ResourceAdapter>,
    store: Arc<dyn StateStore>,
    events: EventBus,
}

impl Engine {
    /// Create an engine seeded from the last persisted snapshot.
    ///
    /// A missing or unreadable snapshot is treated as "no prior state",
    /// never a fatal error: the next reconciliation re-adds everything,
    /// which is safe because adapter create must tolerate an
    /// already-existing resource or reject it cleanly as a step error.
    pub async fn load(
        kind: ResourceKind,
        adapter: Arc<dyn ResourceAdapter>,
        store: Arc<dyn StateStore>,
        policy: PlanPolicy,
    ) -> Self {
        let current = match store.load(kind).await {
            Ok(Some(snapshot)) => match snapshot.into_set() {
                Ok(set) => {
                    info!(kind = %kind, resources = set.len(), "Loaded state snapshot");
                    set
                }
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Snapshot invalid, starting from empty state");
                    ResourceSet::new()
                }
            },
            Ok(None) => {
                debug!(kind = %kind, "No prior snapshot");
                ResourceSet::new()
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to load snapshot, starting from empty state");
                ResourceSet::new()
            }
        };

        Self {
            kind,
            target: ResourceSet::new(),
            current,
            policy,
            adapter,
            store,
            events: EventBus::default(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileEvent> {
        self.events.subscribe()
    }

    /// Defensive copy of the target state.
    pub fn target_state(&self) -> ResourceSet {
        self.target.clone()
    }

    /// Defensive copy of the current state.
    pub fn current_state(&self) -> ResourceSet {
        self.current.clone()
    }

    /// Replace the target state and immediately reconcile against it.
    ///
    /// Duplicate ids are rejected here, before any step is planned. The
    /// resource list is moved in, so the caller cannot alias the stored
    /// target afterwards.
    pub async fn set_target(
        &mut self,
        resources: Vec<ManagedResource>,
    ) -> Result<ReconciliationResult, PlanError> {
        self.target = ResourceSet::from_resources(resources)?;
        Ok(self.reconcile().await)
    }

    /// One pass: plan, execute steps strictly in plan order, persist after
    /// every applied step, emit events, return the aggregate result.
    ///
    /// A failed step is recorded and the loop continues — one
    /// malfunctioning resource must not block convergence of the rest.
    pub async fn reconcile(&mut self) -> ReconciliationResult {
        let steps = plan(&self.target, &self.current, self.policy);
        info!(kind = %self.kind, steps = steps.len(), "Reconciling");

        let mut added = 0;
        let mut updated = 0;
        let mut removed = 0;
        let mut errors = Vec::new();

        for step in &steps {
            match execute_step(step, self.adapter.as_ref()).await {
                Ok(()) => {
                    let event = match step.action {
                        StepAction::Add => {
                            self.current.upsert(step.resource.clone());
                            added += 1;
                            ReconcileEvent::ResourceAdded(step.resource.clone())
                        }
                        StepAction::Update => {
                            self.current.upsert(step.resource.clone());
                            updated += 1;
                            ReconcileEvent::ResourceUpdated(step.resource.clone())
                        }
                        StepAction::Remove => {
                            self.current.remove(&step.resource.id);
                            removed += 1;
                            ReconcileEvent::ResourceRemoved {
                                id: step.resource.id.clone(),
                            }
                        }
                    };
                    // Persist before starting the next step so a crash
                    // loses at most the steps not yet attempted.
                    self.persist().await;
                    self.events.publish(event);
                }
                Err(failure) => {
                    warn!(
                        kind = %self.kind,
                        id = %failure.resource_id,
                        error = %failure.message,
                        "Step failed, continuing"
                    );
                    errors.push(failure);
                }
            }
        }

        let result = ReconciliationResult {
            success: errors.is_empty(),
            added,
            updated,
            removed,
            errors,
            finished_at: Utc::now(),
        };
        info!(
            kind = %self.kind,
            added,
            updated,
            removed,
            errors = result.errors.len(),
            "Reconciliation complete"
        );
        self.events
            .publish(ReconcileEvent::ReconciliationComplete(result.clone()));
        result
    }

    /// Persist current state; a failed save is logged and the pass
    /// continues with the in-memory state staying authoritative.
    async fn persist(&self) {
        let snapshot = StateSnapshot::of(self.kind, &self.current);
        if let Err(e) = self.store.save(self.kind, &snapshot).await {
            warn!(kind = %self.kind, error = %e, "Failed to persist state snapshot");
        }
    }
}

enum Command {
    SetTarget {
        resources: Vec<ManagedResource>,
        responder: oneshot::Sender<Result<SetTargetOutcome, EngineError>>,
    },
    Reconcile {
        responder: oneshot::Sender<ReconciliationResult>,
    },
    TargetState {
        responder: oneshot::Sender<ResourceSet>,
    },
    CurrentState {
        responder: oneshot::Sender<ResourceSet>,
    },
}

/// Cloneable handle to an engine running on its own task.
#[derive(Clone)]
pub struct EngineHandle {
    kind: ResourceKind,
    tx: mpsc::Sender<Command>,
    events: EventBus,
}

impl EngineHandle {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileEvent> {
        self.events.subscribe()
    }

    /// Request a target replacement and wait for the outcome.
    ///
    /// If a newer target arrives while this one is still queued behind a
    /// running pass, this resolves to [`SetTargetOutcome::Superseded`].
    pub async fn set_target(
        &self,
        resources: Vec<ManagedResource>,
    ) -> Result<SetTargetOutcome, EngineError> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(Command::SetTarget {
                resources,
                responder,
            })
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)?
    }

    /// Re-run a pass against the engine's existing target.
    pub async fn reconcile(&self) -> Result<ReconciliationResult, EngineError> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(Command::Reconcile { responder })
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    pub async fn target_state(&self) -> Result<ResourceSet, EngineError> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(Command::TargetState { responder })
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    pub async fn current_state(&self) -> Result<ResourceSet, EngineError> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(Command::CurrentState { responder })
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }
}

/// Spawn `engine` on its own task and return a handle to it.
///
/// The task serializes all requests, so at most one pass runs at a time
/// per resource kind. Engines for different kinds run fully independently.
pub fn spawn(engine: Engine) -> EngineHandle {
    let (tx, rx) = mpsc::channel(64);
    let handle = EngineHandle {
        kind: engine.kind,
        tx,
        events: engine.events.clone(),
    };
    tokio::spawn(run_engine(engine, rx));
    handle
}

/// Engine command loop.
///
/// Targets queued while a pass was running are superseded when the engine
/// becomes free again: all but the newest resolve with `Superseded`, and
/// only the newest is planned. The in-flight step is never interrupted.
async fn run_engine(mut engine: Engine, mut rx: mpsc::Receiver<Command>) {
    let mut backlog = VecDeque::new();

    loop {
        let cmd = match backlog.pop_front() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };

        match cmd {
            Command::SetTarget {
                resources,
                responder,
            } => {
                let (resources, responder) =
                    drain_to_newest(&mut rx, &mut backlog, resources, responder);
                let outcome = engine
                    .set_target(resources)
                    .await
                    .map(SetTargetOutcome::Applied)
                    .map_err(EngineError::from);
                let _ = responder.send(outcome);
            }
            Command::Reconcile { responder } => {
                let _ = responder.send(engine.reconcile().await);
            }
            Command::TargetState { responder } => {
                let _ = responder.send(engine.target_state());
            }
            Command::CurrentState { responder } => {
                let _ = responder.send(engine.current_state());
            }
        }
    }

    debug!(kind = %engine.kind(), "Engine task stopping");
}

type SetTargetResponder = oneshot::Sender<Result<SetTargetOutcome, EngineError>>;

/// Supersede policy: drain every queued SetTarget, keep only the newest.
/// Non-target commands drained along the way run after the pass.
fn drain_to_newest(
    rx: &mut mpsc::Receiver<Command>,
    backlog: &mut VecDeque<Command>,
    mut resources: Vec<ManagedResource>,
    mut responder: SetTargetResponder,
) -> (Vec<ManagedResource>, SetTargetResponder) {
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            Command::SetTarget {
                resources: newer,
                responder: newer_responder,
            } => {
                let superseded = std::mem::replace(&mut responder, newer_responder);
                resources = newer;
                let _ = superseded.send(Ok(SetTargetOutcome::Superseded));
            }
            other => backlog.push_back(other),
        }
    }
    (resources, responder)
}
