//! Lifecycle event bus.

use tokio::sync::broadcast;

use crate::engine::ReconciliationResult;
use crate::resource::ManagedResource;

/// Lifecycle notifications emitted by the engine.
///
/// Per-resource events fire only after the corresponding step succeeded;
/// `ReconciliationComplete` fires exactly once per pass regardless of
/// outcome.
#[derive(Debug, Clone)]
pub enum ReconcileEvent {
    ResourceAdded(ManagedResource),
    ResourceUpdated(ManagedResource),
    ResourceRemoved { id: String },
    ReconciliationComplete(ReconciliationResult),
}

/// Typed publish/subscribe surface over a broadcast channel.
///
/// Subscribers that fall behind lose the oldest events; publishing with no
/// subscribers is a no-op.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ReconcileEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn publish(&self, event: ReconcileEvent) {
        // Err means no live receivers, which is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
