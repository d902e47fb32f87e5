//! Supervisor: polls the control plane and drives both engines.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use edged_reconciler::{EngineError, EngineHandle, ReconcileEvent, SetTargetOutcome};

use crate::supplier::TargetSupplier;

/// Drives the two per-kind engines from the polled device manifest.
///
/// The kinds reconcile independently: a failing service never blocks
/// sensor convergence, and vice versa.
pub struct Supervisor {
    supplier: Box<dyn TargetSupplier>,
    services: EngineHandle,
    sensors: EngineHandle,
    poll_interval: Duration,
    revision: u64,
}

impl Supervisor {
    pub fn new(
        supplier: Box<dyn TargetSupplier>,
        services: EngineHandle,
        sensors: EngineHandle,
        poll_interval: Duration,
    ) -> Self {
        Self {
            supplier,
            services,
            sensors,
            poll_interval,
            revision: 0,
        }
    }

    /// Run until the process is stopped.
    pub async fn run(&mut self) -> Result<()> {
        spawn_event_logger("service", self.services.subscribe());
        spawn_event_logger("sensor", self.sensors.subscribe());

        let mut ticker = interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                warn!("Target poll failed: {e:#}");
            }
        }
    }

    /// One poll + reconcile cycle. Public so `--oneshot` can drive it.
    pub async fn poll_once(&mut self) -> Result<()> {
        let Some(manifest) = self.supplier.fetch(self.revision).await? else {
            debug!(revision = self.revision, "Target unchanged");
            return Ok(());
        };

        let revision = manifest.revision;
        info!(
            revision,
            services = manifest.services.len(),
            sensors = manifest.sensors.len(),
            "Received target manifest"
        );

        let (service_target, sensor_target) = manifest.into_targets()?;

        let (service_outcome, sensor_outcome) = tokio::join!(
            self.services.set_target(service_target),
            self.sensors.set_target(sensor_target),
        );
        report("service", service_outcome);
        report("sensor", sensor_outcome);

        self.revision = revision;
        Ok(())
    }
}

fn report(kind: &str, outcome: Result<SetTargetOutcome, EngineError>) {
    match outcome {
        Ok(SetTargetOutcome::Applied(result)) if result.success => {
            info!(
                kind,
                added = result.added,
                updated = result.updated,
                removed = result.removed,
                "Reconciliation succeeded"
            );
        }
        Ok(SetTargetOutcome::Applied(result)) => {
            warn!(
                kind,
                errors = result.errors.len(),
                "Reconciliation finished with errors"
            );
            for failure in &result.errors {
                warn!(
                    kind,
                    id = %failure.resource_id,
                    error = %failure.message,
                    "Resource failed to apply"
                );
            }
        }
        Ok(SetTargetOutcome::Superseded) => {
            debug!(kind, "Target superseded by a newer manifest");
        }
        Err(e) => {
            error!(kind, error = %e, "Reconciliation rejected");
        }
    }
}

/// Mirror engine lifecycle events into the log.
fn spawn_event_logger(kind: &'static str, mut events: broadcast::Receiver<ReconcileEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ReconcileEvent::ResourceAdded(resource)) => {
                    info!(kind, id = %resource.id, "Resource added");
                }
                Ok(ReconcileEvent::ResourceUpdated(resource)) => {
                    info!(kind, id = %resource.id, "Resource updated");
                }
                Ok(ReconcileEvent::ResourceRemoved { id }) => {
                    info!(kind, id = %id, "Resource removed");
                }
                Ok(ReconcileEvent::ReconciliationComplete(result)) => {
                    debug!(kind, success = result.success, "Reconciliation complete");
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(kind, missed, "Event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::json;

    use edged_reconciler::testing::ScriptedAdapter;
    use edged_reconciler::{spawn, Engine, MemoryStore, PlanPolicy, StepAction};

    use crate::manifest::{
        DeviceManifest, RegisterBlock, SensorSpec, ServiceSpec, SENSOR_KIND, SERVICE_KIND,
    };

    /// Supplier double serving a scripted sequence of manifests.
    struct FakeSupplier {
        manifests: Mutex<Vec<Option<DeviceManifest>>>,
        fetches: AtomicU64,
    }

    impl FakeSupplier {
        fn new(manifests: Vec<Option<DeviceManifest>>) -> Self {
            Self {
                manifests: Mutex::new(manifests),
                fetches: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl TargetSupplier for FakeSupplier {
        async fn fetch(&self, _since_revision: u64) -> Result<Option<DeviceManifest>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let mut manifests = self.manifests.lock().unwrap();
            if manifests.is_empty() {
                Ok(None)
            } else {
                Ok(manifests.remove(0))
            }
        }
    }

    fn manifest(revision: u64, service_ids: &[&str], sensor_ids: &[&str]) -> DeviceManifest {
        DeviceManifest {
            revision,
            services: service_ids
                .iter()
                .map(|id| ServiceSpec {
                    id: id.to_string(),
                    name: id.to_string(),
                    image: format!("/rootfs/{id}"),
                    command: vec!["/bin/app".to_string()],
                    args: vec![],
                    env: vec![],
                    working_dir: String::new(),
                })
                .collect(),
            sensors: sensor_ids
                .iter()
                .map(|id| SensorSpec {
                    id: id.to_string(),
                    name: id.to_string(),
                    address: "10.0.0.9:502".to_string(),
                    unit_id: 1,
                    poll_interval_ms: 1000,
                    registers: vec![RegisterBlock { start: 0, count: 2 }],
                })
                .collect(),
        }
    }

    async fn supervisor_with(
        supplier: FakeSupplier,
    ) -> (Supervisor, Arc<ScriptedAdapter>, Arc<ScriptedAdapter>) {
        let service_adapter = Arc::new(ScriptedAdapter::new());
        let sensor_adapter = Arc::new(ScriptedAdapter::new());
        let store = Arc::new(MemoryStore::new());

        let services = spawn(
            Engine::load(
                SERVICE_KIND,
                service_adapter.clone(),
                store.clone(),
                PlanPolicy::default(),
            )
            .await,
        );
        let sensors = spawn(
            Engine::load(
                SENSOR_KIND,
                sensor_adapter.clone(),
                store,
                PlanPolicy::default(),
            )
            .await,
        );

        let supervisor = Supervisor::new(
            Box::new(supplier),
            services,
            sensors,
            Duration::from_secs(10),
        );
        (supervisor, service_adapter, sensor_adapter)
    }

    #[tokio::test]
    async fn test_manifest_drives_both_kinds() {
        let supplier = FakeSupplier::new(vec![Some(manifest(1, &["svc-a"], &["sen-a", "sen-b"]))]);
        let (mut supervisor, service_adapter, sensor_adapter) = supervisor_with(supplier).await;

        supervisor.poll_once().await.unwrap();

        assert_eq!(
            service_adapter.calls(),
            vec![(StepAction::Add, "svc-a".to_string())]
        );
        assert_eq!(sensor_adapter.calls().len(), 2);
        assert_eq!(supervisor.revision, 1);

        let current = supervisor.sensors.current_state().await.unwrap();
        assert!(current.contains("sen-a"));
        assert_eq!(
            current.get("sen-a").unwrap().spec["address"],
            json!("10.0.0.9:502")
        );
    }

    #[tokio::test]
    async fn test_unchanged_target_is_a_no_op() {
        let supplier = FakeSupplier::new(vec![None]);
        let (mut supervisor, service_adapter, sensor_adapter) = supervisor_with(supplier).await;

        supervisor.poll_once().await.unwrap();

        assert!(service_adapter.calls().is_empty());
        assert!(sensor_adapter.calls().is_empty());
        assert_eq!(supervisor.revision, 0);
    }

    #[tokio::test]
    async fn test_invalid_manifest_keeps_previous_target() {
        let mut bad = manifest(2, &[], &["dup"]);
        bad.sensors.push(bad.sensors[0].clone());
        let supplier = FakeSupplier::new(vec![
            Some(manifest(1, &[], &["sen-a"])),
            Some(bad),
        ]);
        let (mut supervisor, _service_adapter, sensor_adapter) = supervisor_with(supplier).await;

        supervisor.poll_once().await.unwrap();
        assert_eq!(supervisor.revision, 1);

        let err = supervisor.poll_once().await.unwrap_err();
        assert!(err.to_string().contains("Duplicate sensor id"));
        // Revision did not advance and the applied state is untouched.
        assert_eq!(supervisor.revision, 1);
        assert_eq!(sensor_adapter.calls().len(), 1);
        let current = supervisor.sensors.current_state().await.unwrap();
        assert!(current.contains("sen-a"));
    }

    #[tokio::test]
    async fn test_one_kind_failing_does_not_block_the_other() {
        let supplier = FakeSupplier::new(vec![Some(manifest(1, &["svc-a"], &["sen-a"]))]);
        let (mut supervisor, service_adapter, _sensor_adapter) = supervisor_with(supplier).await;
        service_adapter.fail_on(StepAction::Add, "svc-a");

        supervisor.poll_once().await.unwrap();

        // The manifest still advanced and sensors converged.
        assert_eq!(supervisor.revision, 1);
        let sensors = supervisor.sensors.current_state().await.unwrap();
        assert!(sensors.contains("sen-a"));
        let services = supervisor.services.current_state().await.unwrap();
        assert!(services.is_empty());
    }
}
