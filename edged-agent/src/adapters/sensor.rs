//! Sensor device adapter: one Modbus poll task per declared sensor.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use edged_reconciler::{ManagedResource, ResourceAdapter};

use crate::manifest::SensorSpec;
use crate::modbus;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct Poller {
    // Dropping the sender stops the poll loop.
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Manages the set of live poll tasks; create/update/remove map to
/// spawn/respawn/stop.
#[derive(Default)]
pub struct SensorAdapter {
    pollers: Mutex<HashMap<String, Poller>>,
}

impl SensorAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe the endpoint once, then hand it to a poll task. The probe
    /// makes an unreachable sensor fail its step instead of spawning a
    /// poller that fails quietly forever.
    async fn spawn_poller(&self, spec: SensorSpec) -> Result<()> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&spec.address))
            .await
            .with_context(|| format!("Timed out connecting to {}", spec.address))?
            .with_context(|| format!("Failed to connect to {}", spec.address))?;
        drop(stream);

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let id = spec.id.clone();
        let handle = tokio::spawn(poll_loop(spec, stop_rx));

        self.pollers
            .lock()
            .await
            .insert(id, Poller { stop_tx, handle });
        Ok(())
    }

    async fn stop_poller(&self, id: &str) -> bool {
        match self.pollers.lock().await.remove(id) {
            Some(poller) => {
                drop(poller.stop_tx);
                poller.handle.abort();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ResourceAdapter for SensorAdapter {
    async fn create(&self, resource: &ManagedResource) -> Result<()> {
        let spec: SensorSpec =
            serde_json::from_value(resource.spec.clone()).context("Invalid sensor spec")?;

        if self.stop_poller(&resource.id).await {
            warn!(id = %resource.id, "Poller already running, replacing");
        }
        self.spawn_poller(spec).await?;
        info!(id = %resource.id, "Sensor poller started");
        Ok(())
    }

    async fn update(&self, resource: &ManagedResource) -> Result<()> {
        let spec: SensorSpec =
            serde_json::from_value(resource.spec.clone()).context("Invalid sensor spec")?;

        self.stop_poller(&resource.id).await;
        self.spawn_poller(spec).await?;
        info!(id = %resource.id, "Sensor poller restarted with new spec");
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        if self.stop_poller(id).await {
            info!(id = %id, "Sensor poller stopped");
        } else {
            debug!(id = %id, "No poller to remove");
        }
        Ok(())
    }
}

/// Poll loop for one sensor: read the configured register blocks every
/// interval, reconnecting after a failed read.
async fn poll_loop(spec: SensorSpec, mut stop_rx: mpsc::Receiver<()>) {
    let mut ticker = interval(Duration::from_millis(spec.poll_interval_ms));
    let mut connection: Option<TcpStream> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                poll_once(&spec, &mut connection).await;
            }
            _ = stop_rx.recv() => {
                debug!(id = %spec.id, "Poller stopping");
                break;
            }
        }
    }
}

async fn poll_once(spec: &SensorSpec, slot: &mut Option<TcpStream>) {
    if slot.is_none() {
        match TcpStream::connect(&spec.address).await {
            Ok(stream) => {
                debug!(id = %spec.id, address = %spec.address, "Sensor connected");
                *slot = Some(stream);
            }
            Err(e) => {
                warn!(id = %spec.id, address = %spec.address, error = %e, "Sensor connect failed");
                return;
            }
        }
    }

    let Some(connection) = slot.as_mut() else {
        return;
    };
    if let Err(e) = read_blocks(spec, connection).await {
        warn!(id = %spec.id, error = %e, "Sensor read failed, dropping connection");
        *slot = None;
    }
}

async fn read_blocks(spec: &SensorSpec, connection: &mut TcpStream) -> Result<()> {
    for block in &spec.registers {
        let values =
            modbus::read_holding_registers(connection, spec.unit_id, block.start, block.count)
                .await?;
        debug!(id = %spec.id, start = block.start, values = ?values, "Registers read");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn sensor_resource(id: &str, address: &str) -> ManagedResource {
        ManagedResource::new(
            id,
            json!({
                "id": id,
                "name": id,
                "address": address,
                "unit_id": 1,
                "poll_interval_ms": 60_000,
                "registers": [{"start": 0, "count": 1}]
            }),
        )
    }

    #[tokio::test]
    async fn test_create_fails_for_unreachable_sensor() {
        let adapter = SensorAdapter::new();
        // Reserved TEST-NET address, nothing listens there.
        let resource = sensor_resource("s1", "192.0.2.1:502");

        let started = std::time::Instant::now();
        let result = adapter.create(&resource).await;
        assert!(result.is_err());
        assert!(started.elapsed() <= CONNECT_TIMEOUT + Duration::from_secs(2));
        assert!(adapter.pollers.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_replace_remove_lifecycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        // Accept probe connections in the background.
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let adapter = SensorAdapter::new();
        let resource = sensor_resource("s1", &address);

        adapter.create(&resource).await.unwrap();
        assert!(adapter.pollers.lock().await.contains_key("s1"));

        // Create over a live poller replaces it.
        adapter.create(&resource).await.unwrap();
        assert_eq!(adapter.pollers.lock().await.len(), 1);

        adapter.update(&resource).await.unwrap();
        assert_eq!(adapter.pollers.lock().await.len(), 1);

        adapter.remove("s1").await.unwrap();
        assert!(adapter.pollers.lock().await.is_empty());

        // Removing an absent sensor is a no-op.
        adapter.remove("s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_loop_reads_registers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        // Modbus device double: answer one read with a fixed register.
        let server = tokio::spawn(async move {
            // First accept is the adapter's probe.
            let _ = listener.accept().await.unwrap();
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            stream.read_exact(&mut request).await.unwrap();
            // Echo transaction id, answer with register value 0x002A.
            let response = [
                request[0], request[1], // transaction id
                0x00, 0x00, // protocol id
                0x00, 0x05, // length
                request[6], // unit id
                0x03, 0x02, 0x00, 0x2A,
            ];
            stream.write_all(&response).await.unwrap();
            request
        });

        let spec = SensorSpec {
            id: "s1".to_string(),
            name: "s1".to_string(),
            address,
            unit_id: 7,
            poll_interval_ms: 100,
            registers: vec![crate::manifest::RegisterBlock { start: 5, count: 1 }],
        };

        let adapter = SensorAdapter::new();
        adapter.spawn_poller(spec).await.unwrap();

        let request = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        // The poll sent a read-holding-registers request for our block.
        assert_eq!(request[6], 7); // unit id
        assert_eq!(request[7], 0x03); // function
        assert_eq!(u16::from_be_bytes([request[8], request[9]]), 5); // start

        adapter.remove("s1").await.unwrap();
    }
}
