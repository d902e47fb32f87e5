//! Wire model of the cloud-declared device target.
//!
//! Specs are typed and validated here, at the supplier edge; past this
//! point the engine only sees opaque JSON values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use edged_reconciler::{ManagedResource, ResourceKind};

use crate::modbus::MAX_REGISTERS_PER_READ;

pub const SERVICE_KIND: ResourceKind = ResourceKind::new("service");
pub const SENSOR_KIND: ResourceKind = ResourceKind::new("sensor");

/// Poll intervals below this are rejected to protect slow field devices.
const MIN_POLL_INTERVAL_MS: u64 = 100;

/// Full-replacement target for one device, as served by the control plane.
/// Never a delta: applying an older revision has no value once a newer one
/// is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceManifest {
    pub revision: u64,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub sensors: Vec<SensorSpec>,
}

/// One containerized application service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub id: String,
    pub name: String,
    /// Path to the unpacked rootfs for this service; image distribution is
    /// handled outside the agent.
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
}

/// One Modbus TCP sensor endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSpec {
    pub id: String,
    pub name: String,
    /// `host:port` of the Modbus TCP endpoint.
    pub address: String,
    #[serde(default)]
    pub unit_id: u8,
    pub poll_interval_ms: u64,
    pub registers: Vec<RegisterBlock>,
}

/// A contiguous block of holding registers to read each poll.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegisterBlock {
    pub start: u16,
    pub count: u16,
}

impl DeviceManifest {
    /// Validate the manifest and split it into per-kind target lists.
    ///
    /// Any violation rejects the whole manifest; the previously applied
    /// target stays in force.
    pub fn into_targets(self) -> Result<(Vec<ManagedResource>, Vec<ManagedResource>)> {
        let mut seen = HashSet::new();
        let mut services = Vec::with_capacity(self.services.len());
        for spec in self.services {
            spec.validate()
                .with_context(|| format!("Invalid service spec {}", spec.id))?;
            if !seen.insert(spec.id.clone()) {
                bail!("Duplicate service id: {}", spec.id);
            }
            services.push(to_resource(&spec.id, &spec)?);
        }

        let mut seen = HashSet::new();
        let mut sensors = Vec::with_capacity(self.sensors.len());
        for spec in self.sensors {
            spec.validate()
                .with_context(|| format!("Invalid sensor spec {}", spec.id))?;
            if !seen.insert(spec.id.clone()) {
                bail!("Duplicate sensor id: {}", spec.id);
            }
            sensors.push(to_resource(&spec.id, &spec)?);
        }

        Ok((services, sensors))
    }
}

fn to_resource<T: Serialize>(id: &str, spec: &T) -> Result<ManagedResource> {
    let value = serde_json::to_value(spec).context("Failed to serialize spec")?;
    Ok(ManagedResource::new(id, value))
}

impl ServiceSpec {
    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            bail!("Service id must not be empty");
        }
        if self.image.is_empty() {
            bail!("Service image must not be empty");
        }
        Ok(())
    }
}

impl SensorSpec {
    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            bail!("Sensor id must not be empty");
        }
        let (host, port) = self
            .address
            .rsplit_once(':')
            .with_context(|| format!("Sensor address '{}' is not host:port", self.address))?;
        if host.is_empty() {
            bail!("Sensor address '{}' has an empty host", self.address);
        }
        port.parse::<u16>()
            .with_context(|| format!("Sensor address '{}' has an invalid port", self.address))?;
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            bail!(
                "Poll interval {}ms is below the {}ms minimum",
                self.poll_interval_ms,
                MIN_POLL_INTERVAL_MS
            );
        }
        if self.registers.is_empty() {
            bail!("Sensor must declare at least one register block");
        }
        for block in &self.registers {
            if block.count == 0 || block.count > MAX_REGISTERS_PER_READ {
                bail!(
                    "Register count {} outside 1..={}",
                    block.count,
                    MAX_REGISTERS_PER_READ
                );
            }
            if block.start.checked_add(block.count - 1).is_none() {
                bail!("Register block {}+{} overflows the address space", block.start, block.count);
            }
        }
        Ok(())
    }
}
