//! Resource adapters for the two managed kinds.
//!
//! Adapters are the only code that touches the external side: the OCI
//! runtime for container services, the network for Modbus sensors.

pub mod sensor;
pub mod service;

pub use sensor::SensorAdapter;
pub use service::ServiceAdapter;
