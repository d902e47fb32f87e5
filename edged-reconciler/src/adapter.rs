//! Adapter contract: the only component that touches the external system.

use anyhow::Result;
use async_trait::async_trait;

use crate::resource::ManagedResource;

/// Resource-kind-specific create/update/remove verbs.
///
/// Implementations must be safe to call with a resource that already exists
/// (create) or is already gone (remove) on the external side; whether that
/// is an error or a no-op is the adapter's call. The engine never inspects
/// error content beyond capturing the message, and never retries within a
/// pass.
#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    async fn create(&self, resource: &ManagedResource) -> Result<()>;

    async fn update(&self, resource: &ManagedResource) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;
}
