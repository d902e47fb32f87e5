//! Scriptable adapter for the test suites.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::adapter::ResourceAdapter;
use crate::plan::StepAction;
use crate::resource::ManagedResource;

/// Adapter test double: records every call in order, fails on demand, and
/// can hold calls open so tests can queue work against a busy engine.
#[derive(Default)]
pub struct ScriptedAdapter {
    calls: Mutex<Vec<(StepAction, String)>>,
    failures: Mutex<HashSet<(StepAction, String)>>,
    paused: AtomicBool,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call for (action, id) fail until cleared.
    pub fn fail_on(&self, action: StepAction, id: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert((action, id.to_string()));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    /// Hold every call open until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// All calls seen so far, in invocation order.
    pub fn calls(&self) -> Vec<(StepAction, String)> {
        self.calls.lock().unwrap().clone()
    }

    async fn apply(&self, action: StepAction, id: &str) -> Result<()> {
        self.calls.lock().unwrap().push((action, id.to_string()));

        while self.paused.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        if self
            .failures
            .lock()
            .unwrap()
            .contains(&(action, id.to_string()))
        {
            bail!("injected {action} failure for {id}");
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceAdapter for ScriptedAdapter {
    async fn create(&self, resource: &ManagedResource) -> Result<()> {
        self.apply(StepAction::Add, &resource.id).await
    }

    async fn update(&self, resource: &ManagedResource) -> Result<()> {
        self.apply(StepAction::Update, &resource.id).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.apply(StepAction::Remove, id).await
    }
}
