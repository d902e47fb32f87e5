//! Resource model shared by all reconcilers.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PlanError;

/// Identifies one kind of managed resource (e.g. "service", "sensor").
///
/// Snapshots are keyed by kind; two engines for different kinds never see
/// each other's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKind(&'static str);

impl ResourceKind {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// One managed resource: identity plus an opaque spec.
///
/// The engine never looks inside `spec`; it only needs deep equality and
/// serialization, which `serde_json::Value` provides. Two resources with
/// the same id are the same resource in different states, never two
/// distinct resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedResource {
    pub id: String,
    pub spec: Value,
}

impl ManagedResource {
    pub fn new(id: impl Into<String>, spec: Value) -> Self {
        Self {
            id: id.into(),
            spec,
        }
    }
}

/// Ordered collection of resources with unique ids.
///
/// Used for both target and current state. Insertion order is preserved so
/// plans come out deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSet {
    resources: Vec<ManagedResource>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from a resource list, rejecting duplicate ids.
    pub fn from_resources(resources: Vec<ManagedResource>) -> Result<Self, PlanError> {
        let mut seen = HashSet::new();
        for resource in &resources {
            if !seen.insert(resource.id.as_str()) {
                return Err(PlanError::DuplicateId {
                    id: resource.id.clone(),
                });
            }
        }
        Ok(Self { resources })
    }

    pub fn get(&self, id: &str) -> Option<&ManagedResource> {
        self.resources.iter().find(|r| r.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Insert or replace by id, keeping the original position on replace.
    pub fn upsert(&mut self, resource: ManagedResource) {
        match self.resources.iter_mut().find(|r| r.id == resource.id) {
            Some(existing) => *existing = resource,
            None => self.resources.push(resource),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<ManagedResource> {
        let index = self.resources.iter().position(|r| r.id == id)?;
        Some(self.resources.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedResource> {
        self.resources.iter()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Set equality: same ids with deep-equal specs, order-insensitive.
    pub fn set_eq(&self, other: &ResourceSet) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|r| other.get(&r.id).is_some_and(|o| o.spec == r.spec))
    }

    pub fn into_resources(self) -> Vec<ManagedResource> {
        self.resources
    }
}

/// Durable record of the last successfully reconciled current state for one
/// resource kind. Written after every applied step, read once at start-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub kind: String,
    pub resources: Vec<ManagedResource>,
    pub saved_at: DateTime<Utc>,
}

impl StateSnapshot {
    pub fn of(kind: ResourceKind, current: &ResourceSet) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            resources: current.iter().cloned().collect(),
            saved_at: Utc::now(),
        }
    }

    pub fn into_set(self) -> Result<ResourceSet, PlanError> {
        ResourceSet::from_resources(self.resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_resources_rejects_duplicates() {
        let result = ResourceSet::from_resources(vec![
            ManagedResource::new("a", json!({"x": 1})),
            ManagedResource::new("b", json!({"x": 2})),
            ManagedResource::new("a", json!({"x": 3})),
        ]);

        assert_eq!(result.unwrap_err(), PlanError::DuplicateId { id: "a".into() });
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut set = ResourceSet::new();
        set.upsert(ManagedResource::new("a", json!(1)));
        set.upsert(ManagedResource::new("b", json!(2)));
        set.upsert(ManagedResource::new("a", json!(3)));

        assert_eq!(set.len(), 2);
        assert_eq!(set.get("a").unwrap().spec, json!(3));
        // Replaced entry keeps its position.
        assert_eq!(set.iter().next().unwrap().id, "a");
    }

    #[test]
    fn test_set_eq_ignores_order() {
        let left = ResourceSet::from_resources(vec![
            ManagedResource::new("a", json!({"v": 1})),
            ManagedResource::new("b", json!({"v": 2})),
        ])
        .unwrap();
        let right = ResourceSet::from_resources(vec![
            ManagedResource::new("b", json!({"v": 2})),
            ManagedResource::new("a", json!({"v": 1})),
        ])
        .unwrap();

        assert!(left.set_eq(&right));
    }

    #[test]
    fn test_set_eq_compares_specs_deeply() {
        let left = ResourceSet::from_resources(vec![ManagedResource::new(
            "a",
            json!({"nested": {"poll_ms": 1000}}),
        )])
        .unwrap();
        let right = ResourceSet::from_resources(vec![ManagedResource::new(
            "a",
            json!({"nested": {"poll_ms": 5000}}),
        )])
        .unwrap();

        assert!(!left.set_eq(&right));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let kind = ResourceKind::new("sensor");
        let mut set = ResourceSet::new();
        set.upsert(ManagedResource::new("s1", json!({"poll_ms": 5000})));

        let snapshot = StateSnapshot::of(kind, &set);
        assert_eq!(snapshot.kind, "sensor");

        let restored = snapshot.into_set().unwrap();
        assert!(restored.set_eq(&set));
    }
}
