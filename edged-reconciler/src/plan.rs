//! Step planner: pure diff of target state against current state.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resource::{ManagedResource, ResourceSet};

/// The three verbs a plan can ask an adapter to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Add,
    Remove,
    Update,
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepAction::Add => "add",
            StepAction::Remove => "remove",
            StepAction::Update => "update",
        };
        f.write_str(name)
    }
}

/// One planned change, tagged with the resource it applies to.
///
/// Add and update steps carry the full target payload; remove steps carry
/// identity only (the spec slot holds null).
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationStep {
    pub action: StepAction,
    pub resource: ManagedResource,
}

/// Controls the relative order of step groups in a plan.
///
/// The default (add, remove, update) matches the behavior callers depend
/// on; it is policy, not an architectural requirement, so it stays
/// configurable. Steps within a group always keep their iteration order.
#[derive(Debug, Clone, Copy)]
pub struct PlanPolicy {
    pub group_order: [StepAction; 3],
}

impl Default for PlanPolicy {
    fn default() -> Self {
        Self {
            group_order: [StepAction::Add, StepAction::Remove, StepAction::Update],
        }
    }
}

/// Diff `target` against `current` into the ordered step list that
/// converges current onto target.
///
/// Resources unchanged by identity and deep spec equality produce no step,
/// which is what makes repeated reconciliation idempotent. No resource
/// appears in more than one step.
pub fn plan(
    target: &ResourceSet,
    current: &ResourceSet,
    policy: PlanPolicy,
) -> Vec<ReconciliationStep> {
    let mut adds = Vec::new();
    let mut removes = Vec::new();
    let mut updates = Vec::new();

    for resource in target.iter() {
        match current.get(&resource.id) {
            None => adds.push(ReconciliationStep {
                action: StepAction::Add,
                resource: resource.clone(),
            }),
            Some(existing) if existing.spec != resource.spec => {
                updates.push(ReconciliationStep {
                    action: StepAction::Update,
                    resource: resource.clone(),
                });
            }
            Some(_) => {}
        }
    }

    for resource in current.iter() {
        if !target.contains(&resource.id) {
            removes.push(ReconciliationStep {
                action: StepAction::Remove,
                resource: ManagedResource::new(resource.id.clone(), Value::Null),
            });
        }
    }

    let mut steps = Vec::with_capacity(adds.len() + removes.len() + updates.len());
    for action in policy.group_order {
        match action {
            StepAction::Add => steps.append(&mut adds),
            StepAction::Remove => steps.append(&mut removes),
            StepAction::Update => steps.append(&mut updates),
        }
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(resources: Vec<(&str, Value)>) -> ResourceSet {
        ResourceSet::from_resources(
            resources
                .into_iter()
                .map(|(id, spec)| ManagedResource::new(id, spec))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_identical_states_plan_nothing() {
        let target = set(vec![("a", json!({"v": 1})), ("b", json!({"v": 2}))]);
        let steps = plan(&target, &target.clone(), PlanPolicy::default());
        assert!(steps.is_empty());
    }

    #[test]
    fn test_empty_current_plans_adds_in_target_order() {
        let target = set(vec![("b", json!(1)), ("a", json!(2)), ("c", json!(3))]);
        let steps = plan(&target, &ResourceSet::new(), PlanPolicy::default());

        let ids: Vec<_> = steps.iter().map(|s| s.resource.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert!(steps.iter().all(|s| s.action == StepAction::Add));
    }

    #[test]
    fn test_empty_target_plans_removes() {
        let current = set(vec![("x", json!(1)), ("y", json!(2))]);
        let steps = plan(&ResourceSet::new(), &current, PlanPolicy::default());

        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.action == StepAction::Remove));
        // Remove steps carry identity only.
        assert!(steps.iter().all(|s| s.resource.spec == Value::Null));
    }

    #[test]
    fn test_spec_change_plans_update_with_target_payload() {
        let target = set(vec![("a", json!({"poll_ms": 5000}))]);
        let current = set(vec![("a", json!({"poll_ms": 1000}))]);

        let steps = plan(&target, &current, PlanPolicy::default());
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].action, StepAction::Update);
        assert_eq!(steps[0].resource.spec, json!({"poll_ms": 5000}));
    }

    #[test]
    fn test_groups_ordered_add_remove_update() {
        // sensor-1 changes spec, sensor-2 disappears, sensor-3 is new.
        let target = set(vec![
            ("sensor-1", json!({"poll_ms": 5000})),
            ("sensor-3", json!({"poll_ms": 2000})),
        ]);
        let current = set(vec![
            ("sensor-1", json!({"poll_ms": 1000})),
            ("sensor-2", json!({"poll_ms": 1000})),
        ]);

        let steps = plan(&target, &current, PlanPolicy::default());
        let summary: Vec<_> = steps
            .iter()
            .map(|s| (s.action, s.resource.id.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (StepAction::Add, "sensor-3"),
                (StepAction::Remove, "sensor-2"),
                (StepAction::Update, "sensor-1"),
            ]
        );
    }

    #[test]
    fn test_custom_group_order() {
        let target = set(vec![("new", json!(1))]);
        let current = set(vec![("old", json!(1))]);

        let policy = PlanPolicy {
            group_order: [StepAction::Remove, StepAction::Add, StepAction::Update],
        };
        let steps = plan(&target, &current, policy);
        let actions: Vec<_> = steps.iter().map(|s| s.action).collect();
        assert_eq!(actions, vec![StepAction::Remove, StepAction::Add]);
    }

    #[test]
    fn test_each_resource_in_at_most_one_step() {
        let target = set(vec![("a", json!(2)), ("b", json!(1))]);
        let current = set(vec![("a", json!(1)), ("c", json!(1))]);

        let steps = plan(&target, &current, PlanPolicy::default());
        let mut ids: Vec<_> = steps.iter().map(|s| s.resource.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), steps.len());
    }
}
