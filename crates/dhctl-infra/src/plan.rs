//! Plan classification
//!
//! A plan is destructive iff any resource change includes a `delete`
//! action. Deletions that are followed by a `create` are reported as
//! recreations carrying both the current and the next value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use dhctl_common::{Error, Result};

/// Classification of a computed plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanChanges {
    /// Nothing to do
    #[default]
    NoChanges,
    /// Resources are created or updated in place
    Changes,
    /// At least one resource is deleted
    DestructiveChanges,
}

/// One deleted or recreated resource
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValueChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_value: Option<Value>,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub resource_type: String,
}

/// Destructive part of a plan
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanDestructiveChanges {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources_deleted: Vec<ValueChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources_recreated: Vec<ValueChange>,
}

impl PlanDestructiveChanges {
    /// Whether nothing is deleted or recreated
    pub fn is_empty(&self) -> bool {
        self.resources_deleted.is_empty() && self.resources_recreated.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ShowPlan {
    #[serde(default)]
    resource_changes: Vec<ResourceChange>,
}

#[derive(Debug, Deserialize)]
struct ResourceChange {
    #[serde(rename = "type", default)]
    resource_type: String,
    change: Change,
}

#[derive(Debug, Deserialize)]
struct Change {
    #[serde(default)]
    actions: Vec<String>,
    #[serde(default)]
    before: Option<Value>,
    #[serde(default)]
    after: Option<Value>,
}

/// Parsed `show -json` output of a plan file
#[derive(Debug, Clone, PartialEq)]
pub struct PlanReport {
    /// The whole plan document
    pub plan: Value,
    /// Deleted and recreated resources; `None` when nothing is deleted
    pub destructive: Option<PlanDestructiveChanges>,
}

impl PlanReport {
    /// Parse the JSON rendering of a plan
    pub fn parse(data: &[u8]) -> Result<Self> {
        let plan: Value = serde_json::from_slice(data)
            .map_err(|e| Error::serialization_for_kind("plan", format!("invalid plan json: {e}")))?;
        let show: ShowPlan = serde_json::from_value(plan.clone())
            .map_err(|e| {
                Error::serialization_for_kind("plan", format!("unexpected plan layout: {e}"))
            })?;

        let mut changes = PlanDestructiveChanges::default();
        for resource in show.resource_changes {
            let actions = &resource.change.actions;
            if !actions.iter().any(|a| a == "delete") {
                continue;
            }
            if actions.iter().any(|a| a == "create") {
                changes.resources_recreated.push(ValueChange {
                    current_value: resource.change.before,
                    next_value: resource.change.after,
                    resource_type: resource.resource_type,
                });
            } else {
                changes.resources_deleted.push(ValueChange {
                    current_value: resource.change.before,
                    next_value: None,
                    resource_type: resource.resource_type,
                });
            }
        }

        Ok(Self {
            plan,
            destructive: (!changes.is_empty()).then_some(changes),
        })
    }

    /// Classification of a plan whose exit code reported changes
    pub fn changes(&self) -> PlanChanges {
        if self.destructive.is_some() {
            PlanChanges::DestructiveChanges
        } else {
            PlanChanges::Changes
        }
    }

    /// Planned value of an output, if the plan knows it
    pub fn planned_output(&self, name: &str) -> Option<&Value> {
        let from_changes = self
            .plan
            .pointer(&format!("/output_changes/{name}/after"))
            .filter(|v| !v.is_null());
        from_changes.or_else(|| {
            self.plan
                .pointer(&format!("/planned_values/outputs/{name}/value"))
                .filter(|v| !v.is_null())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(changes: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({ "format_version": "1.1", "resource_changes": changes }))
            .unwrap()
    }

    #[test]
    fn test_updates_are_not_destructive() {
        let report = PlanReport::parse(&plan(json!([
            {"type": "yandex_compute_instance", "change": {"actions": ["update"], "before": {}, "after": {}}},
            {"type": "yandex_vpc_subnet", "change": {"actions": ["create"], "before": null, "after": {}}}
        ])))
        .unwrap();
        assert_eq!(report.destructive, None);
        assert_eq!(report.changes(), PlanChanges::Changes);
    }

    #[test]
    fn test_delete_and_recreate_are_separated() {
        let report = PlanReport::parse(&plan(json!([
            {"type": "disk", "change": {"actions": ["delete"], "before": {"name": "a"}, "after": null}},
            {"type": "vm", "change": {"actions": ["delete", "create"], "before": {"cores": 2}, "after": {"cores": 4}}}
        ])))
        .unwrap();

        let destructive = report.destructive.clone().unwrap();
        assert_eq!(report.changes(), PlanChanges::DestructiveChanges);
        assert_eq!(destructive.resources_deleted.len(), 1);
        assert_eq!(destructive.resources_deleted[0].resource_type, "disk");
        assert_eq!(destructive.resources_deleted[0].current_value, Some(json!({"name": "a"})));
        assert_eq!(destructive.resources_recreated[0].next_value, Some(json!({"cores": 4})));
    }

    #[test]
    fn test_value_change_wire_format() {
        let change = ValueChange {
            current_value: Some(json!({"name": "a"})),
            next_value: None,
            resource_type: "disk".into(),
        };
        assert_eq!(
            serde_json::to_value(&change).unwrap(),
            json!({"current_value": {"name": "a"}, "type": "disk"})
        );
    }

    #[test]
    fn test_planned_output_lookup() {
        let data = serde_json::to_vec(&json!({
            "output_changes": {"cloud_discovery_data": {"after": {"zones": ["a", "c"]}}},
            "planned_values": {"outputs": {"bastion": {"value": "1.1.1.1"}}}
        }))
        .unwrap();
        let report = PlanReport::parse(&data).unwrap();
        assert_eq!(
            report.planned_output("cloud_discovery_data"),
            Some(&json!({"zones": ["a", "c"]}))
        );
        assert_eq!(report.planned_output("bastion"), Some(&json!("1.1.1.1")));
        assert_eq!(report.planned_output("missing"), None);
    }

    #[test]
    fn test_invalid_plan_is_serialization_error() {
        assert!(matches!(
            PlanReport::parse(b"not json"),
            Err(Error::Serialization { .. })
        ));
    }
}
