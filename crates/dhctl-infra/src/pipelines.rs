//! Pipelines over a runner
//!
//! Each pipeline is a fixed sequence of runner commands run inside one
//! span: apply (init, plan, apply, extract), destroy (init, destroy) and the
//! read-only checks (init, plan, classify).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, info_span, warn, Instrument};

use dhctl_common::Result;

use crate::outputs::{state_output, OutputsExtractor, PipelineOutputs, CLOUD_DISCOVERY_DATA};
use crate::plan::{PlanChanges, PlanDestructiveChanges, ValueChange};
use crate::runner::Runner;

/// Destructive changes of the base infrastructure
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BaseInfrastructureDestructiveChanges {
    #[serde(flatten)]
    pub plan: PlanDestructiveChanges,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_broken_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_zones_changed: Option<ValueChange>,
}

impl BaseInfrastructureDestructiveChanges {
    pub fn is_empty(&self) -> bool {
        self.plan.is_empty()
            && self.output_broken_reason.is_empty()
            && self.output_zones_changed.is_none()
    }
}

/// Outcome of a check pipeline
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlanCheck {
    pub changes: PlanChanges,
    pub destructive: Option<PlanDestructiveChanges>,
    /// Plan document, when the plan had changes
    pub plan: Option<Value>,
}

/// Outcome of the base-infrastructure check
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BaseInfraCheck {
    pub changes: PlanChanges,
    pub destructive: Option<BaseInfrastructureDestructiveChanges>,
    pub plan: Option<Value>,
}

/// Init, plan and apply; then collect the step outputs
pub async fn apply_pipeline(
    runner: &Runner,
    name: &str,
    extractor: &dyn OutputsExtractor,
) -> Result<PipelineOutputs> {
    async {
        runner.init().await?;
        runner.plan(false).await?;
        runner.apply().await?;
        let outputs = extractor.extract(runner).await?;
        info!(name, "Infrastructure applied");
        Ok(outputs)
    }
    .instrument(info_span!("apply_pipeline", name, step = %runner.step()))
    .await
}

/// Init and destroy; a state without resources is left alone
pub async fn destroy_pipeline(runner: &Runner, name: &str) -> Result<()> {
    async {
        runner.init().await?;
        if runner.resources_quantity_in_state() == 0 {
            info!(name, "Nothing to destroy, state has no resources");
            return Ok(());
        }
        runner.destroy().await?;
        info!(name, "Infrastructure destroyed");
        Ok(())
    }
    .instrument(info_span!("destroy_pipeline", name, step = %runner.step()))
    .await
}

async fn plan_check(runner: &Runner, destroy: bool) -> Result<PlanCheck> {
    runner.init().await?;
    let changes = runner.plan(destroy).await?;
    Ok(PlanCheck {
        changes,
        destructive: runner.plan_destructive_changes(),
        plan: runner.plan_report().map(|report| report.plan),
    })
}

/// Init and plan without applying
pub async fn check_pipeline(runner: &Runner, name: &str) -> Result<PlanCheck> {
    plan_check(runner, false)
        .instrument(info_span!("check_pipeline", name, step = %runner.step()))
        .await
}

/// Plan the destruction of `name`; used for nodes that should not exist
pub async fn check_destroy_pipeline(runner: &Runner, name: &str) -> Result<PlanCheck> {
    plan_check(runner, true)
        .instrument(info_span!("check_destroy_pipeline", name, step = %runner.step()))
        .await
}

fn zones(discovery: &Value) -> Value {
    discovery.get("zones").cloned().unwrap_or(Value::Null)
}

/// Check the base infrastructure, comparing discovered zones by hand
pub async fn check_base_infrastructure_pipeline(
    runner: &Runner,
    name: &str,
) -> Result<BaseInfraCheck> {
    async {
        let check = plan_check(runner, false).await?;
        let mut destructive = BaseInfrastructureDestructiveChanges {
            plan: check.destructive.clone().unwrap_or_default(),
            ..Default::default()
        };

        if let Some(report) = runner.plan_report() {
            let state = runner.state()?;
            match (
                state_output(&state, CLOUD_DISCOVERY_DATA),
                report.planned_output(CLOUD_DISCOVERY_DATA),
            ) {
                (Some(current), Some(next)) => {
                    let (current, next) = (zones(&current), zones(next));
                    if current != next {
                        warn!(name, current = %current, next = %next, "Discovered zones changed");
                        destructive.output_zones_changed = Some(ValueChange {
                            current_value: Some(current),
                            next_value: Some(next),
                            resource_type: String::new(),
                        });
                    }
                }
                (None, _) => {
                    destructive.output_broken_reason = format!(
                        "{CLOUD_DISCOVERY_DATA} output is absent in the state"
                    );
                }
                (_, None) => {
                    destructive.output_broken_reason = format!(
                        "{CLOUD_DISCOVERY_DATA} output is absent in the plan"
                    );
                }
            }
        }

        if destructive.is_empty() {
            return Ok(BaseInfraCheck {
                changes: check.changes,
                destructive: None,
                plan: check.plan,
            });
        }
        Ok(BaseInfraCheck {
            changes: PlanChanges::DestructiveChanges,
            destructive: Some(destructive),
            plan: check.plan,
        })
    }
    .instrument(info_span!("check_base_infrastructure_pipeline", name))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outputs::{BaseInfraOutputs, OnlyState};
    use crate::runner::tests::{calls, executor, FakeTool, APPLIED_STATE};
    use crate::runner::{ChangeSettings, RunnerParams, Step};
    use dhctl_common::cache::MemoryCache;
    use dhctl_common::confirm::AutoAnswer;
    use serde_json::json;
    use std::sync::Arc;

    fn runner(
        dir: &std::path::Path,
        tool: &FakeTool,
        state: Option<Value>,
        settings: ChangeSettings,
    ) -> Runner {
        let mut params = RunnerParams::new(
            Step::BaseInfrastructure,
            dir.join("layout"),
            dir.join("tmp"),
            b"{}".to_vec(),
        );
        params.state = state.map(|s| serde_json::to_vec(&s).unwrap());
        params.settings = settings;
        std::fs::create_dir_all(dir.join("cache")).unwrap();
        Runner::new(
            params,
            Arc::new(MemoryCache::new(dir.join("cache"))),
            Arc::new(AutoAnswer::no()),
            executor(dir, tool),
        )
        .unwrap()
    }

    fn check_settings() -> ChangeSettings {
        ChangeSettings {
            auto_dismiss_destructive: true,
            auto_dismiss_changes: true,
            skip_changes_on_deny: true,
            ..Default::default()
        }
    }

    fn discovery_state(zones: &[&str]) -> Value {
        json!({
            "resources": [{"type": "vpc"}],
            "outputs": {"cloud_discovery_data": {"value": {"zones": zones}}}
        })
    }

    fn planned_zones(zones: &[&str]) -> Value {
        json!({
            "planned_values": {"outputs": {"cloud_discovery_data": {"value": {"zones": zones}}}}
        })
    }

    #[tokio::test]
    async fn test_apply_pipeline_extracts_state() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ChangeSettings {
            auto_approve: true,
            ..Default::default()
        };
        let runner = runner(dir.path(), &FakeTool::default(), None, settings);

        let outputs = apply_pipeline(&runner, "base-infrastructure", &OnlyState).await.unwrap();
        assert_eq!(outputs.infrastructure_state, APPLIED_STATE.as_bytes());
        assert_eq!(calls(dir.path()), vec!["init", "plan", "show", "apply"]);
    }

    #[tokio::test]
    async fn test_apply_pipeline_with_base_infra_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ChangeSettings {
            auto_approve: true,
            ..Default::default()
        };
        let runner = runner(dir.path(), &FakeTool::default(), None, settings);

        // the fake tool prints every output as "<name>-value"
        let outputs = apply_pipeline(&runner, "base-infrastructure", &BaseInfraOutputs)
            .await
            .unwrap();
        assert_eq!(outputs.cloud_discovery, Some(json!("cloud_discovery_data-value")));
        assert_eq!(outputs.bastion_host.as_deref(), Some("bastion_ip_address_for_ssh-value"));
        assert_eq!(outputs.master_ip_for_ssh, None);
    }

    #[tokio::test]
    async fn test_destroy_pipeline_skips_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(
            dir.path(),
            &FakeTool::default(),
            Some(json!({"resources": []})),
            ChangeSettings::default(),
        );

        destroy_pipeline(&runner, "node-1").await.unwrap();
        assert_eq!(calls(dir.path()), vec!["init"]);
    }

    #[tokio::test]
    async fn test_destroy_pipeline_destroys_resources() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ChangeSettings {
            auto_approve: true,
            ..Default::default()
        };
        let state = json!({"resources": [{"type": "vm"}]});
        let runner = runner(dir.path(), &FakeTool::default(), Some(state), settings);

        destroy_pipeline(&runner, "node-1").await.unwrap();
        assert_eq!(calls(dir.path()), vec!["init", "destroy"]);
        assert_eq!(runner.resources_quantity_in_state(), 0);
    }

    #[tokio::test]
    async fn test_check_pipeline_never_applies() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(
            dir.path(),
            &FakeTool::destructive(),
            Some(json!({"resources": []})),
            check_settings(),
        );

        let check = check_pipeline(&runner, "node-0").await.unwrap();
        assert_eq!(check.changes, PlanChanges::DestructiveChanges);
        assert_eq!(check.destructive.unwrap().resources_deleted.len(), 1);
        assert!(check.plan.is_some());
        assert!(!calls(dir.path()).contains(&"apply".to_string()));
    }

    #[tokio::test]
    async fn test_zones_change_is_destructive() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FakeTool {
            show: planned_zones(&["a", "c"]),
            ..Default::default()
        };
        let runner = runner(
            dir.path(),
            &tool,
            Some(discovery_state(&["a", "b"])),
            check_settings(),
        );

        let check = check_base_infrastructure_pipeline(&runner, "base-infrastructure")
            .await
            .unwrap();
        assert_eq!(check.changes, PlanChanges::DestructiveChanges);
        let destructive = check.destructive.unwrap();
        assert!(destructive.plan.is_empty());
        assert_eq!(
            destructive.output_zones_changed,
            Some(ValueChange {
                current_value: Some(json!(["a", "b"])),
                next_value: Some(json!(["a", "c"])),
                resource_type: String::new(),
            })
        );
    }

    #[tokio::test]
    async fn test_same_zones_keep_plain_changes() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FakeTool {
            show: planned_zones(&["a", "b"]),
            ..Default::default()
        };
        let runner = runner(
            dir.path(),
            &tool,
            Some(discovery_state(&["a", "b"])),
            check_settings(),
        );

        let check = check_base_infrastructure_pipeline(&runner, "base-infrastructure")
            .await
            .unwrap();
        assert_eq!(check.changes, PlanChanges::Changes);
        assert_eq!(check.destructive, None);
    }

    #[tokio::test]
    async fn test_missing_discovery_output_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FakeTool {
            show: planned_zones(&["a"]),
            ..Default::default()
        };
        let runner = runner(dir.path(), &tool, Some(json!({"resources": []})), check_settings());

        let check = check_base_infrastructure_pipeline(&runner, "base-infrastructure")
            .await
            .unwrap();
        assert_eq!(check.changes, PlanChanges::DestructiveChanges);
        assert!(check.destructive.unwrap().output_broken_reason.contains("absent in the state"));
    }

    #[test]
    fn test_base_infra_changes_wire_format() {
        let changes = BaseInfrastructureDestructiveChanges {
            output_broken_reason: "broken".into(),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&changes).unwrap(),
            json!({"output_broken_reason": "broken"})
        );
    }
}
