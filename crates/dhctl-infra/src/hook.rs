//! Hooks around apply and destroy

use async_trait::async_trait;

use dhctl_common::Result;

use crate::plan::PlanChanges;

/// Runs around an apply or destroy that changes something.
///
/// The master controller uses this to check the remaining control plane
/// before a master is replaced.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InfraActionHook: Send + Sync {
    /// Prepare for the action; returns whether `after_action` must run.
    ///
    /// `changes` is the plan class of the apply; destroy passes
    /// [`PlanChanges::DestructiveChanges`].
    async fn before_action(&self, runner: &str, changes: PlanChanges) -> Result<bool>;

    /// Whether the action may start
    async fn is_ready(&self) -> Result<()>;

    /// Clean up after the action, whatever its result
    async fn after_action(&self, runner: &str) -> Result<()>;
}
