//! Operations and their phase lists

use std::fmt;

use serde::{Deserialize, Serialize};

/// Operation a phase list belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Create a cluster
    Bootstrap,
    /// Reconcile a cluster
    Converge,
    /// Report drift without changing anything
    Check,
    /// Remove a cluster
    Destroy,
    /// Remove what a failed bootstrap left behind
    Abort,
    /// Take a cluster under commander management
    CommanderAttach,
    /// Release a cluster from commander management
    CommanderDetach,
}

impl Operation {
    /// Wire name of the operation
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Bootstrap => "bootstrap",
            Operation::Converge => "converge",
            Operation::Check => "check",
            Operation::Destroy => "destroy",
            Operation::Abort => "abort",
            Operation::CommanderAttach => "commander-attach",
            Operation::CommanderDetach => "commander-detach",
        }
    }

    /// Phases of the operation in execution order
    pub fn phases(&self) -> Vec<PhaseWithSubPhases> {
        use OperationPhase::*;
        let plain = |phases: &[OperationPhase]| -> Vec<PhaseWithSubPhases> {
            phases.iter().map(|p| PhaseWithSubPhases::new(*p)).collect()
        };
        match self {
            Operation::Bootstrap => vec![
                PhaseWithSubPhases::new(BaseInfrastructure),
                PhaseWithSubPhases::new(RegistryPackagesProxy),
                PhaseWithSubPhases::new(ExecuteBashibleBundle),
                PhaseWithSubPhases {
                    phase: InstallDeckhouse,
                    sub_phases: vec![SubPhase::Connect, SubPhase::Install, SubPhase::Wait],
                    action: None,
                },
                PhaseWithSubPhases::new(InstallAdditionalMastersAndStaticNodes),
                PhaseWithSubPhases::new(CreateResources),
                PhaseWithSubPhases::new(ExecPostBootstrap),
                PhaseWithSubPhases::new(Finalization),
            ],
            Operation::Converge => plain(&[BaseInfrastructure, AllNodes, DeckhouseConfiguration]),
            Operation::Check => plain(&[Check]),
            Operation::Destroy => plain(&[DeleteResources, AllNodes, BaseInfrastructure]),
            Operation::Abort => plain(&[BaseInfrastructure]),
            Operation::CommanderAttach => plain(&[CommanderAttachCheck, CommanderAttachCapi]),
            Operation::CommanderDetach => plain(&[CommanderDetachCheck]),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named phase of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationPhase {
    BaseInfrastructure,
    RegistryPackagesProxy,
    ExecuteBashibleBundle,
    InstallDeckhouse,
    InstallAdditionalMastersAndStaticNodes,
    CreateResources,
    ExecPostBootstrap,
    Finalization,
    AllNodes,
    DeckhouseConfiguration,
    Check,
    DeleteResources,
    CommanderAttachCheck,
    CommanderAttachCapi,
    CommanderDetachCheck,
}

impl OperationPhase {
    /// Wire name of the phase
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationPhase::BaseInfrastructure => "base-infrastructure",
            OperationPhase::RegistryPackagesProxy => "registry-packages-proxy",
            OperationPhase::ExecuteBashibleBundle => "execute-bashible-bundle",
            OperationPhase::InstallDeckhouse => "install-deckhouse",
            OperationPhase::InstallAdditionalMastersAndStaticNodes => {
                "install-additional-masters-and-static-nodes"
            }
            OperationPhase::CreateResources => "create-resources",
            OperationPhase::ExecPostBootstrap => "exec-post-bootstrap",
            OperationPhase::Finalization => "finalization",
            OperationPhase::AllNodes => "all-nodes",
            OperationPhase::DeckhouseConfiguration => "deckhouse-configuration",
            OperationPhase::Check => "check",
            OperationPhase::DeleteResources => "delete-resources",
            OperationPhase::CommanderAttachCheck => "commander-attach-check",
            OperationPhase::CommanderAttachCapi => "commander-attach-capi",
            OperationPhase::CommanderDetachCheck => "commander-detach-check",
        }
    }

    /// Parse a wire name
    pub fn parse(name: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(name.to_string())).ok()
    }
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-phase subdividing a phase's share of the progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubPhase {
    /// Connect to the first master
    Connect,
    /// Install the platform
    Install,
    /// Wait for the platform to become ready
    Wait,
}

impl SubPhase {
    /// Wire name of the sub-phase
    pub fn as_str(&self) -> &'static str {
        match self {
            SubPhase::Connect => "connect",
            SubPhase::Install => "install",
            SubPhase::Wait => "wait",
        }
    }
}

/// How a phase was left
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseAction {
    /// Ran normally
    #[default]
    Default,
    /// Not executed
    Skip,
}

/// Phase entry of a progress report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseWithSubPhases {
    /// The phase
    pub phase: OperationPhase,
    /// Its sub-phases, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_phases: Vec<SubPhase>,
    /// Set to skip once the phase is known not to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<PhaseAction>,
}

impl PhaseWithSubPhases {
    /// A phase without sub-phases
    pub fn new(phase: OperationPhase) -> Self {
        Self {
            phase,
            sub_phases: Vec::new(),
            action: None,
        }
    }
}
