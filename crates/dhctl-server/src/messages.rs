//! Mapping between the per-operation stream messages and the session
//!
//! Every DHCTL rpc has its own request and response types with the same
//! oneof shape. [`OperationMessages`] folds them into [`ClientMessage`] and
//! [`ServerMessage`] so one session state machine serves all of them.

use serde_json::Value;

use dhctl_phases::{
    Operation, PhaseAction, PhaseBoundary, PhaseWithSubPhases as PhaseEntry,
    Progress as PhaseProgress,
};
use dhctl_proto as proto;

/// Start message of any operation
#[derive(Debug, Clone, PartialEq)]
pub enum StartRequest {
    Check(proto::CheckStart),
    Bootstrap(proto::BootstrapStart),
    Destroy(proto::DestroyStart),
    Abort(proto::AbortStart),
    Converge(proto::ConvergeStart),
    CommanderAttach(proto::CommanderAttachStart),
    CommanderDetach(proto::CommanderDetachStart),
}

impl StartRequest {
    pub fn operation(&self) -> Operation {
        match self {
            StartRequest::Check(_) => Operation::Check,
            StartRequest::Bootstrap(_) => Operation::Bootstrap,
            StartRequest::Destroy(_) => Operation::Destroy,
            StartRequest::Abort(_) => Operation::Abort,
            StartRequest::Converge(_) => Operation::Converge,
            StartRequest::CommanderAttach(_) => Operation::CommanderAttach,
            StartRequest::CommanderDetach(_) => Operation::CommanderDetach,
        }
    }
}

/// Client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Start(Box<StartRequest>),
    Continue(Decision),
    Cancel,
}

/// How the client answered a phase end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NextPhase,
    StopOperation,
    Error(String),
}

impl Decision {
    /// `None` for an unspecified decision
    pub fn from_proto(request: &proto::ContinueRequest) -> Option<Self> {
        match proto::Continue::try_from(request.decision).ok()? {
            proto::Continue::Unspecified => None,
            proto::Continue::NextPhase => Some(Decision::NextPhase),
            proto::Continue::StopOperation => Some(Decision::StopOperation),
            proto::Continue::Error => Some(Decision::Error(request.err.clone())),
        }
    }
}

/// Server to client
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Result(proto::OperationResult),
    PhaseEnd(proto::PhaseEnd),
    Logs(proto::Logs),
    Progress(proto::Progress),
}

/// Request and response types of one DHCTL rpc
pub trait OperationMessages: Send + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    const OPERATION: Operation;

    /// `None` for a request without a message
    fn client_message(request: Self::Request) -> Option<ClientMessage>;

    fn response(message: ServerMessage) -> Self::Response;
}

macro_rules! operation_messages {
    (
        $marker:ident,
        $operation:ident,
        $start:ident,
        $request:ident,
        $request_mod:ident,
        $response:ident,
        $response_mod:ident
    ) => {
        #[derive(Debug, Clone, Copy)]
        pub struct $marker;

        impl OperationMessages for $marker {
            type Request = proto::$request;
            type Response = proto::$response;

            const OPERATION: Operation = Operation::$operation;

            fn client_message(request: proto::$request) -> Option<ClientMessage> {
                use proto::$request_mod::Message;
                Some(match request.message? {
                    Message::Start(start) => {
                        ClientMessage::Start(Box::new(StartRequest::$start(start)))
                    }
                    Message::Continue(request) => {
                        ClientMessage::Continue(Decision::from_proto(&request)?)
                    }
                    Message::Cancel(_) => ClientMessage::Cancel,
                })
            }

            fn response(message: ServerMessage) -> proto::$response {
                use proto::$response_mod::Message;
                let message = match message {
                    ServerMessage::Result(result) => Message::Result(result),
                    ServerMessage::PhaseEnd(phase_end) => Message::PhaseEnd(phase_end),
                    ServerMessage::Logs(logs) => Message::Logs(logs),
                    ServerMessage::Progress(progress) => Message::Progress(progress),
                };
                proto::$response { message: Some(message) }
            }
        }
    };
}

operation_messages!(
    CheckMessages,
    Check,
    Check,
    CheckRequest,
    check_request,
    CheckResponse,
    check_response
);
operation_messages!(
    BootstrapMessages,
    Bootstrap,
    Bootstrap,
    BootstrapRequest,
    bootstrap_request,
    BootstrapResponse,
    bootstrap_response
);
operation_messages!(
    DestroyMessages,
    Destroy,
    Destroy,
    DestroyRequest,
    destroy_request,
    DestroyResponse,
    destroy_response
);
operation_messages!(
    AbortMessages,
    Abort,
    Abort,
    AbortRequest,
    abort_request,
    AbortResponse,
    abort_response
);
operation_messages!(
    ConvergeMessages,
    Converge,
    Converge,
    ConvergeRequest,
    converge_request,
    ConvergeResponse,
    converge_response
);
operation_messages!(
    CommanderAttachMessages,
    CommanderAttach,
    CommanderAttach,
    CommanderAttachRequest,
    commander_attach_request,
    CommanderAttachResponse,
    commander_attach_response
);
operation_messages!(
    CommanderDetachMessages,
    CommanderDetach,
    CommanderDetach,
    CommanderDetachRequest,
    commander_detach_request,
    CommanderDetachResponse,
    commander_detach_response
);

fn or_empty<T: AsRef<str>>(value: Option<T>) -> String {
    value.map(|v| v.as_ref().to_string()).unwrap_or_default()
}

fn phase_entry(entry: &PhaseEntry) -> proto::PhaseWithSubPhases {
    let action = entry.action.map(|action| match action {
        PhaseAction::Default => "default",
        PhaseAction::Skip => "skip",
    });
    proto::PhaseWithSubPhases {
        phase: entry.phase.as_str().to_string(),
        action: or_empty(action),
        sub_phases: entry.sub_phases.iter().map(|s| s.as_str().to_string()).collect(),
    }
}

pub fn progress(progress: &PhaseProgress) -> proto::Progress {
    proto::Progress {
        operation: progress.operation.as_str().to_string(),
        progress: progress.progress,
        completed_phase: or_empty(progress.completed_phase.map(|p| p.as_str())),
        current_phase: or_empty(progress.current_phase.map(|p| p.as_str())),
        next_phase: or_empty(progress.next_phase.map(|p| p.as_str())),
        completed_sub_phase: or_empty(progress.completed_sub_phase.map(|s| s.as_str())),
        current_sub_phase: or_empty(progress.current_sub_phase.map(|s| s.as_str())),
        next_sub_phase: or_empty(progress.next_sub_phase.map(|s| s.as_str())),
        phases: progress.phases.iter().map(phase_entry).collect(),
    }
}

fn json_bytes(data: Option<&Value>) -> Vec<u8> {
    data.and_then(|value| serde_json::to_vec(value).ok())
        .unwrap_or_default()
}

pub fn phase_end(boundary: &PhaseBoundary) -> proto::PhaseEnd {
    proto::PhaseEnd {
        completed_phase: or_empty(boundary.completed_phase.map(|p| p.as_str())),
        completed_phase_state: boundary
            .completed_phase_state
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        completed_phase_data: json_bytes(boundary.completed_phase_data.as_ref()),
        next_phase: or_empty(boundary.next_phase.map(|p| p.as_str())),
        next_phase_critical: boundary.next_phase_critical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dhctl_phases::{OperationPhase, SubPhase};
    use serde_json::json;

    #[test]
    fn test_continue_decisions() {
        let request = |decision: proto::Continue, err: &str| proto::ContinueRequest {
            decision: decision as i32,
            err: err.to_string(),
        };
        assert_eq!(
            Decision::from_proto(&request(proto::Continue::NextPhase, "")),
            Some(Decision::NextPhase)
        );
        assert_eq!(
            Decision::from_proto(&request(proto::Continue::Error, "bad plan")),
            Some(Decision::Error("bad plan".to_string()))
        );
        assert_eq!(Decision::from_proto(&request(proto::Continue::Unspecified, "")), None);
        assert_eq!(
            Decision::from_proto(&proto::ContinueRequest { decision: 42, err: String::new() }),
            None
        );
    }

    #[test]
    fn test_request_without_message_is_dropped() {
        assert_eq!(
            ConvergeMessages::client_message(proto::ConvergeRequest { message: None }),
            None
        );

        let cancel = proto::DestroyRequest {
            message: Some(proto::destroy_request::Message::Cancel(proto::CancelRequest {})),
        };
        assert_eq!(DestroyMessages::client_message(cancel), Some(ClientMessage::Cancel));
    }

    #[test]
    fn test_start_carries_its_operation() {
        let start = proto::CommanderAttachRequest {
            message: Some(proto::commander_attach_request::Message::Start(
                proto::CommanderAttachStart::default(),
            )),
        };
        let Some(ClientMessage::Start(start)) = CommanderAttachMessages::client_message(start)
        else {
            panic!("expected start");
        };
        assert_eq!(start.operation(), Operation::CommanderAttach);
        assert_eq!(start.operation(), CommanderAttachMessages::OPERATION);
    }

    #[test]
    fn test_phase_end_encodes_data_as_json() {
        let boundary = PhaseBoundary {
            completed_phase: Some(OperationPhase::BaseInfrastructure),
            completed_phase_state: [
                ("base-infrastructure.tfstate".to_string(), b"{}".to_vec()),
            ]
            .into(),
            completed_phase_data: Some(json!({"masterAddress": "10.0.0.1"})),
            next_phase: Some(OperationPhase::AllNodes),
            next_phase_critical: true,
        };
        let end = phase_end(&boundary);
        assert_eq!(end.completed_phase, "base-infrastructure");
        assert_eq!(end.next_phase, "all-nodes");
        assert!(end.next_phase_critical);
        assert_eq!(end.completed_phase_state["base-infrastructure.tfstate"], b"{}".to_vec());
        let data: Value = serde_json::from_slice(&end.completed_phase_data).unwrap();
        assert_eq!(data["masterAddress"], "10.0.0.1");

        let last = phase_end(&PhaseBoundary {
            next_phase: None,
            completed_phase_data: None,
            ..boundary
        });
        assert_eq!(last.next_phase, "");
        assert!(last.completed_phase_data.is_empty());
    }

    #[test]
    fn test_progress_names_phases_on_the_wire() {
        let report = PhaseProgress {
            operation: Operation::Bootstrap,
            progress: 0.5,
            completed_phase: Some(OperationPhase::ExecuteBashibleBundle),
            current_phase: Some(OperationPhase::InstallDeckhouse),
            next_phase: Some(OperationPhase::InstallAdditionalMastersAndStaticNodes),
            completed_sub_phase: None,
            current_sub_phase: Some(SubPhase::Connect),
            next_sub_phase: Some(SubPhase::Install),
            phases: vec![PhaseEntry {
                phase: OperationPhase::BaseInfrastructure,
                sub_phases: vec![],
                action: Some(PhaseAction::Skip),
            }],
        };
        let wire = progress(&report);
        assert_eq!(wire.operation, "bootstrap");
        assert_eq!(wire.current_phase, "install-deckhouse");
        assert_eq!(wire.completed_sub_phase, "");
        assert_eq!(wire.current_sub_phase, "connect");
        assert_eq!(wire.phases[0].action, "skip");
    }
}
