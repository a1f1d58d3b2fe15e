//! Server side of one operation stream
//!
//! ```text
//! initial ──Start──► running ──phase boundary──► waiting
//!                       ▲                           │
//!                       └─────────Continue──────────┘
//! ```
//!
//! Messages that do not fit the current state are logged and dropped. The
//! operation runs in its own task; a reader loop, a writer task and the log
//! forwarder feed the stream. Everything sent to the client goes through
//! the writer, which keeps the emission order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tracing::{debug, info, info_span, warn, Instrument};

use dhctl_common::retry::{retry_with_backoff_if, RetryConfig};
use dhctl_common::tomb::Tomb;
use dhctl_common::{Error, Result};
use dhctl_phases::{OnProgress, PhaseBoundary, PhaseHandler, PhaseOutcome, PhasedExecutionContext};
use dhctl_proto as proto;

use crate::log_forward::{LogSink, LogSinkGuard};
use crate::messages::{
    self, ClientMessage, Decision, OperationMessages, ServerMessage, StartRequest,
};
use crate::operations::{OperationSession, Operations};

/// Responses buffered towards the transport
const RESPONSE_BUFFER: usize = 64;

/// One attempt of a write to the client
const SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Log lines batched into one `Logs` message
const MAX_LOG_BATCH: usize = 100;

type PhaseReply = oneshot::Sender<Result<PhaseOutcome>>;

/// Hands phase boundaries to the session and waits for the client's decision
struct RpcPhaseHandler {
    boundaries: mpsc::Sender<(PhaseBoundary, PhaseReply)>,
}

#[async_trait]
impl PhaseHandler for RpcPhaseHandler {
    async fn on_phase(&self, boundary: PhaseBoundary) -> Result<PhaseOutcome> {
        let (reply, decision) = oneshot::channel();
        self.boundaries
            .send((boundary, reply))
            .await
            .map_err(|_| Error::ConvergeInterrupted)?;
        decision.await.map_err(|_| Error::ConvergeInterrupted)?
    }
}

fn phase_outcome(decision: Decision) -> Result<PhaseOutcome> {
    match decision {
        Decision::NextPhase => Ok(PhaseOutcome::Continue),
        Decision::StopOperation => Ok(PhaseOutcome::StopOperation),
        Decision::Error(message) => Err(Error::internal_with_context("client", message)),
    }
}

/// Serve one stream; the returned stream carries the responses
pub fn serve<M, S>(
    operations: Arc<dyn Operations>,
    inbound: S,
    log_sink: Option<LogSink>,
) -> ReceiverStream<std::result::Result<M::Response, Status>>
where
    M: OperationMessages,
    S: Stream<Item = std::result::Result<M::Request, Status>> + Send + Unpin + 'static,
{
    let (responses, rx) = mpsc::channel(RESPONSE_BUFFER);
    tokio::spawn(
        run::<M, S>(operations, inbound, responses, log_sink)
            .instrument(info_span!("session", operation = %M::OPERATION)),
    );
    ReceiverStream::new(rx)
}

async fn write<M: OperationMessages>(
    mut messages: mpsc::UnboundedReceiver<ServerMessage>,
    responses: mpsc::Sender<std::result::Result<M::Response, Status>>,
) {
    let retry = RetryConfig::stream_send().silent();
    let responses = &responses;
    while let Some(message) = messages.recv().await {
        let sent = retry_with_backoff_if(
            &retry,
            "stream send",
            || {
                let response = M::response(message.clone());
                async move { responses.send_timeout(Ok(response), SEND_TIMEOUT).await }
            },
            |e| matches!(e, SendTimeoutError::Timeout(_)),
        )
        .await;
        match sent {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                warn!("Client does not read the stream, message dropped")
            }
            Err(SendTimeoutError::Closed(_)) => {
                debug!("Client stream closed");
                return;
            }
        }
    }
}

/// Attach the sink and batch its lines into `Logs` messages
fn forward_logs(
    sink: &LogSink,
    out: mpsc::UnboundedSender<ServerMessage>,
) -> (LogSinkGuard, JoinHandle<()>) {
    let (tx, mut lines) = mpsc::unbounded_channel();
    let guard = sink.attach(tx);
    let handle = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            let mut logs = vec![line];
            while logs.len() < MAX_LOG_BATCH {
                match lines.try_recv() {
                    Ok(line) => logs.push(line),
                    Err(_) => break,
                }
            }
            if out.send(ServerMessage::Logs(proto::Logs { logs })).is_err() {
                return;
            }
        }
    });
    (guard, handle)
}

async fn wait_start<M, S>(inbound: &mut S) -> Option<StartRequest>
where
    M: OperationMessages,
    S: Stream<Item = std::result::Result<M::Request, Status>> + Unpin,
{
    while let Some(message) = inbound.next().await {
        match message.map(M::client_message) {
            Ok(Some(ClientMessage::Start(start))) => return Some(*start),
            Ok(Some(other)) => warn!(message = ?other, "Operation is not started, message ignored"),
            Ok(None) => warn!("Empty message ignored"),
            Err(status) => {
                debug!(status = %status, "Client stream failed before start");
                return None;
            }
        }
    }
    None
}

fn failed_result(err: JoinError, phases: &PhasedExecutionContext) -> proto::OperationResult {
    let err = if err.is_panic() {
        let panic = err.into_panic();
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        warn!(panic = %message, "Operation panicked");
        format!("panic: {message}")
    } else {
        Error::ConvergeInterrupted.to_string()
    };
    proto::OperationResult {
        state: phases.last_state().into_iter().collect(),
        result: String::new(),
        err,
    }
}

/// Cancel requests seen by a running operation
struct Cancellation {
    tomb: Arc<Tomb>,
    requests: u32,
}

impl Cancellation {
    fn requested(&self) -> bool {
        self.requests > 0
    }

    /// First cancel interrupts the operation, a second one aborts it
    fn cancel(
        &mut self,
        waiting: &mut Option<PhaseReply>,
        operation: &JoinHandle<proto::OperationResult>,
    ) {
        self.requests += 1;
        if self.requests > 1 {
            warn!("Second cancel, aborting the operation");
            operation.abort();
            return;
        }
        info!("Cancel requested, interrupting the operation");
        if let Some(reply) = waiting.take() {
            let _ = reply.send(Err(Error::ConvergeInterrupted));
        }
        let tomb = self.tomb.clone();
        tokio::spawn(async move {
            tomb.shutdown("client cancel").await;
        });
    }
}

async fn run<M, S>(
    operations: Arc<dyn Operations>,
    mut inbound: S,
    responses: mpsc::Sender<std::result::Result<M::Response, Status>>,
    log_sink: Option<LogSink>,
) where
    M: OperationMessages,
    S: Stream<Item = std::result::Result<M::Request, Status>> + Send + Unpin + 'static,
{
    let (out, messages) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write::<M>(messages, responses));

    let Some(start) = wait_start::<M, S>(&mut inbound).await else {
        debug!("Stream closed before the operation started");
        drop(out);
        let _ = writer.await;
        return;
    };
    info!("Operation started");
    let logs = log_sink.map(|sink| forward_logs(&sink, out.clone()));

    let tomb = Tomb::new();
    let (boundaries_tx, mut boundaries) = mpsc::channel(1);
    let progress_out = out.clone();
    let on_progress: OnProgress = Box::new(move |progress| {
        // a gone client does not fail the operation
        let _ = progress_out.send(ServerMessage::Progress(messages::progress(progress)));
        Ok(())
    });
    let phases = PhasedExecutionContext::new(
        M::OPERATION,
        Arc::new(RpcPhaseHandler {
            boundaries: boundaries_tx,
        }),
        Some(on_progress),
    );

    let session = OperationSession {
        phases: phases.clone(),
        tomb: tomb.clone(),
    };
    let mut operation = tokio::spawn(async move { operations.run(start, session).await });

    let mut cancellation = Cancellation { tomb, requests: 0 };
    let mut waiting: Option<PhaseReply> = None;
    let mut inbound_open = true;

    let result = loop {
        tokio::select! {
            joined = &mut operation => break match joined {
                Ok(result) => result,
                Err(e) => failed_result(e, &phases),
            },
            Some((boundary, reply)) = boundaries.recv(), if waiting.is_none() => {
                if cancellation.requested() {
                    let _ = reply.send(Err(Error::ConvergeInterrupted));
                    continue;
                }
                debug!(next_phase = ?boundary.next_phase, "Waiting for the client to continue");
                let _ = out.send(ServerMessage::PhaseEnd(messages::phase_end(&boundary)));
                waiting = Some(reply);
            }
            message = inbound.next(), if inbound_open => match message {
                Some(Ok(request)) => match M::client_message(request) {
                    Some(ClientMessage::Continue(decision)) => match waiting.take() {
                        Some(reply) => {
                            debug!(decision = ?decision, "Client continued");
                            let _ = reply.send(phase_outcome(decision));
                        }
                        None => warn!("Continue while the operation is running, ignored"),
                    },
                    Some(ClientMessage::Cancel) => cancellation.cancel(&mut waiting, &operation),
                    Some(ClientMessage::Start(_)) => {
                        warn!("Operation already started, start ignored")
                    }
                    None => warn!("Empty message ignored"),
                },
                Some(Err(status)) => {
                    warn!(status = %status, "Client stream failed");
                    inbound_open = false;
                    cancellation.cancel(&mut waiting, &operation);
                }
                None => {
                    debug!("Client closed its side of the stream");
                    inbound_open = false;
                    cancellation.cancel(&mut waiting, &operation);
                }
            },
        }
    };
    info!(failed = !result.err.is_empty(), "Operation finished");

    // no log line may follow the result
    if let Some((guard, handle)) = logs {
        drop(guard);
        let _ = handle.await;
    }
    let _ = out.send(ServerMessage::Result(result));
    drop(out);
    drop(phases);
    drop(boundaries);
    let _ = writer.await;
}
