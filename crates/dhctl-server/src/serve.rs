//! Entry points of the gateway and worker processes

use std::future::Future;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::info;

use dhctl_proto::dhctl_server::{Dhctl, DhctlServer};
use dhctl_proto::status_server::StatusServer;
use dhctl_proto::validation_server::ValidationServer;
use dhctl_proto::{
    AbortRequest, AbortResponse, BootstrapRequest, BootstrapResponse, CheckRequest, CheckResponse,
    CommanderAttachRequest, CommanderAttachResponse, CommanderDetachRequest,
    CommanderDetachResponse, ConvergeRequest, ConvergeResponse, DestroyRequest, DestroyResponse,
};

use crate::config::{grpc_max_message_size, ServerConfig, WorkerConfig};
use crate::error::{Result, ServerError};
use crate::gateway::{guarded, Gateway, ResponseStream};
use crate::limiter::Limiter;
use crate::log_forward::LogSink;
use crate::messages::{
    AbortMessages, BootstrapMessages, CheckMessages, CommanderAttachMessages,
    CommanderDetachMessages, ConvergeMessages, DestroyMessages, OperationMessages,
};
use crate::operations::Operations;
use crate::session;
use crate::status::{RequestStats, StatusService};
use crate::validation::ValidationService;
use crate::worker::WorkerLauncher;

/// Run the public server until `shutdown` resolves
pub async fn serve_gateway(config: ServerConfig, shutdown: impl Future<Output = ()>) -> Result<()> {
    let limiter = Limiter::new(config.parallel_tasks, config.request_timeout);
    let stats = RequestStats::new();
    let launcher = WorkerLauncher::new(
        config.worker.clone(),
        &config.tmp_dir,
        config.worker_health_timeout,
    );
    let gateway = Gateway::new(launcher, limiter.clone(), stats.clone());

    let (mut reporter, health) = tonic_health::server::health_reporter();
    reporter.set_serving::<DhctlServer<Gateway>>().await;

    let draining = limiter.clone();
    let shutdown = async move {
        shutdown.await;
        info!("Shutting down, no new operations are admitted");
        reporter.set_not_serving::<DhctlServer<Gateway>>().await;
        draining.close();
    };

    info!(
        address = %config.address,
        parallel_tasks = config.parallel_tasks,
        tmp_dir = %config.tmp_dir.display(),
        "Starting dhctl server"
    );

    Server::builder()
        .add_service(health)
        .add_service(
            DhctlServer::new(gateway)
                .max_decoding_message_size(grpc_max_message_size())
                .max_encoding_message_size(grpc_max_message_size()),
        )
        .add_service(ValidationServer::new(ValidationService))
        .add_service(StatusServer::new(StatusService::new(stats, limiter)))
        .serve_with_shutdown(config.address, shutdown)
        .await?;

    info!("dhctl server stopped");
    Ok(())
}

/// DHCTL service of a worker: runs the operation of the first stream and
/// stops the worker when that stream is over
#[derive(Clone)]
pub struct WorkerService {
    operations: Arc<dyn Operations>,
    log_sink: Option<LogSink>,
    done: CancellationToken,
}

impl WorkerService {
    pub fn new(
        operations: Arc<dyn Operations>,
        log_sink: Option<LogSink>,
        done: CancellationToken,
    ) -> Self {
        Self {
            operations,
            log_sink,
            done,
        }
    }

    fn session<M>(
        &self,
        request: Request<Streaming<M::Request>>,
    ) -> Response<ResponseStream<M::Response>>
    where
        M: OperationMessages,
    {
        let outbound = session::serve::<M, _>(
            self.operations.clone(),
            request.into_inner(),
            self.log_sink.clone(),
        );
        let done: DropGuard = self.done.clone().drop_guard();
        Response::new(Box::pin(guarded(outbound, done)))
    }
}

#[tonic::async_trait]
impl Dhctl for WorkerService {
    type CheckStream = ResponseStream<CheckResponse>;
    type BootstrapStream = ResponseStream<BootstrapResponse>;
    type DestroyStream = ResponseStream<DestroyResponse>;
    type AbortStream = ResponseStream<AbortResponse>;
    type ConvergeStream = ResponseStream<ConvergeResponse>;
    type CommanderAttachStream = ResponseStream<CommanderAttachResponse>;
    type CommanderDetachStream = ResponseStream<CommanderDetachResponse>;

    async fn check(
        &self,
        request: Request<Streaming<CheckRequest>>,
    ) -> std::result::Result<Response<Self::CheckStream>, Status> {
        Ok(self.session::<CheckMessages>(request))
    }

    async fn bootstrap(
        &self,
        request: Request<Streaming<BootstrapRequest>>,
    ) -> std::result::Result<Response<Self::BootstrapStream>, Status> {
        Ok(self.session::<BootstrapMessages>(request))
    }

    async fn destroy(
        &self,
        request: Request<Streaming<DestroyRequest>>,
    ) -> std::result::Result<Response<Self::DestroyStream>, Status> {
        Ok(self.session::<DestroyMessages>(request))
    }

    async fn abort(
        &self,
        request: Request<Streaming<AbortRequest>>,
    ) -> std::result::Result<Response<Self::AbortStream>, Status> {
        Ok(self.session::<AbortMessages>(request))
    }

    async fn converge(
        &self,
        request: Request<Streaming<ConvergeRequest>>,
    ) -> std::result::Result<Response<Self::ConvergeStream>, Status> {
        Ok(self.session::<ConvergeMessages>(request))
    }

    async fn commander_attach(
        &self,
        request: Request<Streaming<CommanderAttachRequest>>,
    ) -> std::result::Result<Response<Self::CommanderAttachStream>, Status> {
        Ok(self.session::<CommanderAttachMessages>(request))
    }

    async fn commander_detach(
        &self,
        request: Request<Streaming<CommanderDetachRequest>>,
    ) -> std::result::Result<Response<Self::CommanderDetachStream>, Status> {
        Ok(self.session::<CommanderDetachMessages>(request))
    }
}

/// Run a worker on its unix socket until its operation stream is over
pub async fn serve_worker(
    config: WorkerConfig,
    operations: Arc<dyn Operations>,
    log_sink: Option<LogSink>,
) -> Result<()> {
    let listener = UnixListener::bind(&config.socket)
        .map_err(|e| ServerError::io(config.socket.display().to_string(), e))?;
    let incoming = UnixListenerStream::new(listener);

    let done = CancellationToken::new();
    let service = WorkerService::new(operations, log_sink, done.clone());

    let (mut reporter, health) = tonic_health::server::health_reporter();
    reporter.set_serving::<DhctlServer<WorkerService>>().await;
    info!(socket = %config.socket.display(), "Worker listening");

    Server::builder()
        .add_service(health)
        .add_service(
            DhctlServer::new(service)
                .max_decoding_message_size(grpc_max_message_size())
                .max_encoding_message_size(grpc_max_message_size()),
        )
        .serve_with_incoming_shutdown(incoming, async move { done.cancelled().await })
        .await?;

    let _ = std::fs::remove_file(&config.socket);
    info!("Worker finished");
    Ok(())
}
