//! Public DHCTL service of the server process
//!
//! The gateway runs no operation itself. Every admitted stream gets a fresh
//! worker subprocess and is proxied to it message by message. The worker and
//! the limiter permit live exactly as long as the response stream.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::{Stream, StreamExt};
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use dhctl_proto::dhctl_client::DhctlClient;
use dhctl_proto::dhctl_server::Dhctl;
use dhctl_proto::{
    AbortRequest, AbortResponse, BootstrapRequest, BootstrapResponse, CheckRequest, CheckResponse,
    CommanderAttachRequest, CommanderAttachResponse, CommanderDetachRequest,
    CommanderDetachResponse, ConvergeRequest, ConvergeResponse, DestroyRequest, DestroyResponse,
};

use crate::limiter::Limiter;
use crate::status::RequestStats;
use crate::worker::WorkerLauncher;

pub type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

type Inbound<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Keeps `guard` alive until the stream is dropped
pub fn guarded<S, G>(stream: S, guard: G) -> impl Stream<Item = S::Item> + Send
where
    S: Stream + Send,
    G: Send + 'static,
{
    stream.map(move |item| {
        let _ = &guard;
        item
    })
}

#[derive(Clone)]
pub struct Gateway {
    launcher: WorkerLauncher,
    limiter: Limiter,
    stats: Arc<RequestStats>,
}

impl Gateway {
    pub fn new(launcher: WorkerLauncher, limiter: Limiter, stats: Arc<RequestStats>) -> Self {
        Self {
            launcher,
            limiter,
            stats,
        }
    }

    async fn proxy<Req, Resp, F, Fut>(
        &self,
        method: &'static str,
        request: Request<Streaming<Req>>,
        call: F,
    ) -> Result<Response<ResponseStream<Resp>>, Status>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: FnOnce(DhctlClient<Channel>, Inbound<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Streaming<Resp>>, Status>>,
    {
        self.stats.record_request(method);
        let permit = self.limiter.acquire(method).await.inspect_err(|status| {
            warn!(method, status = %status, "Request rejected");
            self.stats.record_rejected(method);
        })?;

        let worker = self.launcher.launch().await?;
        let client = worker.client()?;
        info!(method, socket = %worker.socket().display(), "Proxying stream to worker");

        // a failed client stream ends the forwarding, which the worker treats as cancel
        let inbound: Inbound<Req> = Box::pin(request.into_inner().map_while(Result::ok));
        let outbound = call(client, inbound).await?.into_inner();

        Ok(Response::new(Box::pin(guarded(outbound, (worker, permit)))))
    }
}

#[tonic::async_trait]
impl Dhctl for Gateway {
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
    ) -> Result<Response<Self::CheckStream>, Status> {
        self.proxy("Check", request, |mut client, inbound| async move {
            client.check(inbound).await
        })
        .await
    }

    async fn bootstrap(
        &self,
        request: Request<Streaming<BootstrapRequest>>,
    ) -> Result<Response<Self::BootstrapStream>, Status> {
        self.proxy("Bootstrap", request, |mut client, inbound| async move {
            client.bootstrap(inbound).await
        })
        .await
    }

    async fn destroy(
        &self,
        request: Request<Streaming<DestroyRequest>>,
    ) -> Result<Response<Self::DestroyStream>, Status> {
        self.proxy("Destroy", request, |mut client, inbound| async move {
            client.destroy(inbound).await
        })
        .await
    }

    async fn abort(
        &self,
        request: Request<Streaming<AbortRequest>>,
    ) -> Result<Response<Self::AbortStream>, Status> {
        self.proxy("Abort", request, |mut client, inbound| async move {
            client.abort(inbound).await
        })
        .await
    }

    async fn converge(
        &self,
        request: Request<Streaming<ConvergeRequest>>,
    ) -> Result<Response<Self::ConvergeStream>, Status> {
        self.proxy("Converge", request, |mut client, inbound| async move {
            client.converge(inbound).await
        })
        .await
    }

    async fn commander_attach(
        &self,
        request: Request<Streaming<CommanderAttachRequest>>,
    ) -> Result<Response<Self::CommanderAttachStream>, Status> {
        self.proxy("CommanderAttach", request, |mut client, inbound| async move {
            client.commander_attach(inbound).await
        })
        .await
    }

    async fn commander_detach(
        &self,
        request: Request<Streaming<CommanderDetachRequest>>,
    ) -> Result<Response<Self::CommanderDetachStream>, Status> {
        self.proxy("CommanderDetach", request, |mut client, inbound| async move {
            client.commander_detach(inbound).await
        })
        .await
    }
}
