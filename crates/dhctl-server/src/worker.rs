//! Worker subprocesses of the gateway
//!
//! Every operation runs in a fresh worker listening on its own unix socket
//! `<tmp>/<uuid>.sock`. The gateway waits for the worker's health service to
//! report SERVING before proxying the stream to it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tonic::transport::{Channel, Endpoint, Uri};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;
use tower::service_fn;
use tracing::{debug, info, warn};

use dhctl_proto::dhctl_client::DhctlClient;

use crate::config::{grpc_max_message_size, WorkerCommand};
use crate::error::{Result, ServerError};

/// gRPC name of the DHCTL service, checked on the worker's health endpoint
pub const DHCTL_SERVICE_NAME: &str = "dhctl.DHCTL";

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a released worker may take to exit on its own
const WORKER_EXIT_GRACE: Duration = Duration::from_secs(60);

/// Starts workers
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    command: WorkerCommand,
    tmp_dir: PathBuf,
    health_timeout: Duration,
}

impl WorkerLauncher {
    pub fn new(
        command: WorkerCommand,
        tmp_dir: impl Into<PathBuf>,
        health_timeout: Duration,
    ) -> Self {
        Self {
            command,
            tmp_dir: tmp_dir.into(),
            health_timeout,
        }
    }

    /// Spawn a worker and wait until it serves
    pub async fn launch(&self) -> Result<Worker> {
        std::fs::create_dir_all(&self.tmp_dir)
            .map_err(|e| ServerError::io(self.tmp_dir.display().to_string(), e))?;
        let socket = self.tmp_dir.join(format!("{}.sock", uuid::Uuid::new_v4()));

        let child = Command::new(&self.command.program)
            .args(&self.command.args)
            .arg("--socket")
            .arg(&socket)
            .arg("--tmp-dir")
            .arg(&self.tmp_dir)
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| {
                ServerError::WorkerStart(format!("{}: {e}", self.command.program.display()))
            })?;
        debug!(socket = %socket.display(), pid = ?child.id(), "Worker spawned");

        let mut worker = Worker {
            child: Some(child),
            socket,
            channel: None,
        };
        let channel = worker.wait_healthy(self.health_timeout).await?;
        worker.channel = Some(channel);
        info!(socket = %worker.socket.display(), "Worker is serving");
        Ok(worker)
    }
}

/// Channel over a unix socket; the URI is required by tonic and ignored
pub async fn connect_unix(socket: &Path) -> std::result::Result<Channel, tonic::transport::Error> {
    let socket = socket.to_path_buf();
    Endpoint::try_from("http://[::]:50051")?
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket).await?)) }
        }))
        .await
}

async fn is_serving(channel: Channel) -> bool {
    let request = HealthCheckRequest {
        service: DHCTL_SERVICE_NAME.to_string(),
    };
    match HealthClient::new(channel).check(request).await {
        Ok(response) => response.into_inner().status == ServingStatus::Serving as i32,
        Err(status) => {
            debug!(status = %status, "Worker health check failed");
            false
        }
    }
}

/// A running worker; it exits once its stream is over
#[derive(Debug)]
pub struct Worker {
    child: Option<Child>,
    socket: PathBuf,
    channel: Option<Channel>,
}

impl Worker {
    async fn wait_healthy(&mut self, timeout: Duration) -> Result<Channel> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(ServerError::WorkerStart(format!("worker exited with {status}")));
                }
            }
            if let Ok(channel) = connect_unix(&self.socket).await {
                if is_serving(channel.clone()).await {
                    return Ok(channel);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ServerError::WorkerUnhealthy {
                    socket: self.socket.clone(),
                    timeout,
                });
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn client(&self) -> Result<DhctlClient<Channel>> {
        let channel = self
            .channel
            .clone()
            .ok_or_else(|| ServerError::WorkerStart("worker is not connected".to_string()))?;
        Ok(DhctlClient::new(channel)
            .max_decoding_message_size(grpc_max_message_size())
            .max_encoding_message_size(grpc_max_message_size()))
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    socket = %self.socket.display(),
                    error = %e,
                    "Failed to remove worker socket"
                );
            }
        }
        let Some(mut child) = self.child.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            let _ = child.start_kill();
            return;
        };
        runtime.spawn(async move {
            if tokio::time::timeout(WORKER_EXIT_GRACE, child.wait()).await.is_err() {
                warn!(pid = ?child.id(), "Worker did not exit, killing it");
                let _ = child.kill().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = WorkerLauncher::new(
            WorkerCommand {
                program: dir.path().join("no-such-dhctl"),
                args: vec![],
            },
            dir.path(),
            Duration::from_secs(1),
        );
        let err = launcher.launch().await.unwrap_err();
        assert!(matches!(err, ServerError::WorkerStart(_)), "{err}");
    }

    #[tokio::test]
    async fn test_exited_worker_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = WorkerLauncher::new(
            WorkerCommand {
                program: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), "exit 3".to_string()],
            },
            dir.path(),
            Duration::from_secs(5),
        );
        let err = launcher.launch().await.unwrap_err();
        assert!(err.to_string().contains("exited"), "{err}");
    }

    #[tokio::test]
    async fn test_silent_worker_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = WorkerLauncher::new(
            WorkerCommand {
                program: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), "sleep 5".to_string()],
            },
            dir.path(),
            Duration::from_millis(300),
        );
        let err = launcher.launch().await.unwrap_err();
        assert!(matches!(err, ServerError::WorkerUnhealthy { .. }), "{err}");
        // the socket never appeared and nothing is left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
