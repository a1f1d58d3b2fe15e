//! Request counters and the Status service

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tonic::{Request, Response, Status};

use dhctl_proto::status_server::Status as StatusRpc;
use dhctl_proto::{GetStatusRequest, GetStatusResponse, MethodCounters};

use crate::limiter::Limiter;

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    rejected: AtomicU64,
}

/// Counters of the DHCTL service
#[derive(Debug, Default)]
pub struct RequestStats {
    total: AtomicU64,
    rejected: AtomicU64,
    methods: DashMap<String, Counters>,
}

impl RequestStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_request(&self, method: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.methods
            .entry(method.to_string())
            .or_default()
            .total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Rejected by the limiter
    pub fn record_rejected(&self, method: &str) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.methods
            .entry(method.to_string())
            .or_default()
            .rejected
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, limiter: &Limiter) -> GetStatusResponse {
        GetStatusResponse {
            total_requests: self.total.load(Ordering::Relaxed),
            running_requests: limiter.running() as u64,
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            methods: self
                .methods
                .iter()
                .map(|entry| {
                    (
                        entry.key().clone(),
                        MethodCounters {
                            total: entry.total.load(Ordering::Relaxed),
                            rejected: entry.rejected.load(Ordering::Relaxed),
                        },
                    )
                })
                .collect(),
            parallel_tasks_limit: u32::try_from(limiter.limit()).unwrap_or(u32::MAX),
        }
    }
}

/// Status service; not subject to the limiter
#[derive(Debug, Clone)]
pub struct StatusService {
    stats: Arc<RequestStats>,
    limiter: Limiter,
}

impl StatusService {
    pub fn new(stats: Arc<RequestStats>, limiter: Limiter) -> Self {
        Self { stats, limiter }
    }
}

#[tonic::async_trait]
impl StatusRpc for StatusService {
    async fn get_status(
        &self,
        _request: Request<GetStatusRequest>,
    ) -> Result<Response<GetStatusResponse>, Status> {
        Ok(Response::new(self.stats.snapshot(&self.limiter)))
    }
}
