//! Remote dispatcher
//!
//! Batches open/close operations per storage node into `send_batch` calls and
//! decides what to do with every failure:
//!
//! - `Timeout`: retry the same node with exponential backoff up to
//!   `max_timeout_retries`, then expire the node and fail the batch
//! - `NotYetRunning`: retry the same node after a fixed delay while it is live
//! - `QueueTooBig`: retry the same node with a growing delay, never redirect
//! - `Unreachable` / `Remote`: fail every pending and in-flight operation for
//!   the node as outcome-unknown
//!
//! A response that omits an operation is treated as a hang; the owning
//! procedure keeps waiting for a transition report or a crash.

use crate::assignment::{NodeRegistry, RegionInfo, ServerName};
use crate::common::metrics::DispatchMetrics;
use crate::common::{DispatcherConfig, Error, Result};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRegionRequest {
    pub op_id: u64,
    pub region: RegionInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseRegionRequest {
    pub op_id: u64,
    pub region: RegionInfo,
    pub destination: Option<ServerName>,
}

/// One batched call to a storage node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub opens: Vec<OpenRegionRequest>,
    pub closes: Vec<CloseRegionRequest>,
}

impl ExecuteRequest {
    pub fn len(&self) -> usize {
        self.opens.len() + self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opens.is_empty() && self.closes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenResult {
    /// Accepted; the node reports the outcome later
    Opened,
    AlreadyOpened,
    FailedOpening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseResult {
    Closed,
    NotClosed,
    /// The node does not host the region
    NotServing,
}

/// Per-operation results, keyed by op id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub opens: Vec<(u64, OpenResult)>,
    pub closes: Vec<(u64, CloseResult)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("call timed out")]
    Timeout,

    #[error("server is not running yet")]
    NotYetRunning,

    #[error("call queue is full")]
    QueueTooBig,

    #[error("server unreachable: {0}")]
    Unreachable(String),

    #[error("remote error: {0}")]
    Remote(String),
}

/// Sends batched requests to storage nodes
pub trait RegionServerTransport: Send + Sync {
    fn send_batch(
        &self,
        server: &ServerName,
        request: ExecuteRequest,
    ) -> BoxFuture<'static, std::result::Result<ExecuteResponse, TransportError>>;
}

/// What the dispatcher learned about one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Open(OpenResult),
    Close(CloseResult),
    /// The node may or may not have applied the operation
    Unknown(String),
}

/// Receives per-operation outcomes
pub trait DispatchListener: Send + Sync {
    fn operation_completed(
        &self,
        server: &ServerName,
        region: &RegionInfo,
        op_id: u64,
        outcome: DispatchOutcome,
    );

    /// Timeouts exhausted against a node that still looks live
    fn server_unresponsive(&self, server: &ServerName);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOperation {
    Open {
        op_id: u64,
        region: RegionInfo,
    },
    Close {
        op_id: u64,
        region: RegionInfo,
        destination: Option<ServerName>,
    },
}

impl RemoteOperation {
    pub fn op_id(&self) -> u64 {
        match self {
            RemoteOperation::Open { op_id, .. } | RemoteOperation::Close { op_id, .. } => *op_id,
        }
    }

    pub fn region(&self) -> &RegionInfo {
        match self {
            RemoteOperation::Open { region, .. } | RemoteOperation::Close { region, .. } => region,
        }
    }
}

#[derive(Default)]
struct ServerQueue {
    pending: Vec<RemoteOperation>,
    in_flight: Vec<RemoteOperation>,
    draining: bool,
    dead: bool,
}

pub struct RemoteDispatcher {
    config: DispatcherConfig,
    transport: Arc<dyn RegionServerTransport>,
    registry: Arc<dyn NodeRegistry>,
    listener: Arc<dyn DispatchListener>,
    metrics: Arc<DispatchMetrics>,
    queues: Mutex<HashMap<ServerName, ServerQueue>>,
    next_op_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl RemoteDispatcher {
    pub fn new(
        config: DispatcherConfig,
        transport: Arc<dyn RegionServerTransport>,
        registry: Arc<dyn NodeRegistry>,
        listener: Arc<dyn DispatchListener>,
        metrics: Arc<DispatchMetrics>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            transport,
            registry,
            listener,
            metrics,
            queues: Mutex::new(HashMap::new()),
            next_op_id: AtomicU64::new(1),
            shutdown_tx,
        })
    }

    pub fn next_op_id(&self) -> u64 {
        self.next_op_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Queue `operation` for `server`. Fails if the server is dead.
    pub fn enqueue(self: &Arc<Self>, server: &ServerName, operation: RemoteOperation) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(Error::ShuttingDown);
        }
        if !self.registry.is_live(server) {
            return Err(Error::ServerNotLive(server.to_string()));
        }

        let start_drain = {
            let mut queues = self.queues.lock();
            let queue = queues.entry(server.clone()).or_default();
            if queue.dead {
                return Err(Error::ServerNotLive(server.to_string()));
            }
            queue.pending.push(operation);
            !std::mem::replace(&mut queue.draining, true)
        };

        if start_drain {
            let dispatcher = self.clone();
            let server = server.clone();
            tokio::spawn(async move {
                dispatcher.drain(server).await;
            });
        }
        Ok(())
    }

    /// Fail everything queued or in flight for `server` as outcome-unknown and
    /// refuse further operations for it
    pub fn server_dead(&self, server: &ServerName) {
        let failed = {
            let mut queues = self.queues.lock();
            let queue = queues.entry(server.clone()).or_default();
            queue.dead = true;
            let mut failed = std::mem::take(&mut queue.pending);
            failed.append(&mut queue.in_flight);
            failed
        };

        if !failed.is_empty() {
            info!(
                "Failing {} operations for dead server {}",
                failed.len(),
                server
            );
        }
        self.fail_operations(server, failed, "server is dead");
    }

    /// Operations queued or in flight for `server`
    pub fn queued(&self, server: &ServerName) -> usize {
        self.queues
            .lock()
            .get(server)
            .map_or(0, |q| q.pending.len() + q.in_flight.len())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Sleep unless shut down first. Returns false on shutdown.
    async fn pause(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => false,
        }
    }

    async fn drain(self: Arc<Self>, server: ServerName) {
        loop {
            if !self.pause(self.config.batch_delay()).await {
                return;
            }

            let batch = {
                let mut queues = self.queues.lock();
                let Some(queue) = queues.get_mut(&server) else {
                    return;
                };
                if queue.dead || queue.pending.is_empty() {
                    queue.draining = false;
                    return;
                }
                let take = queue.pending.len().min(self.config.max_batch_size);
                let batch: Vec<RemoteOperation> = queue.pending.drain(..take).collect();
                queue.in_flight.extend(batch.iter().cloned());
                batch
            };

            self.send(&server, batch).await;
            if self.is_shutdown() {
                return;
            }
        }
    }

    async fn send(&self, server: &ServerName, batch: Vec<RemoteOperation>) {
        let request = build_request(&batch);
        let mut timeouts = 0u32;
        let mut queue_full = 0u32;

        loop {
            if self.is_dead(server) {
                // server_dead already failed the in-flight batch
                return;
            }

            self.metrics.rpcs_sent.inc();
            self.metrics.operations_sent.add(request.len() as u64);
            let call = self.transport.send_batch(server, request.clone());
            let result = match tokio::time::timeout(self.config.rpc_timeout(), call).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };

            let delay = match result {
                Ok(response) => {
                    self.complete(server, &batch, response);
                    return;
                }
                Err(TransportError::Timeout) => {
                    timeouts += 1;
                    if timeouts > self.config.max_timeout_retries {
                        warn!(
                            server = %server,
                            "Giving up after {} timed out calls", timeouts
                        );
                        if self.registry.is_live(server) {
                            self.listener.server_unresponsive(server);
                        }
                        let failed = self.take_in_flight(server, &batch);
                        self.fail_operations(server, failed, "call timed out");
                        return;
                    }
                    self.config.timeout_delay(timeouts)
                }
                Err(TransportError::NotYetRunning) => {
                    if !self.registry.is_live(server) {
                        let failed = self.take_in_flight(server, &batch);
                        self.fail_operations(server, failed, "server went away during startup");
                        return;
                    }
                    self.config.startup_delay()
                }
                Err(TransportError::QueueTooBig) => {
                    queue_full += 1;
                    self.config.queue_full_delay(queue_full)
                }
                Err(e @ TransportError::Unreachable(_)) | Err(e @ TransportError::Remote(_)) => {
                    warn!(server = %server, "Dispatch failed: {}", e);
                    let failed = self.take_all(server);
                    self.fail_operations(server, failed, &e.to_string());
                    return;
                }
            };

            self.metrics.rpc_retries.inc();
            debug!(server = %server, "Retrying batch of {} in {:?}", batch.len(), delay);
            if !self.pause(delay).await {
                return;
            }
        }
    }

    fn complete(&self, server: &ServerName, batch: &[RemoteOperation], response: ExecuteResponse) {
        let still_ours = self.take_in_flight(server, batch);
        let opens: HashMap<u64, OpenResult> = response.opens.into_iter().collect();
        let closes: HashMap<u64, CloseResult> = response.closes.into_iter().collect();

        for operation in still_ours {
            let outcome = match &operation {
                RemoteOperation::Open { op_id, .. } => opens.get(op_id).copied().map(DispatchOutcome::Open),
                RemoteOperation::Close { op_id, .. } => {
                    closes.get(op_id).copied().map(DispatchOutcome::Close)
                }
            };
            match outcome {
                Some(outcome) => self.listener.operation_completed(
                    server,
                    operation.region(),
                    operation.op_id(),
                    outcome,
                ),
                None => debug!(
                    server = %server,
                    region = %operation.region(),
                    "No result for operation {}, waiting on the region report",
                    operation.op_id()
                ),
            }
        }
    }

    fn is_dead(&self, server: &ServerName) -> bool {
        self.queues.lock().get(server).map_or(false, |q| q.dead)
    }

    /// Remove `batch` from the in-flight set, returning the operations that
    /// were still there
    fn take_in_flight(&self, server: &ServerName, batch: &[RemoteOperation]) -> Vec<RemoteOperation> {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(server) else {
            return Vec::new();
        };
        let mut taken = Vec::with_capacity(batch.len());
        queue.in_flight.retain(|op| {
            if batch.iter().any(|b| b.op_id() == op.op_id()) {
                taken.push(op.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    fn take_all(&self, server: &ServerName) -> Vec<RemoteOperation> {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(server) else {
            return Vec::new();
        };
        let mut failed = std::mem::take(&mut queue.in_flight);
        failed.append(&mut queue.pending);
        failed
    }

    fn fail_operations(&self, server: &ServerName, operations: Vec<RemoteOperation>, reason: &str) {
        for operation in operations {
            self.metrics.operations_failed.inc();
            self.listener.operation_completed(
                server,
                operation.region(),
                operation.op_id(),
                DispatchOutcome::Unknown(reason.to_string()),
            );
        }
    }
}

fn build_request(batch: &[RemoteOperation]) -> ExecuteRequest {
    let mut request = ExecuteRequest::default();
    for operation in batch {
        match operation {
            RemoteOperation::Open { op_id, region } => request.opens.push(OpenRegionRequest {
                op_id: *op_id,
                region: region.clone(),
            }),
            RemoteOperation::Close {
                op_id,
                region,
                destination,
            } => request.closes.push(CloseRegionRequest {
                op_id: *op_id,
                region: region.clone(),
                destination: destination.clone(),
            }),
        }
    }
    request
}
