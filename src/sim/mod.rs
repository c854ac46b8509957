//! In-process storage fleet
//!
//! Stands in for real storage nodes: a [`SimTransport`] applies batched
//! open/close requests to [`SimNodes`] and the nodes report transitions back
//! through a channel that [`SimCluster::connect`] forwards to an
//! [`AssignmentManager`]. Fault behaviors are plain closures over the nodes,
//! so tests can script timeouts, hangs, full queues and crashes per call.

use crate::assignment::{
    AssignmentManager, AssignmentServices, CloseResult, ExecuteRequest, ExecuteResponse,
    HrwPlacement, InMemoryNodeRegistry, MemoryRegionStateStore, NodeRegistry, OpenResult,
    RegionInfo, RegionServerTransport, RegionStateStore, ServerName, TransitionCode,
    TransitionReport, TransportError,
};
use crate::procedure::{MemoryProcedureStore, ProcedureStore};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Region hosting state of every simulated node
pub struct SimNodes {
    pub registry: Arc<InMemoryNodeRegistry>,
    open: Mutex<HashMap<String, (RegionInfo, ServerName)>>,
    conflicts: AtomicU64,
    seq: AtomicU64,
    reports: Mutex<Option<mpsc::UnboundedSender<TransitionReport>>>,
}

impl SimNodes {
    pub fn new(registry: Arc<InMemoryNodeRegistry>) -> Self {
        Self {
            registry,
            open: Mutex::new(HashMap::new()),
            conflicts: AtomicU64::new(0),
            seq: AtomicU64::new(1),
            reports: Mutex::new(None),
        }
    }

    fn report(&self, server: &ServerName, region: &RegionInfo, code: TransitionCode, seq: u64) {
        let report = TransitionReport {
            server: server.clone(),
            region: region.clone(),
            code,
            open_seq_num: seq,
        };
        match self.reports.lock().as_ref() {
            Some(tx) => {
                if tx.send(report).is_err() {
                    debug!(region = %region, "Report channel closed");
                }
            }
            None => warn!(region = %region, "No coordinator connected, dropping {:?}", code),
        }
    }

    /// Open `region` on `server` and report OPENED. A region already open
    /// elsewhere, or an overlapping one of the same table, counts as a
    /// conflict.
    pub fn open_region(&self, server: &ServerName, region: &RegionInfo) -> OpenResult {
        let seq = {
            let mut open = self.open.lock();
            if let Some((_, host)) = open.get(&region.name()) {
                if host == server {
                    return OpenResult::AlreadyOpened;
                }
            }
            let overlapping = open.values().any(|(other, host)| {
                (other.name() == region.name() && host != server)
                    || (other.name() != region.name()
                        && other.replica_id == region.replica_id
                        && other.overlaps(region))
            });
            if overlapping {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
                warn!(region = %region, server = %server, "Conflicting open");
            }
            open.insert(region.name(), (region.clone(), server.clone()));
            self.seq.fetch_add(1, Ordering::SeqCst)
        };
        self.report(server, region, TransitionCode::Opened, seq);
        OpenResult::Opened
    }

    /// Accept the open, then report FAILED_OPEN
    pub fn fail_open(&self, server: &ServerName, region: &RegionInfo) -> OpenResult {
        self.report(server, region, TransitionCode::FailedOpen, 0);
        OpenResult::Opened
    }

    pub fn close_region(&self, server: &ServerName, region: &RegionInfo) -> CloseResult {
        let mut open = self.open.lock();
        match open.get(&region.name()) {
            Some((_, host)) if host == server => {
                open.remove(&region.name());
                CloseResult::Closed
            }
            _ => CloseResult::NotServing,
        }
    }

    /// Kill `server`: it loses everything it hosted and is declared dead
    pub fn crash(&self, server: &ServerName) {
        self.open.lock().retain(|_, (_, host)| host != server);
        self.registry.mark_dead(server);
    }

    /// Kill `server` and bring its address back under a new start code
    pub fn restart(&self, server: &ServerName) -> ServerName {
        self.open.lock().retain(|_, (_, host)| host != server);
        self.registry.restart(server)
    }

    /// Apply every operation of `request` the way a healthy node would
    pub fn good_response(&self, server: &ServerName, request: &ExecuteRequest) -> ExecuteResponse {
        ExecuteResponse {
            opens: request
                .opens
                .iter()
                .map(|op| (op.op_id, self.open_region(server, &op.region)))
                .collect(),
            closes: request
                .closes
                .iter()
                .map(|op| (op.op_id, self.close_region(server, &op.region)))
                .collect(),
        }
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::SeqCst)
    }

    pub fn hosted_on(&self, server: &ServerName) -> Vec<RegionInfo> {
        let mut regions: Vec<RegionInfo> = self
            .open
            .lock()
            .values()
            .filter(|(_, host)| host == server)
            .map(|(region, _)| region.clone())
            .collect();
        regions.sort_by_key(|r| r.region_id);
        regions
    }

    /// Where the fleet actually has `region` open
    pub fn host_of(&self, region: &RegionInfo) -> Option<ServerName> {
        self.open
            .lock()
            .get(&region.name())
            .map(|(_, host)| host.clone())
    }
}

/// Scripted node behavior: `(nodes, server, request, call number to that server)`
pub type Behavior = dyn Fn(&SimNodes, &ServerName, &ExecuteRequest, usize) -> Result<ExecuteResponse, TransportError>
    + Send
    + Sync;

pub struct SimTransport {
    nodes: Arc<SimNodes>,
    behavior: Box<Behavior>,
    calls: Mutex<HashMap<ServerName, usize>>,
}

impl SimTransport {
    pub fn new<F>(nodes: Arc<SimNodes>, behavior: F) -> Self
    where
        F: Fn(&SimNodes, &ServerName, &ExecuteRequest, usize) -> Result<ExecuteResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            nodes,
            behavior: Box::new(behavior),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Calls made to `server` so far
    pub fn calls_to(&self, server: &ServerName) -> usize {
        self.calls.lock().get(server).copied().unwrap_or(0)
    }
}

impl RegionServerTransport for SimTransport {
    fn send_batch(
        &self,
        server: &ServerName,
        request: ExecuteRequest,
    ) -> BoxFuture<'static, Result<ExecuteResponse, TransportError>> {
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(server.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let result = if self.nodes.registry.is_live(server) {
            (self.behavior)(&self.nodes, server, &request, call)
        } else {
            Err(TransportError::Unreachable(server.to_string()))
        };
        Box::pin(async move { result })
    }
}

/// A registry plus `n` simulated nodes `rs0..rsN`
pub struct SimCluster {
    pub nodes: Arc<SimNodes>,
    pub servers: Vec<ServerName>,
}

impl SimCluster {
    pub fn new(n: usize) -> Self {
        let registry = Arc::new(InMemoryNodeRegistry::new());
        let servers: Vec<ServerName> = (0..n)
            .map(|i| ServerName::new(format!("rs{}", i), 16020, 1))
            .collect();
        for server in &servers {
            registry.register(server.clone());
        }
        Self {
            nodes: Arc::new(SimNodes::new(registry)),
            servers,
        }
    }

    pub fn registry(&self) -> Arc<InMemoryNodeRegistry> {
        self.nodes.registry.clone()
    }

    pub fn transport<F>(&self, behavior: F) -> Arc<SimTransport>
    where
        F: Fn(&SimNodes, &ServerName, &ExecuteRequest, usize) -> Result<ExecuteResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(SimTransport::new(self.nodes.clone(), behavior))
    }

    pub fn good_transport(&self) -> Arc<SimTransport> {
        self.transport(|nodes, server, request, _| Ok(nodes.good_response(server, request)))
    }

    pub fn services(
        &self,
        transport: Arc<dyn RegionServerTransport>,
        procedure_store: Arc<dyn ProcedureStore>,
        region_store: Arc<dyn RegionStateStore>,
    ) -> AssignmentServices {
        AssignmentServices {
            registry: self.nodes.registry.clone(),
            transport,
            placement: Arc::new(HrwPlacement),
            procedure_store,
            region_store,
        }
    }

    /// Services backed by in-memory stores
    pub fn memory_services(&self, transport: Arc<dyn RegionServerTransport>) -> AssignmentServices {
        self.services(
            transport,
            Arc::new(MemoryProcedureStore::new()),
            Arc::new(MemoryRegionStateStore::new()),
        )
    }

    /// Route node reports into `manager` until it is dropped
    pub fn connect(&self, manager: &Arc<AssignmentManager>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TransitionReport>();
        *self.nodes.reports.lock() = Some(tx);
        let manager: Weak<AssignmentManager> = Arc::downgrade(manager);

        tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.report_transition(
                    &report.server,
                    &report.region,
                    report.code,
                    report.open_seq_num,
                ) {
                    debug!(region = %report.region, "Report rejected: {}", e);
                }
            }
        })
    }

    /// `count` contiguous regions covering the whole key space of `table`
    pub fn table_regions(table: &str, count: usize) -> Vec<RegionInfo> {
        let key = |i: usize| format!("row{:06}", i).into_bytes();
        (0..count)
            .map(|i| {
                let start = if i == 0 { Vec::new() } else { key(i) };
                let end = if i + 1 == count { Vec::new() } else { key(i + 1) };
                RegionInfo::new(table, start, end, i as u64 + 1)
            })
            .collect()
    }
}
