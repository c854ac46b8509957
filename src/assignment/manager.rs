//! Assignment manager
//!
//! Entry point for assign/unassign/move requests, transition reports and
//! server crashes. Owns the region index (through [`AssignmentContext`]), the
//! remote dispatcher and the procedure executor.
//!
//! Every request takes the region lock before its procedure is submitted, so
//! at most one procedure owns a region at any time. A second request of the
//! same kind attaches to the procedure already running; the lock owner's id is
//! claimed with the scheduler before the lock is visible, so the attached
//! caller can wait on it even before the submit lands.
//!
//! A failed write to the region table is fatal like a failed procedure
//! append: the scheduler is halted and the executor stops.

use crate::assignment::region_store::{FileRegionStateStore, RegionRecord, RegionStateStore};
use crate::assignment::{
    AssignProcedure, DispatchListener, DispatchOutcome, HrwPlacement, LockKind,
    MasterProcedure, MoveRegionProcedure, NodeRegistry, PlacementPolicy, RegionInfo,
    RegionNodeRef, RegionServerTransport, RegionSignal, RegionState, RegionStateNode,
    RemoteDispatcher, ServerCrashProcedure, ServerName, TransitionCode, UnassignProcedure,
};
use crate::common::{
    AssignmentConfig, AssignmentMetrics, Config, Error, ProcedureError, ProcedureMetrics,
    Result,
};
use crate::procedure::executor::ProcedureSummary;
use crate::procedure::{
    ProcId, ProcedureExecutor, ProcedureOutcome, ProcedureScheduler, ProcedureStore,
    WalProcedureStore,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared state every assignment procedure works against
pub struct AssignmentContext {
    pub config: AssignmentConfig,
    pub registry: Arc<dyn NodeRegistry>,
    pub placement: Arc<dyn PlacementPolicy>,
    pub scheduler: Arc<ProcedureScheduler>,
    pub metrics: Arc<AssignmentMetrics>,
    region_store: Arc<dyn RegionStateStore>,
    regions: RwLock<HashMap<String, RegionNodeRef>>,
    crashes: Mutex<HashMap<ServerName, ProcId>>,
}

impl AssignmentContext {
    pub fn new(
        config: AssignmentConfig,
        registry: Arc<dyn NodeRegistry>,
        placement: Arc<dyn PlacementPolicy>,
        region_store: Arc<dyn RegionStateStore>,
        scheduler: Arc<ProcedureScheduler>,
        metrics: Arc<AssignmentMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            placement,
            scheduler,
            metrics,
            region_store,
            regions: RwLock::new(HashMap::new()),
            crashes: Mutex::new(HashMap::new()),
        }
    }

    /// Populate the index from the durable region table
    pub fn load_regions(&self) -> Result<usize> {
        let records = self.region_store.load()?;
        let mut regions = self.regions.write();
        for record in records {
            let name = record.region.name();
            regions.insert(name, Arc::new(Mutex::new(record.into_node())));
        }
        Ok(regions.len())
    }

    /// The node for `region`, created OFFLINE if unknown
    pub fn node(&self, region: &RegionInfo) -> RegionNodeRef {
        let name = region.name();
        if let Some(node) = self.regions.read().get(&name) {
            return node.clone();
        }
        self.regions
            .write()
            .entry(name)
            .or_insert_with(|| Arc::new(Mutex::new(RegionStateNode::new(region.clone()))))
            .clone()
    }

    pub fn get_node(&self, region_name: &str) -> Option<RegionNodeRef> {
        self.regions.read().get(region_name).cloned()
    }

    pub fn nodes(&self) -> Vec<RegionNodeRef> {
        self.regions.read().values().cloned().collect()
    }

    /// Persist a transition, then apply it in memory. A store failure halts
    /// the coordinator.
    pub fn commit(
        &self,
        node: &mut RegionStateNode,
        state: RegionState,
        location: Option<ServerName>,
    ) -> std::result::Result<(), ProcedureError> {
        let previous = (
            node.state,
            node.location.clone(),
            node.last_host.clone(),
            node.last_update,
        );
        node.apply(state, location);

        if let Err(e) = self.region_store.update(&RegionRecord::from_node(node)) {
            (node.state, node.location, node.last_host, node.last_update) = previous;
            let reason = format!(
                "failed to persist {} for region {}: {}",
                state, node.region, e
            );
            error!(region = %node.region, "Region table write failed: {}", e);
            self.scheduler.halt(reason.clone());
            return Err(ProcedureError::store_unavailable(reason));
        }
        debug!(region = %node.region, location = ?node.location, "Region is {}", state);
        Ok(())
    }

    pub fn lock_region(
        &self,
        node: &mut RegionStateNode,
        proc_id: ProcId,
        kind: LockKind,
    ) -> std::result::Result<(), (ProcId, LockKind)> {
        let newly_locked = node.owner().is_none();
        node.try_lock(proc_id, kind)?;
        if newly_locked {
            self.scheduler.claim(proc_id);
            self.metrics.regions_in_transition.inc();
        }
        Ok(())
    }

    /// Re-take a lock recorded by a replayed procedure
    pub fn restore_lock(&self, node: &mut RegionStateNode, proc_id: ProcId, kind: LockKind) {
        if let Some((holder, _)) = node.owner() {
            if holder != proc_id {
                warn!(
                    region = %node.region,
                    "Replayed procedure {} displaces lock holder {}", proc_id, holder
                );
                node.unlock(holder);
                self.metrics.regions_in_transition.dec();
            }
        }
        let _ = self.lock_region(node, proc_id, kind);
    }

    pub fn unlock_region(&self, node: &mut RegionStateNode, proc_id: ProcId) {
        self.scheduler.settle(proc_id);
        if node.unlock(proc_id) {
            self.metrics.regions_in_transition.dec();
            self.scheduler.forget(&node.region.event_key());
        }
    }

    pub fn wake(&self, region: &RegionInfo) {
        self.scheduler.wake(&region.event_key());
    }

    /// Queue `signal` for whoever owns `region` and wake it. Returns false if
    /// the region is unknown or unowned.
    pub fn signal(&self, region: &RegionInfo, signal: RegionSignal) -> bool {
        let Some(node) = self.get_node(&region.name()) else {
            return false;
        };
        {
            let mut node = node.lock();
            if node.owner().is_none() {
                return false;
            }
            node.push_signal(signal);
        }
        self.wake(region);
        true
    }

    /// Declare `server` dead; crash handling follows from the death event
    pub fn expire_server(&self, server: &ServerName) {
        if self.registry.mark_dead(server) {
            warn!(server = %server, "Expired unresponsive server");
        }
    }

    pub fn register_crash(&self, server: &ServerName, proc_id: ProcId) {
        self.crashes.lock().insert(server.clone(), proc_id);
    }

    pub fn crash_finished(&self, server: &ServerName, proc_id: ProcId) {
        let mut crashes = self.crashes.lock();
        if crashes.get(server) == Some(&proc_id) {
            crashes.remove(server);
        }
    }

    pub fn metrics_for(&self, kind: LockKind) -> &ProcedureMetrics {
        match kind {
            LockKind::Assign => &self.metrics.assign,
            LockKind::Unassign => &self.metrics.unassign,
            LockKind::Move => &self.metrics.move_region,
        }
    }
}

impl DispatchListener for AssignmentContext {
    fn operation_completed(
        &self,
        server: &ServerName,
        region: &RegionInfo,
        op_id: u64,
        outcome: DispatchOutcome,
    ) {
        let Some(node) = self.get_node(&region.name()) else {
            return;
        };
        {
            let mut node = node.lock();
            if node.pending_op() != Some(op_id) {
                debug!(region = %region, "Dropping late outcome for operation {}", op_id);
                return;
            }
            node.push_signal(RegionSignal::Dispatched {
                server: server.clone(),
                op_id,
                outcome,
            });
        }
        self.wake(region);
    }

    fn server_unresponsive(&self, server: &ServerName) {
        self.expire_server(server);
    }
}

/// Environment handed to every assignment procedure step
pub struct MasterEnv {
    pub ctx: Arc<AssignmentContext>,
    pub dispatcher: Arc<RemoteDispatcher>,
}

/// External collaborators of the assignment manager
pub struct AssignmentServices {
    pub registry: Arc<dyn NodeRegistry>,
    pub transport: Arc<dyn RegionServerTransport>,
    pub placement: Arc<dyn PlacementPolicy>,
    pub procedure_store: Arc<dyn ProcedureStore>,
    pub region_store: Arc<dyn RegionStateStore>,
}

impl AssignmentServices {
    /// File-backed stores under `config.store.dir` and HRW placement
    pub fn open(
        config: &Config,
        registry: Arc<dyn NodeRegistry>,
        transport: Arc<dyn RegionServerTransport>,
    ) -> Result<Self> {
        let policy = config.store.sync_policy;
        Ok(Self {
            registry,
            transport,
            placement: Arc::new(HrwPlacement),
            procedure_store: Arc::new(WalProcedureStore::open(
                config.store.procedure_log(),
                policy,
            )?),
            region_store: Arc::new(FileRegionStateStore::open(
                config.store.region_log(),
                policy,
            )?),
        })
    }
}

pub struct AssignmentManager {
    ctx: Arc<AssignmentContext>,
    dispatcher: Arc<RemoteDispatcher>,
    executor: ProcedureExecutor<MasterProcedure>,
    shutdown_tx: watch::Sender<bool>,
    death_watch: Mutex<Option<JoinHandle<()>>>,
}

impl AssignmentManager {
    /// Load state, resume persisted procedures and start processing
    pub async fn start(config: Config, services: AssignmentServices) -> Result<Arc<Self>> {
        config.validate()?;

        let scheduler = Arc::new(ProcedureScheduler::new());
        let metrics = Arc::new(AssignmentMetrics::new());
        let ctx = Arc::new(AssignmentContext::new(
            config.assignment.clone(),
            services.registry.clone(),
            services.placement,
            services.region_store,
            scheduler.clone(),
            metrics.clone(),
        ));
        let regions = ctx.load_regions()?;

        let dispatcher = RemoteDispatcher::new(
            config.dispatcher.clone(),
            services.transport,
            services.registry.clone(),
            ctx.clone(),
            metrics.dispatch.clone(),
        );
        let env = Arc::new(MasterEnv {
            ctx: ctx.clone(),
            dispatcher: dispatcher.clone(),
        });
        let executor = ProcedureExecutor::recover(env, services.procedure_store, scheduler)?;
        executor.set_result_retention(config.executor.result_retention());

        // Subscribe before scanning so no death falls in between
        let deaths = services.registry.subscribe_deaths();
        executor.start(config.executor.worker_threads);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = Arc::new(Self {
            ctx,
            dispatcher,
            executor,
            shutdown_tx,
            death_watch: Mutex::new(None),
        });

        manager.recover_dead_servers()?;

        let handle = tokio::spawn(watch_deaths(
            Arc::downgrade(&manager),
            deaths,
            shutdown_rx,
        ));
        *manager.death_watch.lock() = Some(handle);

        info!(
            "Assignment manager started: {} regions, {} procedures resumed",
            regions,
            manager.executor.active_count()
        );
        Ok(manager)
    }

    pub fn assign(&self, region: &RegionInfo) -> Result<ProcId> {
        self.assign_to(region, None)
    }

    /// Assign with a preferred target; placement decides if it is unusable
    pub fn assign_to(&self, region: &RegionInfo, target: Option<ServerName>) -> Result<ProcId> {
        if region.split {
            return Err(Error::InvalidRegion(format!(
                "{} is a split parent and cannot be assigned",
                region
            )));
        }
        self.submit_locked(region, LockKind::Assign, || {
            MasterProcedure::Assign(AssignProcedure::new(region.clone()).with_target(target))
        })
    }

    pub fn assign_many(&self, regions: &[RegionInfo]) -> Result<Vec<ProcId>> {
        regions.iter().map(|region| self.assign(region)).collect()
    }

    pub fn unassign(&self, region: &RegionInfo) -> Result<ProcId> {
        self.submit_locked(region, LockKind::Unassign, || {
            MasterProcedure::Unassign(UnassignProcedure::new(region.clone()))
        })
    }

    /// Close the region and open it elsewhere (on `destination` if usable)
    pub fn move_region(
        &self,
        region: &RegionInfo,
        destination: Option<ServerName>,
    ) -> Result<ProcId> {
        if region.split {
            return Err(Error::InvalidRegion(format!(
                "{} is a split parent and cannot be moved",
                region
            )));
        }
        self.submit_locked(region, LockKind::Move, || {
            MasterProcedure::Move(MoveRegionProcedure::new(region.clone(), destination))
        })
    }

    fn submit_locked<F>(&self, region: &RegionInfo, kind: LockKind, build: F) -> Result<ProcId>
    where
        F: FnOnce() -> MasterProcedure,
    {
        let node = self.ctx.node(region);
        let proc_id = {
            let mut node = node.lock();
            if let Some((owner, owner_kind)) = node.owner() {
                if owner_kind == kind {
                    debug!(region = %region, "Attaching to {} procedure {}", kind, owner);
                    return Ok(owner);
                }
                return Err(Error::RegionInTransition {
                    region: region.name(),
                    owner,
                    kind: owner_kind.to_string(),
                });
            }
            let proc_id = self.ctx.scheduler.reserve_id();
            if let Err((owner, owner_kind)) = self.ctx.lock_region(&mut node, proc_id, kind) {
                return Err(Error::RegionInTransition {
                    region: region.name(),
                    owner,
                    kind: owner_kind.to_string(),
                });
            }
            proc_id
        };

        if let Err(e) = self.executor.submit_with_id(proc_id, build()) {
            self.ctx.unlock_region(&mut node.lock(), proc_id);
            return Err(e);
        }
        self.ctx.metrics_for(kind).submitted.inc();
        Ok(proc_id)
    }

    /// Route a storage node's transition report to the region's owner.
    /// Reports for unknown or unowned regions are acknowledged and dropped.
    pub fn report_transition(
        &self,
        server: &ServerName,
        region: &RegionInfo,
        code: TransitionCode,
        open_seq_num: u64,
    ) -> Result<()> {
        self.ctx.metrics.reports_received.inc();

        if !self.ctx.registry.is_live(server) {
            warn!(server = %server, region = %region, "Rejecting {:?} report from dead server", code);
            return Err(Error::ServerNotLive(server.to_string()));
        }

        let signal = RegionSignal::Reported {
            server: server.clone(),
            code,
            open_seq_num,
        };
        if !self.ctx.signal(region, signal) {
            self.ctx.metrics.reports_ignored.inc();
            debug!(server = %server, region = %region, "Ignoring {:?} report for unowned region", code);
        }
        Ok(())
    }

    /// Start crash recovery for `server`. Returns the running crash
    /// procedure if there already is one.
    pub fn submit_server_crash(&self, server: &ServerName) -> Result<ProcId> {
        let mut crashes = self.ctx.crashes.lock();
        if let Some(id) = crashes.get(server) {
            return Ok(*id);
        }

        let proc_id = self.ctx.scheduler.reserve_id();
        crashes.insert(server.clone(), proc_id);
        let procedure = MasterProcedure::ServerCrash(ServerCrashProcedure::new(server.clone()));
        if let Err(e) = self.executor.submit_with_id(proc_id, procedure) {
            crashes.remove(server);
            return Err(e);
        }
        self.ctx.metrics.server_crash.submitted.inc();
        info!(server = %server, "Submitted server crash procedure {}", proc_id);
        Ok(proc_id)
    }

    /// Submit crash procedures for dead servers still hosting regions or
    /// holding an operation a procedure waits on. Runs at startup and after
    /// missed death events.
    pub fn recover_dead_servers(&self) -> Result<()> {
        let mut dead = BTreeSet::new();
        for node in self.ctx.nodes() {
            let node = node.lock();
            let involved = node.location.iter().chain(node.pending_server());
            for server in involved {
                if !self.ctx.registry.is_live(server) {
                    dead.insert(server.clone());
                }
            }
        }
        for server in dead {
            self.submit_server_crash(&server)?;
        }
        Ok(())
    }

    pub async fn wait_for(&self, proc_id: ProcId, timeout: Duration) -> Result<ProcedureOutcome> {
        self.executor.wait_result(proc_id, timeout).await
    }

    /// Like [`wait_for`](Self::wait_for) but turns a failed outcome into an error
    pub async fn wait_for_success(&self, proc_id: ProcId, timeout: Duration) -> Result<()> {
        match self.wait_for(proc_id, timeout).await? {
            ProcedureOutcome::Succeeded => Ok(()),
            ProcedureOutcome::Failed(source) => Err(Error::ProcedureFailed {
                id: proc_id,
                source,
            }),
        }
    }

    pub fn region_state(&self, region: &RegionInfo) -> Option<RegionRecord> {
        self.ctx
            .get_node(&region.name())
            .map(|node| RegionRecord::from_node(&node.lock()))
    }

    pub fn region_owner(&self, region: &RegionInfo) -> Option<(ProcId, LockKind)> {
        self.ctx
            .get_node(&region.name())
            .and_then(|node| node.lock().owner())
    }

    /// Regions OPEN on `server`
    pub fn regions_on(&self, server: &ServerName) -> Vec<RegionInfo> {
        let mut regions: Vec<RegionInfo> = self
            .ctx
            .nodes()
            .into_iter()
            .filter_map(|node| {
                let node = node.lock();
                (node.state == RegionState::Open && node.location.as_ref() == Some(server))
                    .then(|| node.region.clone())
            })
            .collect();
        regions.sort_by_key(|r| r.region_id);
        regions
    }

    pub fn regions_in_transition(&self) -> usize {
        self.ctx
            .nodes()
            .into_iter()
            .filter(|node| node.lock().owner().is_some())
            .count()
    }

    pub fn metrics(&self) -> &Arc<AssignmentMetrics> {
        &self.ctx.metrics
    }

    pub fn procedures(&self) -> Vec<ProcedureSummary> {
        self.executor.summaries()
    }

    pub fn dispatcher(&self) -> &Arc<RemoteDispatcher> {
        &self.dispatcher
    }

    /// True once a durable store failed and no new work is accepted
    pub fn is_stopped(&self) -> bool {
        self.executor.is_fatal()
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.death_watch.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.executor.shutdown().await;
        self.dispatcher.shutdown();
        info!("Assignment manager stopped");
    }
}

async fn watch_deaths(
    manager: Weak<AssignmentManager>,
    mut deaths: broadcast::Receiver<ServerName>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = deaths.recv() => event,
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };

        match event {
            Ok(server) => {
                if let Err(e) = manager.submit_server_crash(&server) {
                    warn!(server = %server, "Could not submit crash procedure: {}", e);
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Missed {} server death events, rescanning", missed);
                if let Err(e) = manager.recover_dead_servers() {
                    warn!("Rescan for dead servers failed: {}", e);
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
