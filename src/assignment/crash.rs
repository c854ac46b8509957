//! Server crash recovery
//!
//! `Start -> Recover -> Finish`. Start fences the server (registry and
//! dispatcher); Recover scans the region index for everything the server
//! hosted or was being sent. Regions owned by a running procedure are handed
//! back to that procedure as a [`RegionSignal::ServerCrashed`]; unowned ones
//! get a fresh Assign child. The scan reads the index rebuilt from the region
//! table, so a restarted coordinator recomputes the work instead of trusting
//! in-memory progress.

use crate::assignment::manager::MasterEnv;
use crate::assignment::transit::{AssignProcedure, MasterProcedure};
use crate::assignment::{LockKind, RegionSignal, RegionState, ServerName};
use crate::common::{timestamp_now_millis, ProcedureError};
use crate::procedure::{Flow, ProcId, StepContext};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum CrashStep {
    Start,
    Recover,
    Finish,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCrashProcedure {
    server: ServerName,
    step: CrashStep,
    reassigned: usize,
    handed_off: usize,
    started_at: u64,
}

impl ServerCrashProcedure {
    pub fn new(server: ServerName) -> Self {
        Self {
            server,
            step: CrashStep::Start,
            reassigned: 0,
            handed_off: 0,
            started_at: timestamp_now_millis(),
        }
    }

    pub fn server(&self) -> &ServerName {
        &self.server
    }

    pub(crate) fn state_tag(&self) -> String {
        format!("{:?}", self.step)
    }

    fn elapsed(&self) -> Duration {
        Duration::from_millis(timestamp_now_millis().saturating_sub(self.started_at))
    }

    pub(crate) fn execute(
        &mut self,
        env: &MasterEnv,
        ctx: &StepContext<'_>,
    ) -> Result<Flow<MasterProcedure>, ProcedureError> {
        match self.step {
            CrashStep::Start => {
                if env.ctx.registry.mark_dead(&self.server) {
                    info!(server = %self.server, "Marked server dead");
                }
                env.dispatcher.server_dead(&self.server);
                self.step = CrashStep::Recover;
                Ok(Flow::Continue)
            }
            CrashStep::Recover => {
                let children = self.recover(env, ctx)?;
                self.step = CrashStep::Finish;
                info!(
                    server = %self.server,
                    "Crash procedure {}: {} regions reassigned, {} handed to running procedures",
                    ctx.proc_id,
                    self.reassigned,
                    self.handed_off
                );
                if children.is_empty() {
                    Ok(Flow::Continue)
                } else {
                    Ok(Flow::Spawn(children))
                }
            }
            CrashStep::Finish => {
                for (child, err) in ctx.failed_children {
                    // The region stays in its failed state for an operator
                    warn!(server = %self.server, "Reassignment {} failed: {}", child, err);
                }
                env.ctx.crash_finished(&self.server, ctx.proc_id);
                env.ctx.metrics.server_crash.record_success(self.elapsed());
                info!(server = %self.server, "Crash procedure {} finished", ctx.proc_id);
                Ok(Flow::Done)
            }
        }
    }

    fn recover(
        &mut self,
        env: &MasterEnv,
        ctx: &StepContext<'_>,
    ) -> Result<Vec<(ProcId, MasterProcedure)>, ProcedureError> {
        let mut children = Vec::new();
        let mut to_wake = Vec::new();

        for node in env.ctx.nodes() {
            let mut node = node.lock();
            if !node.involves(&self.server) {
                continue;
            }

            if node.owner().is_some() {
                // The owner decides: a split parent is never reopened
                let signal = if node.region.split {
                    RegionSignal::Abort {
                        reason: format!("server {} crashed under a split parent", self.server),
                    }
                } else {
                    RegionSignal::ServerCrashed {
                        server: self.server.clone(),
                    }
                };
                node.push_signal(signal);
                to_wake.push(node.region.clone());
                self.handed_off += 1;
                continue;
            }

            node.clear_pending();
            if node.region.split {
                env.ctx.commit(&mut node, RegionState::Closed, None)?;
                continue;
            }

            let child_id = ctx.reserve_id();
            if let Err((owner, _)) = env.ctx.lock_region(&mut node, child_id, LockKind::Assign) {
                warn!(region = %node.region, "Region taken by {} during crash scan", owner);
                continue;
            }
            if let Err(e) = env.ctx.commit(&mut node, RegionState::Offline, None) {
                env.ctx.unlock_region(&mut node, child_id);
                for (id, child) in &children {
                    if let MasterProcedure::Assign(assign) = child {
                        env.ctx.unlock_region(&mut env.ctx.node(assign.region()).lock(), *id);
                    }
                }
                return Err(e);
            }
            env.ctx.metrics.assign.submitted.inc();
            let assign = AssignProcedure::new(node.region.clone()).excluding(self.server.clone());
            children.push((child_id, MasterProcedure::Assign(assign)));
            self.reassigned += 1;
        }

        for region in &to_wake {
            env.ctx.wake(region);
        }
        Ok(children)
    }

    pub(crate) fn rollback(&mut self, env: &MasterEnv, ctx: &StepContext<'_>, err: &ProcedureError) {
        warn!(server = %self.server, "Crash procedure {} failed: {}", ctx.proc_id, err);
        env.ctx.crash_finished(&self.server, ctx.proc_id);
        env.ctx.metrics.server_crash.record_failure(self.elapsed());
    }

    pub(crate) fn on_restore(&mut self, env: &MasterEnv, proc_id: ProcId) {
        env.ctx.register_crash(&self.server, proc_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::{
        AssignmentManager, MemoryRegionStateStore, NodeRegistry, RegionInfo, RegionRecord,
        RegionStateStore,
    };
    use crate::common::Config;
    use crate::procedure::{
        MemoryProcedureStore, ProcedureRecord, ProcedureStore, RecordStatus, StoreEntry,
    };
    use crate::sim::SimCluster;
    use std::sync::Arc;

    fn open_on(region: &RegionInfo, server: &ServerName) -> RegionRecord {
        RegionRecord {
            region: region.clone(),
            state: RegionState::Open,
            location: Some(server.clone()),
            last_host: None,
            open_seq_num: 1,
            last_update: 0,
        }
    }

    #[test]
    fn test_step_survives_serialization() {
        let mut crash = ServerCrashProcedure::new(ServerName::new("rs0", 16020, 1));
        crash.step = CrashStep::Recover;
        let bytes = bincode::serialize(&crash).unwrap();
        let restored: ServerCrashProcedure = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.step, CrashStep::Recover);
        assert_eq!(restored.state_tag(), "Recover");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_restart_mid_crash_rescans_region_table() {
        let cluster = SimCluster::new(3);
        let dead = cluster.servers[0].clone();
        let survivor = cluster.servers[1].clone();
        let regions: Vec<RegionInfo> = (1..=3u64)
            .map(|id| RegionInfo::new("t1", vec![id as u8], vec![id as u8 + 1], id))
            .collect();

        let region_store = Arc::new(MemoryRegionStateStore::new());
        region_store.update(&open_on(&regions[0], &dead)).unwrap();
        region_store.update(&open_on(&regions[1], &dead)).unwrap();
        region_store.update(&open_on(&regions[2], &survivor)).unwrap();

        // The previous coordinator fenced the server and stopped before the scan
        let crash_id: ProcId = 7;
        let mut crash = ServerCrashProcedure::new(dead.clone());
        crash.step = CrashStep::Recover;
        let procedure_store = Arc::new(MemoryProcedureStore::new());
        procedure_store
            .append(&StoreEntry::Update(ProcedureRecord {
                proc_id: crash_id,
                parent_id: None,
                kind: "server_crash".to_string(),
                state_tag: "Recover".to_string(),
                status: RecordStatus::Runnable,
                steps: 1,
                payload: bincode::serialize(&MasterProcedure::ServerCrash(crash)).unwrap(),
            }))
            .unwrap();
        cluster.registry().mark_dead(&dead);

        let mut config = Config::default();
        config.dispatcher.batch_delay_ms = 1;
        config.assignment.retry_delay_ms = 5;
        config.assignment.retry_max_delay_ms = 20;
        let services = cluster.services(
            cluster.good_transport(),
            procedure_store,
            region_store.clone(),
        );
        let manager = AssignmentManager::start(config, services).await.unwrap();
        cluster.connect(&manager);

        manager
            .wait_for_success(crash_id, Duration::from_secs(10))
            .await
            .unwrap();

        for region in &regions[..2] {
            let record = region_store.get(region).unwrap();
            assert_eq!(record.state, RegionState::Open);
            assert!(record.location.is_some());
            assert_ne!(record.location, Some(dead.clone()));
        }
        assert_eq!(
            manager.region_state(&regions[2]).unwrap().location,
            Some(survivor)
        );
        assert_eq!(manager.metrics().assign.submitted.get(), 2);
        // The startup scan found the resumed procedure instead of starting another
        assert_eq!(manager.metrics().server_crash.submitted.get(), 0);
        assert_eq!(manager.metrics().server_crash.succeeded.get(), 1);
        assert_eq!(cluster.nodes.conflicts(), 0);

        manager.shutdown().await;
    }
}
