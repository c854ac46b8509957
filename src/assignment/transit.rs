//! Region transition procedures
//!
//! Assign: `Queue -> Dispatch -> AwaitOpen -> Finish`
//! Unassign: `Queue -> Dispatch -> AwaitClose -> Finish`
//! Move: an Unassign child followed by an Assign child.
//!
//! Every step runs with the region's node mutex held and first drains the
//! signals queued for the region (transition reports, dispatch outcomes,
//! crash notifications) before acting on its current step.

use crate::assignment::crash::ServerCrashProcedure;
use crate::assignment::dispatcher::{CloseResult, OpenResult, RemoteOperation};
use crate::assignment::manager::MasterEnv;
use crate::assignment::{
    DispatchOutcome, LockKind, RegionInfo, RegionSignal, RegionState, RegionStateNode, ServerName,
    TransitionCode,
};
use crate::common::{timestamp_now_millis, ProcedureError, ProcedureErrorKind, ProcedureMetrics};
use crate::procedure::{Flow, ProcId, Procedure, StepContext};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

type StepResult = Result<Flow<MasterProcedure>, ProcedureError>;

fn elapsed_since(started_at: u64) -> Duration {
    Duration::from_millis(timestamp_now_millis().saturating_sub(started_at))
}

fn lost_lock(region: &RegionInfo) -> ProcedureError {
    ProcedureError::internal(format!("lost the lock on region {}", region))
}

/// Every procedure the assignment manager runs
#[derive(Debug, Serialize, Deserialize)]
pub enum MasterProcedure {
    Assign(AssignProcedure),
    Unassign(UnassignProcedure),
    Move(MoveRegionProcedure),
    ServerCrash(ServerCrashProcedure),
}

impl Procedure for MasterProcedure {
    type Env = MasterEnv;

    fn kind(&self) -> &'static str {
        match self {
            MasterProcedure::Assign(_) => "assign",
            MasterProcedure::Unassign(_) => "unassign",
            MasterProcedure::Move(_) => "move",
            MasterProcedure::ServerCrash(_) => "server_crash",
        }
    }

    fn state_tag(&self) -> String {
        match self {
            MasterProcedure::Assign(p) => format!("{:?}", p.step),
            MasterProcedure::Unassign(p) => format!("{:?}", p.step),
            MasterProcedure::Move(p) => format!("{:?}", p.step),
            MasterProcedure::ServerCrash(p) => p.state_tag(),
        }
    }

    fn execute(&mut self, env: &MasterEnv, ctx: &StepContext<'_>) -> StepResult {
        match self {
            MasterProcedure::Assign(p) => p.execute(env, ctx),
            MasterProcedure::Unassign(p) => p.execute(env, ctx),
            MasterProcedure::Move(p) => p.execute(env, ctx),
            MasterProcedure::ServerCrash(p) => p.execute(env, ctx),
        }
    }

    fn rollback(&mut self, env: &MasterEnv, ctx: &StepContext<'_>, err: &ProcedureError) {
        match self {
            MasterProcedure::Assign(p) => p.rollback(env, ctx, err),
            MasterProcedure::Unassign(p) => p.rollback(env, ctx, err),
            MasterProcedure::Move(p) => p.rollback(env, ctx, err),
            MasterProcedure::ServerCrash(p) => p.rollback(env, ctx, err),
        }
    }

    fn on_restore(&mut self, env: &MasterEnv, proc_id: ProcId) {
        match self {
            MasterProcedure::Assign(p) => p.on_restore(env, proc_id),
            MasterProcedure::Unassign(p) => p.on_restore(env, proc_id),
            MasterProcedure::Move(p) => p.on_restore(env, proc_id),
            MasterProcedure::ServerCrash(p) => p.on_restore(env, proc_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum AssignStep {
    Queue,
    Dispatch,
    AwaitOpen,
    Finish,
}

/// Open a region on some live server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignProcedure {
    region: RegionInfo,
    step: AssignStep,
    target_hint: Option<ServerName>,
    target: Option<ServerName>,
    excluded: Vec<ServerName>,
    attempts: u32,
    /// Parent whose region lock this procedure runs under
    inherited_lock: Option<ProcId>,
    op_id: Option<u64>,
    started_at: u64,
}

impl AssignProcedure {
    pub fn new(region: RegionInfo) -> Self {
        Self {
            region,
            step: AssignStep::Queue,
            target_hint: None,
            target: None,
            excluded: Vec::new(),
            attempts: 0,
            inherited_lock: None,
            op_id: None,
            started_at: timestamp_now_millis(),
        }
    }

    pub fn with_target(mut self, target: Option<ServerName>) -> Self {
        self.target_hint = target;
        self
    }

    pub fn excluding(mut self, server: ServerName) -> Self {
        if !self.excluded.contains(&server) {
            self.excluded.push(server);
        }
        self
    }

    pub(crate) fn child_of(mut self, parent: ProcId) -> Self {
        self.inherited_lock = Some(parent);
        self
    }

    pub fn region(&self) -> &RegionInfo {
        &self.region
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn lock_id(&self, proc_id: ProcId) -> ProcId {
        self.inherited_lock.unwrap_or(proc_id)
    }

    fn execute(&mut self, env: &MasterEnv, ctx: &StepContext<'_>) -> StepResult {
        let node = env.ctx.node(&self.region);
        let mut node = node.lock();
        if !node.is_owned_by(self.lock_id(ctx.proc_id)) {
            return Err(lost_lock(&self.region));
        }

        let mut retry_after = None;
        for signal in node.take_signals() {
            if let Some(delay) = self.on_signal(env, &mut node, signal)? {
                retry_after = Some(delay);
            }
        }

        match self.step {
            AssignStep::Queue => match retry_after {
                Some(delay) => Ok(Flow::Delay(delay)),
                None => self.queue(env, &mut node),
            },
            AssignStep::Dispatch => self.dispatch(env, &mut node),
            AssignStep::AwaitOpen => Ok(Flow::suspend(self.region.event_key())),
            AssignStep::Finish => {
                if self.inherited_lock.is_none() {
                    env.ctx.unlock_region(&mut node, ctx.proc_id);
                }
                env.ctx
                    .metrics
                    .assign
                    .record_success(elapsed_since(self.started_at));
                info!(
                    region = %self.region,
                    location = ?node.location,
                    "Assign procedure {} finished after {} failed attempts",
                    ctx.proc_id,
                    self.attempts
                );
                Ok(Flow::Done)
            }
        }
    }

    fn on_signal(
        &mut self,
        env: &MasterEnv,
        node: &mut RegionStateNode,
        signal: RegionSignal,
    ) -> Result<Option<Duration>, ProcedureError> {
        match signal {
            RegionSignal::Abort { reason } => {
                if self.step != AssignStep::Finish {
                    return Err(ProcedureError::aborted(reason));
                }
            }
            RegionSignal::ServerCrashed { server } => {
                let affected = self.target.as_ref() == Some(&server)
                    && self.step != AssignStep::Queue;
                if affected {
                    info!(region = %self.region, server = %server, "Target crashed, reassigning");
                    node.clear_pending();
                    env.ctx.commit(node, RegionState::Offline, None)?;
                    self.target = None;
                    self.op_id = None;
                    self.step = AssignStep::Queue;
                }
            }
            RegionSignal::Reported {
                server,
                code,
                open_seq_num,
            } => {
                if self.step != AssignStep::AwaitOpen || self.target.as_ref() != Some(&server) {
                    debug!(region = %self.region, server = %server, "Ignoring stale {:?} report", code);
                    return Ok(None);
                }
                match code {
                    TransitionCode::Opened => self.opened(env, node, open_seq_num)?,
                    TransitionCode::FailedOpen => return self.failed_open(env, node),
                    TransitionCode::Closed => {
                        debug!(region = %self.region, "Ignoring CLOSED report while opening")
                    }
                }
            }
            RegionSignal::Dispatched {
                server,
                op_id,
                outcome,
            } => {
                if self.step != AssignStep::AwaitOpen
                    || self.op_id != Some(op_id)
                    || self.target.as_ref() != Some(&server)
                {
                    return Ok(None);
                }
                match outcome {
                    DispatchOutcome::Open(OpenResult::Opened) => node.ack_pending(),
                    DispatchOutcome::Open(OpenResult::AlreadyOpened) => {
                        let seq = node.open_seq_num;
                        self.opened(env, node, seq)?;
                    }
                    DispatchOutcome::Open(OpenResult::FailedOpening) => {
                        return self.failed_open(env, node)
                    }
                    DispatchOutcome::Unknown(reason) => {
                        // Never reopen on an unknown outcome: wait for the
                        // crash procedure of this exact server instead
                        node.ack_pending();
                        warn!(
                            region = %self.region,
                            server = %server,
                            "Open outcome unknown ({}), waiting for crash recovery",
                            reason
                        );
                        if env.ctx.registry.is_live(&server) {
                            env.ctx.expire_server(&server);
                        }
                    }
                    DispatchOutcome::Close(_) => {}
                }
            }
        }
        Ok(None)
    }

    fn opened(
        &mut self,
        env: &MasterEnv,
        node: &mut RegionStateNode,
        open_seq_num: u64,
    ) -> Result<(), ProcedureError> {
        let target = self.target.clone();
        node.open_seq_num = open_seq_num;
        env.ctx.commit(node, RegionState::Open, target)?;
        node.clear_pending();
        self.op_id = None;
        self.step = AssignStep::Finish;
        Ok(())
    }

    fn failed_open(
        &mut self,
        env: &MasterEnv,
        node: &mut RegionStateNode,
    ) -> Result<Option<Duration>, ProcedureError> {
        self.attempts += 1;
        node.clear_pending();
        self.op_id = None;
        env.ctx.commit(node, RegionState::FailedOpen, None)?;

        let failed_on = self.target.take();
        if let Some(server) = &failed_on {
            if !self.excluded.contains(server) {
                self.excluded.push(server.clone());
            }
        }

        let max_attempts = env.ctx.config.max_attempts;
        if self.attempts >= max_attempts {
            return Err(ProcedureError::attempts_exhausted(format!(
                "region {} failed to open {} times",
                self.region, self.attempts
            )));
        }

        warn!(
            region = %self.region,
            server = ?failed_on,
            "Open failed (attempt {}/{}), retrying elsewhere",
            self.attempts,
            max_attempts
        );
        env.ctx.commit(node, RegionState::Offline, None)?;
        self.step = AssignStep::Queue;
        Ok(Some(env.ctx.config.retry_delay(self.attempts)))
    }

    fn queue(&mut self, env: &MasterEnv, node: &mut RegionStateNode) -> StepResult {
        if node.state == RegionState::Open {
            if let Some(location) = &node.location {
                if env.ctx.registry.is_live(location) {
                    debug!(region = %self.region, server = %location, "Already open");
                    self.step = AssignStep::Finish;
                    return Ok(Flow::Continue);
                }
            }
        }

        let live = env.ctx.registry.live_servers();
        let hinted = self
            .target_hint
            .clone()
            .filter(|hint| live.contains(hint) && !self.excluded.contains(hint));
        let target = hinted.or_else(|| {
            env.ctx
                .placement
                .choose_node(&self.region, &live, &self.excluded)
        });

        let Some(target) = target else {
            warn!(region = %self.region, "No server available, will retry");
            return Ok(Flow::Delay(env.ctx.config.retry_delay(self.attempts + 1)));
        };

        env.ctx.commit(node, RegionState::PendingOpen, None)?;
        self.target = Some(target);
        self.step = AssignStep::Dispatch;
        self.dispatch(env, node)
    }

    fn dispatch(&mut self, env: &MasterEnv, node: &mut RegionStateNode) -> StepResult {
        let Some(target) = self.target.clone() else {
            self.step = AssignStep::Queue;
            return Ok(Flow::Continue);
        };

        // Checked under the region lock so a crash scan either sees the
        // pending operation or we see the server dead
        if !env.ctx.registry.is_live(&target) {
            debug!(region = %self.region, server = %target, "Target died before dispatch");
            self.target = None;
            self.step = AssignStep::Queue;
            return Ok(Flow::Continue);
        }

        let op_id = env.dispatcher.next_op_id();
        node.set_pending(op_id, target.clone());
        let operation = RemoteOperation::Open {
            op_id,
            region: self.region.clone(),
        };
        if let Err(e) = env.dispatcher.enqueue(&target, operation) {
            debug!(region = %self.region, server = %target, "Dispatch rejected: {}", e);
            node.clear_pending();
            self.target = None;
            self.step = AssignStep::Queue;
            return Ok(Flow::Continue);
        }

        env.ctx.commit(node, RegionState::Opening, None)?;
        self.op_id = Some(op_id);
        self.step = AssignStep::AwaitOpen;
        Ok(Flow::suspend(self.region.event_key()))
    }

    fn rollback(&mut self, env: &MasterEnv, ctx: &StepContext<'_>, err: &ProcedureError) {
        let node = env.ctx.node(&self.region);
        let mut node = node.lock();
        if node.is_owned_by(self.lock_id(ctx.proc_id)) {
            node.clear_pending();
            if err.kind == ProcedureErrorKind::Aborted {
                if let Err(e) = env.ctx.commit(&mut node, RegionState::Aborted, None) {
                    warn!(region = %self.region, "Could not record abort: {}", e);
                }
            }
            if self.inherited_lock.is_none() {
                env.ctx.unlock_region(&mut node, ctx.proc_id);
            }
        }
        env.ctx
            .metrics
            .assign
            .record_failure(elapsed_since(self.started_at));
    }

    fn on_restore(&mut self, env: &MasterEnv, proc_id: ProcId) {
        if self.inherited_lock.is_none() {
            let node = env.ctx.node(&self.region);
            env.ctx
                .restore_lock(&mut node.lock(), proc_id, LockKind::Assign);
        }
        // Opens are idempotent on the server; send it again
        if self.step == AssignStep::AwaitOpen {
            self.step = AssignStep::Dispatch;
            self.op_id = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum UnassignStep {
    Queue,
    Dispatch,
    AwaitClose,
    Finish,
}

/// Close a region wherever it is open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnassignProcedure {
    region: RegionInfo,
    step: UnassignStep,
    destination: Option<ServerName>,
    server: Option<ServerName>,
    close_attempts: u32,
    inherited_lock: Option<ProcId>,
    op_id: Option<u64>,
    started_at: u64,
}

impl UnassignProcedure {
    pub fn new(region: RegionInfo) -> Self {
        Self {
            region,
            step: UnassignStep::Queue,
            destination: None,
            server: None,
            close_attempts: 0,
            inherited_lock: None,
            op_id: None,
            started_at: timestamp_now_millis(),
        }
    }

    /// Where the region goes next, passed along to the closing server
    pub fn with_destination(mut self, destination: Option<ServerName>) -> Self {
        self.destination = destination;
        self
    }

    pub(crate) fn child_of(mut self, parent: ProcId) -> Self {
        self.inherited_lock = Some(parent);
        self
    }

    pub fn region(&self) -> &RegionInfo {
        &self.region
    }

    fn lock_id(&self, proc_id: ProcId) -> ProcId {
        self.inherited_lock.unwrap_or(proc_id)
    }

    fn execute(&mut self, env: &MasterEnv, ctx: &StepContext<'_>) -> StepResult {
        let node = env.ctx.node(&self.region);
        let mut node = node.lock();
        if !node.is_owned_by(self.lock_id(ctx.proc_id)) {
            return Err(lost_lock(&self.region));
        }

        let mut retry_after = None;
        for signal in node.take_signals() {
            if let Some(delay) = self.on_signal(env, &mut node, signal)? {
                retry_after = Some(delay);
            }
        }

        match self.step {
            UnassignStep::Queue => self.queue(env, &mut node),
            UnassignStep::Dispatch => match retry_after {
                Some(delay) => Ok(Flow::Delay(delay)),
                None => self.dispatch(env, &mut node),
            },
            UnassignStep::AwaitClose => Ok(Flow::suspend(self.region.event_key())),
            UnassignStep::Finish => {
                if self.inherited_lock.is_none() {
                    env.ctx.unlock_region(&mut node, ctx.proc_id);
                }
                env.ctx
                    .metrics
                    .unassign
                    .record_success(elapsed_since(self.started_at));
                info!(region = %self.region, "Unassign procedure {} finished", ctx.proc_id);
                Ok(Flow::Done)
            }
        }
    }

    fn on_signal(
        &mut self,
        env: &MasterEnv,
        node: &mut RegionStateNode,
        signal: RegionSignal,
    ) -> Result<Option<Duration>, ProcedureError> {
        let closing = matches!(self.step, UnassignStep::Dispatch | UnassignStep::AwaitClose);
        match signal {
            RegionSignal::Abort { reason } => {
                if self.step != UnassignStep::Finish {
                    return Err(ProcedureError::aborted(reason));
                }
            }
            RegionSignal::ServerCrashed { server } => {
                // A dead server holds nothing
                if closing && self.server.as_ref() == Some(&server) {
                    self.closed(env, node)?;
                }
            }
            RegionSignal::Reported { server, code, .. } => {
                if self.step == UnassignStep::AwaitClose
                    && code == TransitionCode::Closed
                    && self.server.as_ref() == Some(&server)
                {
                    self.closed(env, node)?;
                } else {
                    debug!(region = %self.region, server = %server, "Ignoring stale {:?} report", code);
                }
            }
            RegionSignal::Dispatched {
                server,
                op_id,
                outcome,
            } => {
                if self.step != UnassignStep::AwaitClose || self.op_id != Some(op_id) {
                    return Ok(None);
                }
                match outcome {
                    DispatchOutcome::Close(CloseResult::Closed)
                    | DispatchOutcome::Close(CloseResult::NotServing) => self.closed(env, node)?,
                    DispatchOutcome::Close(CloseResult::NotClosed) => {
                        self.close_attempts += 1;
                        node.clear_pending();
                        self.op_id = None;
                        let max = env.ctx.config.max_close_attempts;
                        if self.close_attempts >= max {
                            return Err(ProcedureError::attempts_exhausted(format!(
                                "region {} refused to close {} times",
                                self.region, self.close_attempts
                            )));
                        }
                        self.step = UnassignStep::Dispatch;
                        return Ok(Some(env.ctx.config.retry_delay(self.close_attempts)));
                    }
                    DispatchOutcome::Unknown(reason) => {
                        node.ack_pending();
                        warn!(
                            region = %self.region,
                            server = %server,
                            "Close outcome unknown ({}), waiting for crash recovery",
                            reason
                        );
                        if env.ctx.registry.is_live(&server) {
                            env.ctx.expire_server(&server);
                        }
                    }
                    DispatchOutcome::Open(_) => {}
                }
            }
        }
        Ok(None)
    }

    fn closed(&mut self, env: &MasterEnv, node: &mut RegionStateNode) -> Result<(), ProcedureError> {
        node.clear_pending();
        env.ctx.commit(node, RegionState::Closed, None)?;
        self.op_id = None;
        self.step = UnassignStep::Finish;
        Ok(())
    }

    fn queue(&mut self, env: &MasterEnv, node: &mut RegionStateNode) -> StepResult {
        let location = match (&node.state, &node.location) {
            (
                RegionState::Open | RegionState::PendingClose | RegionState::Closing,
                Some(location),
            ) => location.clone(),
            (state, _) => {
                debug!(region = %self.region, "Nothing to close in state {}", state);
                self.step = UnassignStep::Finish;
                return Ok(Flow::Continue);
            }
        };

        if !env.ctx.registry.is_live(&location) {
            self.closed(env, node)?;
            return Ok(Flow::Continue);
        }

        env.ctx
            .commit(node, RegionState::PendingClose, Some(location.clone()))?;
        self.server = Some(location);
        self.step = UnassignStep::Dispatch;
        self.dispatch(env, node)
    }

    fn dispatch(&mut self, env: &MasterEnv, node: &mut RegionStateNode) -> StepResult {
        let Some(server) = self.server.clone() else {
            self.step = UnassignStep::Queue;
            return Ok(Flow::Continue);
        };

        if !env.ctx.registry.is_live(&server) {
            self.closed(env, node)?;
            return Ok(Flow::Continue);
        }

        let op_id = env.dispatcher.next_op_id();
        node.set_pending(op_id, server.clone());
        let operation = RemoteOperation::Close {
            op_id,
            region: self.region.clone(),
            destination: self.destination.clone(),
        };
        if let Err(e) = env.dispatcher.enqueue(&server, operation) {
            debug!(region = %self.region, server = %server, "Close rejected: {}", e);
            self.closed(env, node)?;
            return Ok(Flow::Continue);
        }

        env.ctx
            .commit(node, RegionState::Closing, Some(server))?;
        self.op_id = Some(op_id);
        self.step = UnassignStep::AwaitClose;
        Ok(Flow::suspend(self.region.event_key()))
    }

    fn rollback(&mut self, env: &MasterEnv, ctx: &StepContext<'_>, err: &ProcedureError) {
        let node = env.ctx.node(&self.region);
        let mut node = node.lock();
        if node.is_owned_by(self.lock_id(ctx.proc_id)) {
            node.clear_pending();
            let reverted = match err.kind {
                // Still open where it was
                ProcedureErrorKind::AttemptsExhausted => self
                    .server
                    .clone()
                    .map(|server| env.ctx.commit(&mut node, RegionState::Open, Some(server))),
                ProcedureErrorKind::Aborted => {
                    Some(env.ctx.commit(&mut node, RegionState::Aborted, None))
                }
                _ => None,
            };
            if let Some(Err(e)) = reverted {
                warn!(region = %self.region, "Could not record rollback: {}", e);
            }
            if self.inherited_lock.is_none() {
                env.ctx.unlock_region(&mut node, ctx.proc_id);
            }
        }
        env.ctx
            .metrics
            .unassign
            .record_failure(elapsed_since(self.started_at));
    }

    fn on_restore(&mut self, env: &MasterEnv, proc_id: ProcId) {
        if self.inherited_lock.is_none() {
            let node = env.ctx.node(&self.region);
            env.ctx
                .restore_lock(&mut node.lock(), proc_id, LockKind::Unassign);
        }
        if self.step == UnassignStep::AwaitClose {
            self.step = UnassignStep::Dispatch;
            self.op_id = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum MoveStep {
    Unassign,
    Assign,
    Finish,
}

/// Close a region and reopen it elsewhere, holding its lock throughout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRegionProcedure {
    region: RegionInfo,
    step: MoveStep,
    destination: Option<ServerName>,
    source: Option<ServerName>,
    started_at: u64,
}

impl MoveRegionProcedure {
    pub fn new(region: RegionInfo, destination: Option<ServerName>) -> Self {
        Self {
            region,
            step: MoveStep::Unassign,
            destination,
            source: None,
            started_at: timestamp_now_millis(),
        }
    }

    pub fn region(&self) -> &RegionInfo {
        &self.region
    }

    fn metrics<'a>(&self, env: &'a MasterEnv) -> &'a ProcedureMetrics {
        &env.ctx.metrics.move_region
    }

    fn child_failure(&self, ctx: &StepContext<'_>) -> Option<ProcedureError> {
        ctx.failed_children.first().map(|(child, err)| {
            ProcedureError::child_failed(format!(
                "move of {}: child {} failed: {}",
                self.region, child, err
            ))
        })
    }

    fn assign_child(&self, ctx: &StepContext<'_>) -> (ProcId, MasterProcedure) {
        let mut child = AssignProcedure::new(self.region.clone())
            .with_target(self.destination.clone())
            .child_of(ctx.proc_id);
        if let Some(source) = &self.source {
            child = child.excluding(source.clone());
        }
        (ctx.reserve_id(), MasterProcedure::Assign(child))
    }

    fn execute(&mut self, env: &MasterEnv, ctx: &StepContext<'_>) -> StepResult {
        let node = env.ctx.node(&self.region);
        let mut node = node.lock();
        if !node.is_owned_by(ctx.proc_id) {
            return Err(lost_lock(&self.region));
        }
        if let Some(err) = self.child_failure(ctx) {
            return Err(err);
        }

        match self.step {
            MoveStep::Unassign => {
                self.source = node.location.clone();
                self.step = MoveStep::Assign;
                let child = UnassignProcedure::new(self.region.clone())
                    .with_destination(self.destination.clone())
                    .child_of(ctx.proc_id);
                Ok(Flow::Spawn(vec![(
                    ctx.reserve_id(),
                    MasterProcedure::Unassign(child),
                )]))
            }
            MoveStep::Assign => {
                self.step = MoveStep::Finish;
                Ok(Flow::Spawn(vec![self.assign_child(ctx)]))
            }
            MoveStep::Finish => {
                // The new server may have died after the open but before we
                // got here; the crash scan then left the region to us
                let crashed = node.take_signals().into_iter().any(|signal| {
                    matches!(
                        signal,
                        RegionSignal::ServerCrashed { ref server }
                            if node.location.as_ref() == Some(server)
                    )
                });
                if crashed {
                    env.ctx.commit(&mut node, RegionState::Offline, None)?;
                    return Ok(Flow::Spawn(vec![self.assign_child(ctx)]));
                }

                env.ctx.unlock_region(&mut node, ctx.proc_id);
                self.metrics(env)
                    .record_success(elapsed_since(self.started_at));
                info!(
                    region = %self.region,
                    from = ?self.source,
                    to = ?node.location,
                    "Move procedure {} finished",
                    ctx.proc_id
                );
                Ok(Flow::Done)
            }
        }
    }

    fn rollback(&mut self, env: &MasterEnv, ctx: &StepContext<'_>, _err: &ProcedureError) {
        let node = env.ctx.node(&self.region);
        env.ctx.unlock_region(&mut node.lock(), ctx.proc_id);
        self.metrics(env)
            .record_failure(elapsed_since(self.started_at));
    }

    fn on_restore(&mut self, env: &MasterEnv, proc_id: ProcId) {
        let node = env.ctx.node(&self.region);
        env.ctx
            .restore_lock(&mut node.lock(), proc_id, LockKind::Move);
    }
}
