//! Procedure executor
//!
//! Runs procedure steps on a pool of worker tasks. Steps are persisted to the
//! [`ProcedureStore`] before the in-memory state moves on; a failed append is
//! fatal and stops the executor, as does any step that fails with a
//! store-unavailable error. On startup [`ProcedureExecutor::recover`] replays
//! the store and resumes every unfinished procedure.

use crate::common::{Error, ProcedureError, ProcedureErrorKind, Result};
use crate::procedure::{
    Flow, ProcId, Procedure, ProcedureOutcome, ProcedureRecord, ProcedureScheduler,
    ProcedureStore, RecordStatus, StepContext, StoreEntry, WakeReason, Wakeup,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Runnable,
    Running,
    Delayed,
    Suspended(crate::procedure::EventKey),
    WaitingChildren,
    Finished(ProcedureOutcome),
}

struct ProcEntry<P> {
    parent_id: Option<ProcId>,
    procedure: Option<P>,
    kind: &'static str,
    status: Status,
    token: u64,
    steps: u64,
    children: Vec<ProcId>,
    pending_children: usize,
    failed_children: Vec<(ProcId, ProcedureError)>,
}

impl<P: Procedure> ProcEntry<P> {
    fn new(parent_id: Option<ProcId>, procedure: P) -> Self {
        Self {
            parent_id,
            kind: procedure.kind(),
            procedure: Some(procedure),
            status: Status::Runnable,
            token: 0,
            steps: 0,
            children: Vec::new(),
            pending_children: 0,
            failed_children: Vec::new(),
        }
    }
}

/// How long finished outcomes stay available to [`ProcedureExecutor::wait_result`]
pub const DEFAULT_RESULT_RETENTION: Duration = Duration::from_secs(300);

/// Outcomes of finished procedures, evicted once older than `retention`
struct ResultCache {
    outcomes: HashMap<ProcId, ProcedureOutcome>,
    order: VecDeque<(Instant, ProcId)>,
    retention: Duration,
}

impl ResultCache {
    fn new(retention: Duration) -> Self {
        Self {
            outcomes: HashMap::new(),
            order: VecDeque::new(),
            retention,
        }
    }

    fn insert(&mut self, id: ProcId, outcome: ProcedureOutcome) {
        self.evict();
        if self.outcomes.insert(id, outcome).is_none() {
            self.order.push_back((Instant::now(), id));
        }
    }

    fn get(&mut self, id: ProcId) -> Option<ProcedureOutcome> {
        self.evict();
        self.outcomes.get(&id).cloned()
    }

    fn len(&mut self) -> usize {
        self.evict();
        self.outcomes.len()
    }

    fn evict(&mut self) {
        let now = Instant::now();
        while let Some(&(finished_at, id)) = self.order.front() {
            if now.duration_since(finished_at) < self.retention {
                break;
            }
            self.outcomes.remove(&id);
            self.order.pop_front();
        }
    }
}

/// Short description of a live procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureSummary {
    pub proc_id: ProcId,
    pub parent_id: Option<ProcId>,
    pub kind: &'static str,
    pub status: String,
    pub steps: u64,
}

struct ExecutorInner<P: Procedure> {
    env: Arc<P::Env>,
    store: Arc<dyn ProcedureStore>,
    scheduler: Arc<ProcedureScheduler>,
    procs: Mutex<HashMap<ProcId, ProcEntry<P>>>,
    results: Mutex<ResultCache>,
    completion: Notify,
    stopped: AtomicBool,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

pub struct ProcedureExecutor<P: Procedure> {
    inner: Arc<ExecutorInner<P>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: Procedure> ProcedureExecutor<P> {
    /// Replay `store` and rebuild every unfinished procedure. Nothing runs
    /// until [`start`](Self::start).
    pub fn recover(
        env: Arc<P::Env>,
        store: Arc<dyn ProcedureStore>,
        scheduler: Arc<ProcedureScheduler>,
    ) -> Result<Self> {
        let history = store.replay_all()?;

        let mut records: Vec<ProcedureRecord> = Vec::new();
        for (id, entries) in history {
            scheduler.observe_id(id);
            match entries.into_iter().last() {
                Some(StoreEntry::Update(record)) => records.push(record),
                Some(StoreEntry::Delete(_)) | None => {}
            }
        }

        let mut procs: HashMap<ProcId, ProcEntry<P>> = HashMap::new();
        let mut finished: HashMap<ProcId, (Option<ProcId>, ProcedureOutcome)> = HashMap::new();
        for record in &records {
            match &record.status {
                RecordStatus::Finished(outcome) => {
                    finished.insert(record.proc_id, (record.parent_id, outcome.clone()));
                }
                RecordStatus::Runnable | RecordStatus::WaitingChildren => {
                    let procedure: P = bincode::deserialize(&record.payload).map_err(|e| {
                        Error::Codec(format!("procedure {}: {}", record.proc_id, e))
                    })?;
                    let mut entry = ProcEntry::new(record.parent_id, procedure);
                    entry.steps = record.steps;
                    procs.insert(record.proc_id, entry);
                }
            }
        }

        // Link children to their unfinished parents
        let mut live = Vec::new();
        for record in &records {
            let Some(parent_id) = record.parent_id else {
                if procs.contains_key(&record.proc_id) {
                    live.push(record.clone());
                }
                continue;
            };

            let finished_child = finished.get(&record.proc_id).map(|(_, o)| o.clone());
            match procs.get_mut(&parent_id) {
                Some(parent) => {
                    parent.children.push(record.proc_id);
                    match finished_child {
                        None => parent.pending_children += 1,
                        Some(ProcedureOutcome::Failed(err)) => {
                            parent.failed_children.push((record.proc_id, err))
                        }
                        Some(ProcedureOutcome::Succeeded) => {}
                    }
                    live.push(record.clone());
                }
                None => {
                    if let Some(child) = procs.get_mut(&record.proc_id) {
                        warn!(
                            "Procedure {} lost its parent {}; resuming it as a root",
                            record.proc_id, parent_id
                        );
                        child.parent_id = None;
                        let mut orphan = record.clone();
                        orphan.parent_id = None;
                        live.push(orphan);
                    }
                }
            }
        }

        for (id, entry) in procs.iter_mut() {
            entry.status = if entry.pending_children > 0 {
                Status::WaitingChildren
            } else {
                Status::Runnable
            };
            if let Some(procedure) = entry.procedure.as_mut() {
                procedure.on_restore(&env, *id);
            }
        }

        store.compact(&live)?;

        // Finished roots are only present if the process stopped between the
        // final update and its delete
        let mut results = ResultCache::new(DEFAULT_RESULT_RETENTION);
        for (id, (parent_id, outcome)) in finished {
            if parent_id.is_none() {
                results.insert(id, outcome);
            }
        }

        if !procs.is_empty() {
            info!("Recovered {} unfinished procedures", procs.len());
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ExecutorInner {
                env,
                store,
                scheduler,
                procs: Mutex::new(procs),
                results: Mutex::new(results),
                completion: Notify::new(),
                stopped: AtomicBool::new(false),
                running: AtomicBool::new(true),
                shutdown_tx,
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn `worker_threads` workers and schedule every runnable procedure
    pub fn start(&self, worker_threads: usize) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }

        for worker in 0..worker_threads.max(1) {
            let inner = self.inner.clone();
            let shutdown = self.inner.shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                inner.worker_loop(worker, shutdown).await;
            }));
        }

        let procs = self.inner.procs.lock();
        for (id, entry) in procs.iter() {
            if entry.status == Status::Runnable {
                self.inner.scheduler.schedule(Wakeup {
                    proc_id: *id,
                    token: entry.token,
                    reason: WakeReason::Scheduled,
                });
            }
        }
        debug!("Procedure executor started with {} workers", workers.len());
    }

    pub fn env(&self) -> &Arc<P::Env> {
        &self.inner.env
    }

    pub fn scheduler(&self) -> &Arc<ProcedureScheduler> {
        &self.inner.scheduler
    }

    /// Keep finished outcomes for `retention` instead of the default
    pub fn set_result_retention(&self, retention: Duration) {
        let mut results = self.inner.results.lock();
        results.retention = retention;
        results.evict();
    }

    pub fn submit(&self, procedure: P) -> Result<ProcId> {
        let id = self.reserve_id();
        self.submit_with_id(id, procedure)
    }

    pub fn reserve_id(&self) -> ProcId {
        self.inner.scheduler.reserve_id()
    }

    /// Submit with an id from [`ProcedureScheduler::reserve_id`]. The
    /// procedure is durable once this returns. If the id was claimed, the
    /// claim is settled either way: waiters see the procedure or its
    /// rejection.
    pub fn submit_with_id(&self, id: ProcId, procedure: P) -> Result<ProcId> {
        match self.inner.insert_root(id, procedure) {
            Ok(()) => Ok(id),
            Err(e) => {
                self.inner.reject(id, &e);
                Err(e)
            }
        }
    }

    /// Outcome of a finished procedure, if it has finished recently
    pub fn result(&self, id: ProcId) -> Option<ProcedureOutcome> {
        self.inner.results.lock().get(id)
    }

    pub fn is_finished(&self, id: ProcId) -> bool {
        self.result(id).is_some()
    }

    /// Finished outcomes still held
    pub fn retained_results(&self) -> usize {
        self.inner.results.lock().len()
    }

    pub async fn wait_result(&self, id: ProcId, timeout: Duration) -> Result<ProcedureOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.completion.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.result(id) {
                return Ok(outcome);
            }
            if let Some(reason) = self.inner.scheduler.halted() {
                return Err(Error::StoreUnavailable(reason));
            }
            // Claims settle only after the procedure is inserted, and
            // outcomes are recorded before it is removed
            let known =
                self.inner.scheduler.is_claimed(id) || self.inner.procs.lock().contains_key(&id);
            if !known {
                return match self.result(id) {
                    Some(outcome) => Ok(outcome),
                    None => Err(Error::UnknownProcedure(id)),
                };
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout(format!("procedure {} did not finish", id)));
            }
        }
    }

    /// Procedures not yet finished
    pub fn active_count(&self) -> usize {
        self.inner
            .procs
            .lock()
            .values()
            .filter(|e| !matches!(e.status, Status::Finished(_)))
            .count()
    }

    pub fn summaries(&self) -> Vec<ProcedureSummary> {
        let procs = self.inner.procs.lock();
        let mut out: Vec<ProcedureSummary> = procs
            .iter()
            .map(|(id, entry)| ProcedureSummary {
                proc_id: *id,
                parent_id: entry.parent_id,
                kind: entry.kind,
                status: format!("{:?}", entry.status),
                steps: entry.steps,
            })
            .collect();
        out.sort_by_key(|s| s.proc_id);
        out
    }

    pub fn is_fatal(&self) -> bool {
        self.inner.scheduler.halted().is_some()
    }

    /// Stop the workers and wait for in-flight steps to finish
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(true);

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        self.inner.completion.notify_waiters();
        debug!("Procedure executor stopped");
    }
}

impl<P: Procedure> ExecutorInner<P> {
    async fn worker_loop(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() || !self.running.load(Ordering::SeqCst) {
                break;
            }

            let wakeup = tokio::select! {
                w = self.scheduler.next() => match w {
                    Some(w) => w,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.run_step(wakeup);
        }
        debug!("Procedure worker {} exiting", worker);
    }

    fn check_available(&self) -> Result<()> {
        if let Some(reason) = self.scheduler.halted() {
            return Err(Error::StoreUnavailable(reason));
        }
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn insert_root(&self, id: ProcId, procedure: P) -> Result<()> {
        self.check_available()?;

        let record = self.record_for(id, None, &procedure, RecordStatus::Runnable, 0)?;
        self.persist(&[StoreEntry::Update(record)])?;

        debug!("Submitted {} procedure {}", procedure.kind(), id);
        self.procs.lock().insert(id, ProcEntry::new(None, procedure));
        self.scheduler.settle(id);
        self.scheduler.schedule(Wakeup {
            proc_id: id,
            token: 0,
            reason: WakeReason::Scheduled,
        });
        Ok(())
    }

    /// Give waiters on a claimed id that never got submitted a failed outcome
    fn reject(&self, id: ProcId, err: &Error) {
        self.results.lock().insert(
            id,
            ProcedureOutcome::Failed(ProcedureError::new(
                if err.is_fatal() {
                    ProcedureErrorKind::StoreUnavailable
                } else {
                    ProcedureErrorKind::Internal
                },
                format!("submit failed: {}", err),
            )),
        );
        self.scheduler.settle(id);
        self.completion.notify_waiters();
    }

    fn record_for(
        &self,
        id: ProcId,
        parent_id: Option<ProcId>,
        procedure: &P,
        status: RecordStatus,
        steps: u64,
    ) -> Result<ProcedureRecord> {
        Ok(ProcedureRecord {
            proc_id: id,
            parent_id,
            kind: procedure.kind().to_string(),
            state_tag: procedure.state_tag(),
            status,
            steps,
            payload: bincode::serialize(procedure)?,
        })
    }

    fn persist(&self, entries: &[StoreEntry]) -> Result<()> {
        match self.store.append_batch(entries) {
            Ok(()) => Ok(()),
            Err(e) => {
                let reason = e.to_string();
                self.mark_fatal(&reason);
                Err(Error::StoreUnavailable(reason))
            }
        }
    }

    fn mark_fatal(&self, reason: &str) {
        self.scheduler.halt(reason);
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("Durable store failed, stopping executor: {}", reason);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        self.completion.notify_waiters();
    }

    fn run_step(&self, wakeup: Wakeup) {
        let id = wakeup.proc_id;
        let (mut procedure, parent_id, steps, failed_children, previous) = {
            let mut procs = self.procs.lock();
            let Some(entry) = procs.get_mut(&id) else {
                return;
            };
            if entry.token != wakeup.token {
                return;
            }
            match entry.status {
                Status::Runnable | Status::Delayed | Status::Suspended(_) => {}
                _ => return,
            }
            let Some(procedure) = entry.procedure.take() else {
                return;
            };
            let previous = std::mem::replace(&mut entry.status, Status::Running);
            entry.steps += 1;
            (
                procedure,
                entry.parent_id,
                entry.steps,
                std::mem::take(&mut entry.failed_children),
                previous,
            )
        };

        let mut timed_out = false;
        if let Status::Suspended(key) = &previous {
            if wakeup.reason != WakeReason::Event {
                self.scheduler.unregister(key, id);
                timed_out = wakeup.reason == WakeReason::Timer;
            }
        }

        let ctx = StepContext::new(
            id,
            parent_id,
            steps,
            timed_out,
            &failed_children,
            &self.scheduler,
        );

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            procedure.execute(&self.env, &ctx)
        }))
        .unwrap_or_else(|_| Err(ProcedureError::internal("procedure step panicked")));

        // A store failure during the step leaves its effects unpersisted;
        // neither advance nor roll back over them
        if let Some(reason) = self.scheduler.halted() {
            warn!(
                "{} procedure {} stopped at {}: store unavailable",
                procedure.kind(),
                id,
                procedure.state_tag()
            );
            return self.mark_fatal(&reason);
        }

        match result {
            Ok(flow) => self.apply_flow(id, parent_id, steps, procedure, flow),
            Err(err) if err.is_fatal() => self.mark_fatal(&err.message),
            Err(err) => {
                warn!(
                    "{} procedure {} failed at {}: {}",
                    procedure.kind(),
                    id,
                    procedure.state_tag(),
                    err
                );
                procedure.rollback(&self.env, &ctx, &err);
                if let Some(reason) = self.scheduler.halted() {
                    return self.mark_fatal(&reason);
                }
                self.finish(id, parent_id, procedure, ProcedureOutcome::Failed(err));
            }
        }
    }

    fn apply_flow(
        &self,
        id: ProcId,
        parent_id: Option<ProcId>,
        steps: u64,
        procedure: P,
        flow: Flow<P>,
    ) {
        match flow {
            Flow::Done => self.finish(id, parent_id, procedure, ProcedureOutcome::Succeeded),
            Flow::Spawn(children) if children.is_empty() => {
                self.advance(id, parent_id, steps, procedure, Status::Runnable, None)
            }
            Flow::Spawn(children) => self.spawn(id, parent_id, steps, procedure, children),
            Flow::Continue => {
                self.advance(id, parent_id, steps, procedure, Status::Runnable, None)
            }
            Flow::Delay(delay) => {
                self.advance(id, parent_id, steps, procedure, Status::Delayed, Some(delay))
            }
            Flow::Suspend { event, timeout } => self.advance(
                id,
                parent_id,
                steps,
                procedure,
                Status::Suspended(event),
                timeout,
            ),
        }
    }

    /// Persist the step, then park or requeue the procedure
    fn advance(
        &self,
        id: ProcId,
        parent_id: Option<ProcId>,
        steps: u64,
        procedure: P,
        status: Status,
        delay: Option<Duration>,
    ) {
        let record = match self.record_for(id, parent_id, &procedure, RecordStatus::Runnable, steps)
        {
            Ok(record) => record,
            Err(e) => return self.mark_fatal(&e.to_string()),
        };
        if self.persist(&[StoreEntry::Update(record)]).is_err() {
            return;
        }

        let token = {
            let mut procs = self.procs.lock();
            let Some(entry) = procs.get_mut(&id) else {
                return;
            };
            entry.procedure = Some(procedure);
            entry.status = status.clone();
            entry.token += 1;
            entry.token
        };

        match status {
            Status::Runnable => self.scheduler.schedule(Wakeup {
                proc_id: id,
                token,
                reason: WakeReason::Scheduled,
            }),
            Status::Delayed => self.scheduler.schedule_after(
                Wakeup {
                    proc_id: id,
                    token,
                    reason: WakeReason::Timer,
                },
                delay.unwrap_or_default(),
            ),
            Status::Suspended(event) => {
                self.scheduler.suspend(
                    &event,
                    Wakeup {
                        proc_id: id,
                        token,
                        reason: WakeReason::Event,
                    },
                );
                if let Some(timeout) = delay {
                    self.scheduler.schedule_after(
                        Wakeup {
                            proc_id: id,
                            token,
                            reason: WakeReason::Timer,
                        },
                        timeout,
                    );
                }
            }
            _ => {}
        }
    }

    fn spawn(
        &self,
        id: ProcId,
        parent_id: Option<ProcId>,
        steps: u64,
        procedure: P,
        children: Vec<(ProcId, P)>,
    ) {
        let mut entries = Vec::with_capacity(children.len() + 1);
        for (child_id, child) in &children {
            match self.record_for(*child_id, Some(id), child, RecordStatus::Runnable, 0) {
                Ok(record) => entries.push(StoreEntry::Update(record)),
                Err(e) => return self.mark_fatal(&e.to_string()),
            }
        }
        match self.record_for(id, parent_id, &procedure, RecordStatus::WaitingChildren, steps) {
            Ok(record) => entries.push(StoreEntry::Update(record)),
            Err(e) => return self.mark_fatal(&e.to_string()),
        }
        if self.persist(&entries).is_err() {
            return;
        }

        let child_ids: Vec<ProcId> = children.iter().map(|(child_id, _)| *child_id).collect();
        {
            let mut procs = self.procs.lock();
            for (child_id, child) in children {
                debug!("Procedure {} spawned {} child {}", id, child.kind(), child_id);
                procs.insert(child_id, ProcEntry::new(Some(id), child));
                self.scheduler.settle(child_id);
            }
            if let Some(entry) = procs.get_mut(&id) {
                entry.procedure = Some(procedure);
                entry.status = Status::WaitingChildren;
                entry.token += 1;
                entry.children.extend(child_ids.iter().copied());
                entry.pending_children += child_ids.len();
            }
        }

        for child_id in child_ids {
            self.scheduler.schedule(Wakeup {
                proc_id: child_id,
                token: 0,
                reason: WakeReason::Scheduled,
            });
        }
    }

    fn finish(&self, id: ProcId, parent_id: Option<ProcId>, procedure: P, outcome: ProcedureOutcome) {
        let kind = procedure.kind();

        let entries = match parent_id {
            Some(_) => {
                let steps = self.procs.lock().get(&id).map_or(0, |e| e.steps);
                vec![StoreEntry::Update(ProcedureRecord {
                    proc_id: id,
                    parent_id,
                    kind: kind.to_string(),
                    state_tag: procedure.state_tag(),
                    status: RecordStatus::Finished(outcome.clone()),
                    steps,
                    payload: Vec::new(),
                })]
            }
            None => {
                let procs = self.procs.lock();
                let mut deletes = vec![StoreEntry::Delete(id)];
                deletes.extend(
                    descendants(&procs, id)
                        .into_iter()
                        .map(StoreEntry::Delete),
                );
                deletes
            }
        };
        if self.persist(&entries).is_err() {
            return;
        }
        drop(procedure);

        // Recorded before the entry goes so a waiter always finds one of them
        self.results.lock().insert(id, outcome.clone());

        let mut wake_parent = None;
        {
            let mut procs = self.procs.lock();
            match parent_id {
                None => {
                    for child in descendants(&procs, id) {
                        procs.remove(&child);
                    }
                    procs.remove(&id);
                }
                Some(parent) => {
                    if let Some(entry) = procs.get_mut(&id) {
                        entry.status = Status::Finished(outcome.clone());
                    }
                    if let Some(entry) = procs.get_mut(&parent) {
                        entry.pending_children = entry.pending_children.saturating_sub(1);
                        if let ProcedureOutcome::Failed(err) = &outcome {
                            entry.failed_children.push((id, err.clone()));
                        }
                        if entry.pending_children == 0 && entry.status == Status::WaitingChildren {
                            entry.status = Status::Runnable;
                            entry.token += 1;
                            wake_parent = Some((parent, entry.token));
                        }
                    }
                }
            }
        }

        match &outcome {
            ProcedureOutcome::Succeeded => info!("{} procedure {} succeeded", kind, id),
            ProcedureOutcome::Failed(err) => info!("{} procedure {} failed: {}", kind, id, err),
        }

        self.completion.notify_waiters();

        if let Some((parent, token)) = wake_parent {
            self.scheduler.schedule(Wakeup {
                proc_id: parent,
                token,
                reason: WakeReason::Scheduled,
            });
        }
    }
}

fn descendants<P>(procs: &HashMap<ProcId, ProcEntry<P>>, root: ProcId) -> Vec<ProcId> {
    let mut out = Vec::new();
    let mut stack = procs
        .get(&root)
        .map(|e| e.children.clone())
        .unwrap_or_default();
    while let Some(id) = stack.pop() {
        if let Some(entry) = procs.get(&id) {
            stack.extend(entry.children.iter().copied());
        }
        out.push(id);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::{EventKey, MemoryProcedureStore, WalProcedureStore};
    use crate::common::WalSyncPolicy;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    #[derive(Default)]
    struct TestEnv {
        restored: AtomicUsize,
        rolled_back: AtomicUsize,
        timed_out: AtomicUsize,
        gate_open: AtomicBool,
    }

    #[derive(Debug, Serialize, Deserialize)]
    enum TestProc {
        /// Counts down, one step each
        Countdown(u32),
        /// Fails on the first step
        Failing,
        /// Waits until the env gate is open
        Gate { resumed: bool },
        /// Spawns `n` countdowns, then finishes
        Parent { n: u32, spawned: bool },
        /// Spawns a failing child
        BadParent { spawned: bool },
        /// Suspends once with a timeout, then finishes
        Timed { waited: bool, timeout_ms: u64 },
        /// Loses its durable store mid-step
        StoreLost,
    }

    impl Procedure for TestProc {
        type Env = TestEnv;

        fn kind(&self) -> &'static str {
            "test"
        }

        fn state_tag(&self) -> String {
            format!("{:?}", self)
        }

        fn execute(
            &mut self,
            env: &TestEnv,
            ctx: &StepContext<'_>,
        ) -> std::result::Result<Flow<Self>, ProcedureError> {
            match self {
                TestProc::Countdown(0) => Ok(Flow::Done),
                TestProc::Countdown(n) => {
                    *n -= 1;
                    Ok(Flow::Continue)
                }
                TestProc::Failing => Err(ProcedureError::aborted("always fails")),
                TestProc::Gate { resumed } => {
                    if env.gate_open.load(Ordering::SeqCst) {
                        *resumed = true;
                        Ok(Flow::Done)
                    } else {
                        Ok(Flow::suspend(EventKey::new("gate")))
                    }
                }
                TestProc::Parent { n, spawned } => {
                    if *spawned {
                        return Ok(Flow::Done);
                    }
                    *spawned = true;
                    let children = (0..*n)
                        .map(|i| (ctx.reserve_id(), TestProc::Countdown(i)))
                        .collect();
                    Ok(Flow::Spawn(children))
                }
                TestProc::BadParent { spawned } => {
                    if *spawned {
                        if ctx.failed_children.is_empty() {
                            return Ok(Flow::Done);
                        }
                        return Err(ProcedureError::child_failed("child failed"));
                    }
                    *spawned = true;
                    Ok(Flow::Spawn(vec![(ctx.reserve_id(), TestProc::Failing)]))
                }
                TestProc::Timed { waited, timeout_ms } => {
                    if *waited {
                        if ctx.timed_out {
                            env.timed_out.fetch_add(1, Ordering::SeqCst);
                        }
                        return Ok(Flow::Done);
                    }
                    *waited = true;
                    Ok(Flow::Suspend {
                        event: EventKey::new("timed"),
                        timeout: Some(Duration::from_millis(*timeout_ms)),
                    })
                }
                TestProc::StoreLost => Err(ProcedureError::store_unavailable("table write failed")),
            }
        }

        fn rollback(&mut self, env: &TestEnv, _ctx: &StepContext<'_>, _err: &ProcedureError) {
            env.rolled_back.fetch_add(1, Ordering::SeqCst);
        }

        fn on_restore(&mut self, env: &TestEnv, _proc_id: ProcId) {
            env.restored.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn executor(store: Arc<dyn ProcedureStore>) -> ProcedureExecutor<TestProc> {
        ProcedureExecutor::recover(
            Arc::new(TestEnv::default()),
            store,
            Arc::new(ProcedureScheduler::new()),
        )
        .unwrap()
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_runs_to_completion() {
        let store = Arc::new(MemoryProcedureStore::new());
        let exec = executor(store.clone());
        exec.start(4);

        let id = exec.submit(TestProc::Countdown(5)).unwrap();
        let outcome = exec.wait_result(id, WAIT).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(exec.active_count(), 0);

        // Finished root leaves a delete as its last record
        let history = store.replay_all().unwrap();
        assert_eq!(history[0].1.last().unwrap(), &StoreEntry::Delete(id));
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_rolls_back() {
        let exec = executor(Arc::new(MemoryProcedureStore::new()));
        exec.start(2);

        let id = exec.submit(TestProc::Failing).unwrap();
        let outcome = exec.wait_result(id, WAIT).await.unwrap();
        assert_eq!(
            outcome.error().unwrap().kind,
            crate::common::ProcedureErrorKind::Aborted
        );
        assert_eq!(exec.env().rolled_back.load(Ordering::SeqCst), 1);
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn test_suspend_and_wake() {
        let exec = executor(Arc::new(MemoryProcedureStore::new()));
        exec.start(2);

        let id = exec.submit(TestProc::Gate { resumed: false }).unwrap();
        assert!(exec.wait_result(id, Duration::from_millis(100)).await.is_err());

        exec.env().gate_open.store(true, Ordering::SeqCst);
        exec.scheduler().wake(&EventKey::new("gate"));
        assert!(exec.wait_result(id, WAIT).await.unwrap().is_success());
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn test_children_complete_before_parent() {
        let exec = executor(Arc::new(MemoryProcedureStore::new()));
        exec.start(4);

        let id = exec.submit(TestProc::Parent { n: 5, spawned: false }).unwrap();
        assert!(exec.wait_result(id, WAIT).await.unwrap().is_success());
        assert_eq!(exec.active_count(), 0);

        let id = exec.submit(TestProc::BadParent { spawned: false }).unwrap();
        let outcome = exec.wait_result(id, WAIT).await.unwrap();
        assert_eq!(
            outcome.error().unwrap().kind,
            crate::common::ProcedureErrorKind::ChildFailed
        );
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn test_store_failure_is_fatal() {
        let store = Arc::new(MemoryProcedureStore::new());
        let exec = executor(store.clone());
        exec.start(2);

        let id = exec.submit(TestProc::Gate { resumed: false }).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.set_fail_appends(true);
        exec.env().gate_open.store(true, Ordering::SeqCst);
        exec.scheduler().wake(&EventKey::new("gate"));

        let err = exec.wait_result(id, WAIT).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(exec.is_fatal());
        assert!(matches!(
            exec.submit(TestProc::Countdown(1)),
            Err(Error::StoreUnavailable(_))
        ));
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn test_suspend_timeout_elapses() {
        let exec = executor(Arc::new(MemoryProcedureStore::new()));
        exec.start(2);

        let id = exec
            .submit(TestProc::Timed {
                waited: false,
                timeout_ms: 50,
            })
            .unwrap();
        assert!(exec.wait_result(id, WAIT).await.unwrap().is_success());
        assert_eq!(exec.env().timed_out.load(Ordering::SeqCst), 1);
        assert_eq!(exec.scheduler().waiting_on(&EventKey::new("timed")), 0);
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn test_wake_beats_suspend_timeout() {
        let exec = executor(Arc::new(MemoryProcedureStore::new()));
        exec.start(2);

        let id = exec
            .submit(TestProc::Timed {
                waited: false,
                timeout_ms: 60_000,
            })
            .unwrap();
        let key = EventKey::new("timed");
        while exec.scheduler().waiting_on(&key) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        exec.scheduler().wake(&key);

        assert!(exec.wait_result(id, WAIT).await.unwrap().is_success());
        assert_eq!(exec.env().timed_out.load(Ordering::SeqCst), 0);
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn test_results_expire_after_retention() {
        let exec = executor(Arc::new(MemoryProcedureStore::new()));
        exec.set_result_retention(Duration::from_millis(300));
        exec.start(2);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = exec.submit(TestProc::Countdown(1)).unwrap();
            assert!(exec.wait_result(id, WAIT).await.unwrap().is_success());
            ids.push(id);
        }
        assert_eq!(exec.retained_results(), 3);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(exec.retained_results(), 0);
        assert!(!exec.is_finished(ids[0]));
        assert!(matches!(
            exec.wait_result(ids[0], WAIT).await,
            Err(Error::UnknownProcedure(_))
        ));
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn test_claimed_id_can_be_waited_on_before_submit() {
        let exec = Arc::new(executor(Arc::new(MemoryProcedureStore::new())));
        exec.start(2);

        let id = exec.reserve_id();
        exec.scheduler().claim(id);
        let waiter = {
            let exec = exec.clone();
            tokio::spawn(async move { exec.wait_result(id, WAIT).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        exec.submit_with_id(id, TestProc::Countdown(2)).unwrap();
        assert!(!exec.scheduler().is_claimed(id));
        assert!(waiter.await.unwrap().unwrap().is_success());

        // An id nobody claimed or submitted is unknown
        let stray = exec.reserve_id();
        assert!(matches!(
            exec.wait_result(stray, WAIT).await,
            Err(Error::UnknownProcedure(_))
        ));
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_submit_fails_claimed_waiters() {
        let store = Arc::new(MemoryProcedureStore::new());
        let exec = Arc::new(executor(store.clone()));
        exec.start(2);

        let id = exec.reserve_id();
        exec.scheduler().claim(id);
        store.set_fail_appends(true);
        assert!(exec.submit_with_id(id, TestProc::Countdown(0)).is_err());

        let outcome = exec.wait_result(id, WAIT).await.unwrap();
        assert_eq!(
            outcome.error().unwrap().kind,
            crate::common::ProcedureErrorKind::StoreUnavailable
        );
        assert!(!exec.scheduler().is_claimed(id));
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn test_fatal_step_error_stops_executor() {
        let exec = executor(Arc::new(MemoryProcedureStore::new()));
        exec.start(2);

        let id = exec.submit(TestProc::StoreLost).unwrap();
        assert!(matches!(
            exec.wait_result(id, WAIT).await,
            Err(Error::StoreUnavailable(_))
        ));
        assert!(exec.is_fatal());
        // Nothing is rolled back over unpersisted effects
        assert_eq!(exec.env().rolled_back.load(Ordering::SeqCst), 0);
        assert!(matches!(
            exec.submit(TestProc::Countdown(0)),
            Err(Error::StoreUnavailable(_))
        ));
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn test_recover_resumes_suspended() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("procedures.wal");

        let id = {
            let store = Arc::new(WalProcedureStore::open(&path, WalSyncPolicy::Always).unwrap());
            let exec = executor(store);
            exec.start(2);
            let id = exec.submit(TestProc::Gate { resumed: false }).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            exec.shutdown().await;
            id
        };

        let store = Arc::new(WalProcedureStore::open(&path, WalSyncPolicy::Always).unwrap());
        let env = Arc::new(TestEnv::default());
        env.gate_open.store(true, Ordering::SeqCst);
        let exec = ProcedureExecutor::<TestProc>::recover(
            env,
            store,
            Arc::new(ProcedureScheduler::new()),
        )
        .unwrap();
        assert_eq!(exec.env().restored.load(Ordering::SeqCst), 1);
        assert_eq!(exec.active_count(), 1);

        exec.start(2);
        assert!(exec.wait_result(id, WAIT).await.unwrap().is_success());

        // New ids never reuse replayed ones
        assert!(exec.submit(TestProc::Countdown(0)).unwrap() > id);
        exec.shutdown().await;
    }
}
