//! Durable procedure framework
//!
//! A procedure is a resumable state machine. The executor runs one step at a
//! time on a worker pool; the [`Flow`] returned by each step says what happens
//! next:
//!
//! - `Continue` / `Delay`: run again, immediately or after a backoff
//! - `Suspend`: park until an [`EventKey`] is woken (or a timeout elapses)
//! - `Spawn`: start child procedures and resume once all of them finish
//! - `Done`: the procedure completed successfully
//!
//! Returning an error from a step invokes the procedure's rollback and marks it
//! failed. Every step is appended to the [`store::ProcedureStore`] before the
//! procedure is considered to have advanced, so a restarted executor resumes
//! from the last persisted step.

pub mod executor;
pub mod scheduler;
pub mod store;

use crate::common::ProcedureError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use executor::ProcedureExecutor;
pub use scheduler::{ProcedureScheduler, WakeReason, Wakeup};
pub use store::{
    MemoryProcedureStore, ProcedureRecord, ProcedureStore, RecordStatus, StoreEntry,
    WalProcedureStore,
};

pub type ProcId = u64;

/// Name of something a suspended procedure waits for
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey(String);

impl EventKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the executor should do after a step
#[derive(Debug)]
pub enum Flow<P> {
    Continue,
    Delay(Duration),
    Suspend {
        event: EventKey,
        timeout: Option<Duration>,
    },
    /// Children with ids from [`StepContext::reserve_id`]
    Spawn(Vec<(ProcId, P)>),
    Done,
}

impl<P> Flow<P> {
    pub fn suspend(event: EventKey) -> Self {
        Flow::Suspend {
            event,
            timeout: None,
        }
    }
}

/// Terminal result of a procedure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureOutcome {
    Succeeded,
    Failed(ProcedureError),
}

impl ProcedureOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcedureOutcome::Succeeded)
    }

    pub fn error(&self) -> Option<&ProcedureError> {
        match self {
            ProcedureOutcome::Succeeded => None,
            ProcedureOutcome::Failed(e) => Some(e),
        }
    }
}

/// Per-step view of the executor handed to a procedure
pub struct StepContext<'a> {
    pub proc_id: ProcId,
    pub parent_id: Option<ProcId>,
    /// Steps executed so far, this one included
    pub steps: u64,
    /// Resumed because a suspension timeout elapsed rather than an event
    pub timed_out: bool,
    /// Children that finished with an error since the last spawn
    pub failed_children: &'a [(ProcId, ProcedureError)],
    scheduler: &'a ProcedureScheduler,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        proc_id: ProcId,
        parent_id: Option<ProcId>,
        steps: u64,
        timed_out: bool,
        failed_children: &'a [(ProcId, ProcedureError)],
        scheduler: &'a ProcedureScheduler,
    ) -> Self {
        Self {
            proc_id,
            parent_id,
            steps,
            timed_out,
            failed_children,
            scheduler,
        }
    }

    /// Allocate an id for a child before returning it in [`Flow::Spawn`]
    pub fn reserve_id(&self) -> ProcId {
        self.scheduler.reserve_id()
    }
}

pub trait Procedure: Serialize + DeserializeOwned + Send + 'static {
    type Env: Send + Sync + 'static;

    /// Short kind name for logs and metrics
    fn kind(&self) -> &'static str;

    /// Current step, for logs
    fn state_tag(&self) -> String;

    fn execute(
        &mut self,
        env: &Self::Env,
        ctx: &StepContext<'_>,
    ) -> Result<Flow<Self>, ProcedureError>;

    /// Undo in-memory side effects after `execute` failed
    fn rollback(&mut self, _env: &Self::Env, _ctx: &StepContext<'_>, _err: &ProcedureError) {}

    /// Re-establish volatile state after the procedure is replayed from the store
    fn on_restore(&mut self, _env: &Self::Env, _proc_id: ProcId) {}
}
