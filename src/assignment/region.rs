//! Region, server and per-region state types

use crate::common::timestamp_now_millis;
use crate::procedure::{EventKey, ProcId};
use crate::assignment::dispatcher::DispatchOutcome;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// A storage node incarnation. Two names with the same address but a
/// different start code are different servers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerName {
    pub host: String,
    pub port: u16,
    pub start_code: u64,
}

impl ServerName {
    pub fn new(host: impl Into<String>, port: u16, start_code: u64) -> Self {
        Self {
            host: host.into(),
            port,
            start_code,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn same_address(&self, other: &ServerName) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.host, self.port, self.start_code)
    }
}

/// Immutable description of a key-range shard
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionInfo {
    pub table: String,
    pub start_key: Vec<u8>,
    /// Empty means unbounded
    pub end_key: Vec<u8>,
    pub region_id: u64,
    pub replica_id: u32,
    pub split: bool,
}

impl RegionInfo {
    pub fn new(
        table: impl Into<String>,
        start_key: impl Into<Vec<u8>>,
        end_key: impl Into<Vec<u8>>,
        region_id: u64,
    ) -> Self {
        Self {
            table: table.into(),
            start_key: start_key.into(),
            end_key: end_key.into(),
            region_id,
            replica_id: 0,
            split: false,
        }
    }

    pub fn with_replica(mut self, replica_id: u32) -> Self {
        self.replica_id = replica_id;
        self
    }

    pub fn as_split_parent(mut self) -> Self {
        self.split = true;
        self
    }

    /// Unique encoded name, used as the region's key everywhere
    pub fn name(&self) -> String {
        format!(
            "{},{},{}.{}",
            self.table,
            hex::encode(&self.start_key),
            self.region_id,
            self.replica_id
        )
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice()
            && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    /// Do the two key ranges intersect within the same table?
    pub fn overlaps(&self, other: &RegionInfo) -> bool {
        if self.table != other.table {
            return false;
        }
        let self_before_other = !self.end_key.is_empty() && self.end_key <= other.start_key;
        let other_before_self = !other.end_key.is_empty() && other.end_key <= self.start_key;
        !(self_before_other || other_before_self)
    }

    pub fn event_key(&self) -> EventKey {
        EventKey::new(format!("region:{}", self.name()))
    }
}

impl fmt::Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionState {
    Offline,
    PendingOpen,
    Opening,
    Open,
    PendingClose,
    Closing,
    Closed,
    FailedOpen,
    Aborted,
}

impl RegionState {
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            RegionState::PendingOpen
                | RegionState::Opening
                | RegionState::PendingClose
                | RegionState::Closing
        )
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegionState::Offline => "OFFLINE",
            RegionState::PendingOpen => "PENDING_OPEN",
            RegionState::Opening => "OPENING",
            RegionState::Open => "OPEN",
            RegionState::PendingClose => "PENDING_CLOSE",
            RegionState::Closing => "CLOSING",
            RegionState::Closed => "CLOSED",
            RegionState::FailedOpen => "FAILED_OPEN",
            RegionState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Outcome a storage node reports for a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionCode {
    Opened,
    FailedOpen,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionReport {
    pub server: ServerName,
    pub region: RegionInfo,
    pub code: TransitionCode,
    pub open_seq_num: u64,
}

/// Kind of procedure holding a region lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    Assign,
    Unassign,
    Move,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Assign => write!(f, "assign"),
            LockKind::Unassign => write!(f, "unassign"),
            LockKind::Move => write!(f, "move"),
        }
    }
}

/// Something the owning procedure must look at on its next step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionSignal {
    Reported {
        server: ServerName,
        code: TransitionCode,
        open_seq_num: u64,
    },
    Dispatched {
        server: ServerName,
        op_id: u64,
        outcome: DispatchOutcome,
    },
    ServerCrashed {
        server: ServerName,
    },
    Abort {
        reason: String,
    },
}

/// In-memory state of one region. Always accessed through its mutex, which
/// doubles as the per-region lock for procedure steps.
#[derive(Debug)]
pub struct RegionStateNode {
    pub region: RegionInfo,
    pub state: RegionState,
    pub location: Option<ServerName>,
    pub last_host: Option<ServerName>,
    pub open_seq_num: u64,
    pub last_update: u64,
    owner: Option<(ProcId, LockKind)>,
    pending_op: Option<u64>,
    pending_server: Option<ServerName>,
    inbox: VecDeque<RegionSignal>,
}

pub type RegionNodeRef = Arc<Mutex<RegionStateNode>>;

impl RegionStateNode {
    pub fn new(region: RegionInfo) -> Self {
        Self {
            region,
            state: RegionState::Offline,
            location: None,
            last_host: None,
            open_seq_num: 0,
            last_update: timestamp_now_millis(),
            owner: None,
            pending_op: None,
            pending_server: None,
            inbox: VecDeque::new(),
        }
    }

    pub fn owner(&self) -> Option<(ProcId, LockKind)> {
        self.owner
    }

    pub fn is_owned_by(&self, proc_id: ProcId) -> bool {
        matches!(self.owner, Some((id, _)) if id == proc_id)
    }

    /// Take the region lock. Fails with the current holder if already taken.
    pub fn try_lock(&mut self, proc_id: ProcId, kind: LockKind) -> Result<(), (ProcId, LockKind)> {
        match self.owner {
            Some((id, _)) if id == proc_id => Ok(()),
            Some(holder) => Err(holder),
            None => {
                self.owner = Some((proc_id, kind));
                Ok(())
            }
        }
    }

    /// Returns false if `proc_id` did not hold the lock
    pub fn unlock(&mut self, proc_id: ProcId) -> bool {
        if !self.is_owned_by(proc_id) {
            return false;
        }
        self.owner = None;
        self.inbox.clear();
        self.clear_pending();
        true
    }

    pub fn set_pending(&mut self, op_id: u64, server: ServerName) {
        self.pending_op = Some(op_id);
        self.pending_server = Some(server);
    }

    pub fn pending_op(&self) -> Option<u64> {
        self.pending_op
    }

    pub fn pending_server(&self) -> Option<&ServerName> {
        self.pending_server.as_ref()
    }

    /// The operation was answered; the server may still report on it
    pub fn ack_pending(&mut self) {
        self.pending_op = None;
    }

    pub fn clear_pending(&mut self) {
        self.pending_op = None;
        self.pending_server = None;
    }

    /// Is `server` hosting or about to host this region?
    pub fn involves(&self, server: &ServerName) -> bool {
        self.location.as_ref() == Some(server) || self.pending_server.as_ref() == Some(server)
    }

    pub fn push_signal(&mut self, signal: RegionSignal) {
        self.inbox.push_back(signal);
    }

    pub fn take_signals(&mut self) -> Vec<RegionSignal> {
        self.inbox.drain(..).collect()
    }

    /// Apply a transition in memory. Persisting it is the caller's job.
    pub fn apply(&mut self, state: RegionState, location: Option<ServerName>) {
        if let Some(current) = self.location.take() {
            if location.as_ref() != Some(&current) {
                self.last_host = Some(current);
            }
        }
        self.state = state;
        self.location = location;
        self.last_update = timestamp_now_millis();
    }
}
