//! Run queue and event table shared by the executor and the code that wakes
//! suspended procedures.
//!
//! Every wakeup carries the procedure's scheduling token; the executor drops
//! wakeups whose token no longer matches, so duplicate or late wakeups are
//! harmless. A wake on a key nobody waits on is remembered, and the next
//! suspension on that key is rescheduled immediately instead of being lost.
//!
//! An id handed out before its procedure reaches the executor (a region lock
//! taken for a procedure about to be submitted) is claimed here, so anyone
//! who sees the id can wait on it. The scheduler also carries the halt
//! flag: the first durable-store failure anywhere stops the executor.

use crate::procedure::{EventKey, ProcId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Scheduled,
    Event,
    Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wakeup {
    pub proc_id: ProcId,
    pub token: u64,
    pub reason: WakeReason,
}

#[derive(Default)]
struct EventTable {
    waiters: HashMap<EventKey, Vec<Wakeup>>,
    signaled: HashSet<EventKey>,
}

pub struct ProcedureScheduler {
    next_id: AtomicU64,
    queue_tx: mpsc::UnboundedSender<Wakeup>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Wakeup>>,
    events: Mutex<EventTable>,
    claimed: Mutex<HashSet<ProcId>>,
    halted: Mutex<Option<String>>,
}

impl ProcedureScheduler {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            next_id: AtomicU64::new(1),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            events: Mutex::new(EventTable::default()),
            claimed: Mutex::new(HashSet::new()),
            halted: Mutex::new(None),
        }
    }

    pub fn reserve_id(&self) -> ProcId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure ids handed out later never collide with a replayed one
    pub fn observe_id(&self, id: ProcId) {
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Mark `id` as published but not yet known to the executor
    pub fn claim(&self, id: ProcId) {
        self.claimed.lock().insert(id);
    }

    /// The executor took over `id`, or the claim was abandoned
    pub fn settle(&self, id: ProcId) {
        self.claimed.lock().remove(&id);
    }

    pub fn is_claimed(&self, id: ProcId) -> bool {
        self.claimed.lock().contains(&id)
    }

    /// Record a fatal store failure. Returns false if already halted.
    pub fn halt(&self, reason: impl Into<String>) -> bool {
        let mut halted = self.halted.lock();
        if halted.is_some() {
            return false;
        }
        *halted = Some(reason.into());
        true
    }

    pub fn halted(&self) -> Option<String> {
        self.halted.lock().clone()
    }

    pub fn schedule(&self, wakeup: Wakeup) {
        // Receiver lives as long as self
        let _ = self.queue_tx.send(wakeup);
    }

    pub fn schedule_after(&self, wakeup: Wakeup, delay: Duration) {
        let tx = self.queue_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(wakeup);
        });
    }

    /// Wake every procedure suspended on `key`. Returns how many were woken.
    pub fn wake(&self, key: &EventKey) -> usize {
        let waiters = {
            let mut events = self.events.lock();
            match events.waiters.remove(key) {
                Some(waiters) if !waiters.is_empty() => waiters,
                _ => {
                    events.signaled.insert(key.clone());
                    return 0;
                }
            }
        };

        let woken = waiters.len();
        for waiter in waiters {
            self.schedule(Wakeup {
                reason: WakeReason::Event,
                ..waiter
            });
        }
        woken
    }

    /// Park `wakeup` on `key`, or reschedule at once if `key` was already woken
    pub fn suspend(&self, key: &EventKey, wakeup: Wakeup) {
        let fire_now = {
            let mut events = self.events.lock();
            if events.signaled.remove(key) {
                true
            } else {
                events.waiters.entry(key.clone()).or_default().push(wakeup);
                false
            }
        };

        if fire_now {
            self.schedule(Wakeup {
                reason: WakeReason::Event,
                ..wakeup
            });
        }
    }

    /// Drop a procedure's parked wakeup after it resumed some other way
    pub fn unregister(&self, key: &EventKey, proc_id: ProcId) {
        let mut events = self.events.lock();
        if let Some(waiters) = events.waiters.get_mut(key) {
            waiters.retain(|w| w.proc_id != proc_id);
            if waiters.is_empty() {
                events.waiters.remove(key);
            }
        }
    }

    /// Clear any remembered signal for `key`
    pub fn forget(&self, key: &EventKey) {
        self.events.lock().signaled.remove(key);
    }

    pub fn waiting_on(&self, key: &EventKey) -> usize {
        self.events.lock().waiters.get(key).map_or(0, Vec::len)
    }

    pub(crate) async fn next(&self) -> Option<Wakeup> {
        self.queue_rx.lock().await.recv().await
    }
}

impl Default for ProcedureScheduler {
    fn default() -> Self {
        Self::new()
    }
}
