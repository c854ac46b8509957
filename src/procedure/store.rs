//! Procedure persistence
//!
//! Each executed step appends a [`StoreEntry`] for its procedure. On replay the
//! last entry per procedure wins; a `Delete` means the procedure tree finished
//! and nothing needs to be resumed.

use crate::common::{Error, RecordLog, Result, WalSyncPolicy};
use crate::procedure::{ProcId, ProcedureOutcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

const KIND_UPDATE: u8 = 1;
const KIND_DELETE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Runnable,
    WaitingChildren,
    Finished(ProcedureOutcome),
}

/// Persisted snapshot of one procedure after a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureRecord {
    pub proc_id: ProcId,
    pub parent_id: Option<ProcId>,
    pub kind: String,
    pub state_tag: String,
    pub status: RecordStatus,
    pub steps: u64,
    /// Serialized procedure; empty once finished
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreEntry {
    Update(ProcedureRecord),
    Delete(ProcId),
}

impl StoreEntry {
    pub fn proc_id(&self) -> ProcId {
        match self {
            StoreEntry::Update(record) => record.proc_id,
            StoreEntry::Delete(id) => *id,
        }
    }
}

pub trait ProcedureStore: Send + Sync {
    fn append(&self, entry: &StoreEntry) -> Result<()> {
        self.append_batch(std::slice::from_ref(entry))
    }

    /// Append entries durably, in order, as one unit
    fn append_batch(&self, entries: &[StoreEntry]) -> Result<()>;

    /// Every procedure's history in order of first appearance
    fn replay_all(&self) -> Result<Vec<(ProcId, Vec<StoreEntry>)>>;

    /// Replace the store contents with just `live`
    fn compact(&self, live: &[ProcedureRecord]) -> Result<()>;
}

fn group_by_proc(entries: impl IntoIterator<Item = StoreEntry>) -> Vec<(ProcId, Vec<StoreEntry>)> {
    let mut order: Vec<(ProcId, Vec<StoreEntry>)> = Vec::new();
    let mut index: HashMap<ProcId, usize> = HashMap::new();
    for entry in entries {
        let id = entry.proc_id();
        match index.get(&id) {
            Some(&i) => order[i].1.push(entry),
            None => {
                index.insert(id, order.len());
                order.push((id, vec![entry]));
            }
        }
    }
    order
}

/// File-backed store on top of the framed record log
pub struct WalProcedureStore {
    path: PathBuf,
    log: Mutex<RecordLog>,
}

impl WalProcedureStore {
    pub fn open(path: impl AsRef<Path>, sync_policy: WalSyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let log = RecordLog::open(&path, sync_policy)?;
        tracing::info!("Opened procedure store at {}", path.display());
        Ok(Self {
            path,
            log: Mutex::new(log),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProcedureStore for WalProcedureStore {
    fn append_batch(&self, entries: &[StoreEntry]) -> Result<()> {
        let mut frames = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                StoreEntry::Update(record) => {
                    frames.push((KIND_UPDATE, record.proc_id, bincode::serialize(record)?))
                }
                StoreEntry::Delete(id) => frames.push((KIND_DELETE, *id, Vec::new())),
            }
        }

        let mut log = self.log.lock();
        log.append_all(
            frames
                .iter()
                .map(|(kind, key, payload)| (*kind, *key, payload.as_slice())),
        )?;
        Ok(())
    }

    fn replay_all(&self) -> Result<Vec<(ProcId, Vec<StoreEntry>)>> {
        // Hold the writer lock so replay never sees a half-flushed batch
        let _log = self.log.lock();
        let mut entries = Vec::new();
        RecordLog::replay(&self.path, |record| {
            let entry = match record.kind {
                KIND_UPDATE => StoreEntry::Update(bincode::deserialize(&record.payload)?),
                KIND_DELETE => StoreEntry::Delete(record.key),
                other => {
                    return Err(Error::Wal(format!(
                        "unknown procedure record kind {} at sequence {}",
                        other, record.sequence
                    )))
                }
            };
            entries.push(entry);
            Ok(())
        })?;
        Ok(group_by_proc(entries))
    }

    fn compact(&self, live: &[ProcedureRecord]) -> Result<()> {
        let mut frames = Vec::with_capacity(live.len());
        for record in live {
            frames.push((record.proc_id, bincode::serialize(record)?));
        }

        let mut log = self.log.lock();
        log.rewrite(
            frames
                .iter()
                .map(|(key, payload)| (KIND_UPDATE, *key, payload.as_slice())),
        )?;
        tracing::debug!("Compacted procedure store to {} records", live.len());
        Ok(())
    }
}

/// In-memory store with injectable append failures
#[derive(Default)]
pub struct MemoryProcedureStore {
    entries: Mutex<Vec<StoreEntry>>,
    fail_appends: AtomicBool,
}

impl MemoryProcedureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following append fail until reset
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl ProcedureStore for MemoryProcedureStore {
    fn append_batch(&self, entries: &[StoreEntry]) -> Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected append failure",
            )));
        }
        self.entries.lock().extend_from_slice(entries);
        Ok(())
    }

    fn replay_all(&self) -> Result<Vec<(ProcId, Vec<StoreEntry>)>> {
        Ok(group_by_proc(self.entries.lock().clone()))
    }

    fn compact(&self, live: &[ProcedureRecord]) -> Result<()> {
        let mut entries = self.entries.lock();
        *entries = live.iter().cloned().map(StoreEntry::Update).collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(proc_id: ProcId, parent_id: Option<ProcId>, status: RecordStatus) -> ProcedureRecord {
        ProcedureRecord {
            proc_id,
            parent_id,
            kind: "test".into(),
            state_tag: "Start".into(),
            status,
            steps: 1,
            payload: vec![proc_id as u8; 4],
        }
    }

    #[test]
    fn test_wal_store_groups_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("procedures.wal");

        {
            let store = WalProcedureStore::open(&path, WalSyncPolicy::Always).unwrap();
            store
                .append(&StoreEntry::Update(record(1, None, RecordStatus::Runnable)))
                .unwrap();
            store
                .append_batch(&[
                    StoreEntry::Update(record(2, Some(1), RecordStatus::Runnable)),
                    StoreEntry::Update(record(1, None, RecordStatus::WaitingChildren)),
                ])
                .unwrap();
            store.append(&StoreEntry::Delete(2)).unwrap();
        }

        let store = WalProcedureStore::open(&path, WalSyncPolicy::Always).unwrap();
        let history = store.replay_all().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].0, 1);
        assert_eq!(history[0].1.len(), 2);
        match history[0].1.last().unwrap() {
            StoreEntry::Update(r) => assert_eq!(r.status, RecordStatus::WaitingChildren),
            other => panic!("unexpected entry {:?}", other),
        }
        assert_eq!(history[1].1.last().unwrap(), &StoreEntry::Delete(2));
    }

    #[test]
    fn test_wal_store_compact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("procedures.wal");
        let store = WalProcedureStore::open(&path, WalSyncPolicy::Always).unwrap();

        for id in 1..=5 {
            store
                .append(&StoreEntry::Update(record(id, None, RecordStatus::Runnable)))
                .unwrap();
        }
        store.compact(&[record(4, None, RecordStatus::Runnable)]).unwrap();
        store
            .append(&StoreEntry::Update(record(6, None, RecordStatus::Runnable)))
            .unwrap();

        let ids: Vec<ProcId> = store.replay_all().unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![4, 6]);
    }

    #[test]
    fn test_finished_record_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("procedures.wal");
        let store = WalProcedureStore::open(&path, WalSyncPolicy::Always).unwrap();

        let failed = RecordStatus::Finished(ProcedureOutcome::Failed(
            crate::common::ProcedureError::aborted("server crashed"),
        ));
        store
            .append(&StoreEntry::Update(record(3, Some(1), failed.clone())))
            .unwrap();

        let history = store.replay_all().unwrap();
        match &history[0].1[0] {
            StoreEntry::Update(r) => assert_eq!(r.status, failed),
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn test_memory_store_fault_injection() {
        let store = MemoryProcedureStore::new();
        store
            .append(&StoreEntry::Update(record(1, None, RecordStatus::Runnable)))
            .unwrap();

        store.set_fail_appends(true);
        assert!(store.append(&StoreEntry::Delete(1)).is_err());
        assert_eq!(store.len(), 1);

        store.set_fail_appends(false);
        store.append(&StoreEntry::Delete(1)).unwrap();
        assert_eq!(store.replay_all().unwrap()[0].1.len(), 2);
    }
}
