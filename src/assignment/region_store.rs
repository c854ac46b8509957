//! Durable region-state table
//!
//! One record per region, last write wins. The file implementation appends to
//! a [`RecordLog`] and rewrites it down to one frame per region when opened.

use crate::assignment::{RegionInfo, RegionState, RegionStateNode, ServerName};
use crate::common::{Error, RecordLog, Result, WalSyncPolicy};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

const KIND_REGION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub region: RegionInfo,
    pub state: RegionState,
    pub location: Option<ServerName>,
    pub last_host: Option<ServerName>,
    pub open_seq_num: u64,
    pub last_update: u64,
}

impl RegionRecord {
    pub fn from_node(node: &RegionStateNode) -> Self {
        Self {
            region: node.region.clone(),
            state: node.state,
            location: node.location.clone(),
            last_host: node.last_host.clone(),
            open_seq_num: node.open_seq_num,
            last_update: node.last_update,
        }
    }

    pub fn into_node(self) -> RegionStateNode {
        let mut node = RegionStateNode::new(self.region);
        node.state = self.state;
        node.location = self.location;
        node.last_host = self.last_host;
        node.open_seq_num = self.open_seq_num;
        node.last_update = self.last_update;
        node
    }
}

pub trait RegionStateStore: Send + Sync {
    fn update(&self, record: &RegionRecord) -> Result<()>;

    /// Latest record of every region
    fn load(&self) -> Result<Vec<RegionRecord>>;
}

pub struct FileRegionStateStore {
    path: PathBuf,
    log: Mutex<RecordLog>,
}

impl FileRegionStateStore {
    pub fn open(path: impl AsRef<Path>, sync_policy: WalSyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut log = RecordLog::open(&path, sync_policy)?;

        let records = Self::read_latest(&path)?;
        let payloads = records
            .iter()
            .map(|r| Ok((r.region.region_id, bincode::serialize(r)?)))
            .collect::<Result<Vec<(u64, Vec<u8>)>>>()?;
        log.rewrite(
            payloads
                .iter()
                .map(|(key, payload)| (KIND_REGION, *key, payload.as_slice())),
        )?;
        tracing::info!(
            "Opened region state table at {} ({} regions)",
            path.display(),
            records.len()
        );

        Ok(Self {
            path,
            log: Mutex::new(log),
        })
    }

    fn read_latest(path: &Path) -> Result<Vec<RegionRecord>> {
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, RegionRecord> = HashMap::new();
        RecordLog::replay(path, |frame| {
            let record: RegionRecord = bincode::deserialize(&frame.payload)?;
            let name = record.region.name();
            if !latest.contains_key(&name) {
                order.push(name.clone());
            }
            latest.insert(name, record);
            Ok(())
        })?;
        Ok(order
            .into_iter()
            .filter_map(|name| latest.remove(&name))
            .collect())
    }
}

impl RegionStateStore for FileRegionStateStore {
    fn update(&self, record: &RegionRecord) -> Result<()> {
        let payload = bincode::serialize(record)?;
        self.log
            .lock()
            .append(KIND_REGION, record.region.region_id, &payload)?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<RegionRecord>> {
        let _log = self.log.lock();
        Self::read_latest(&self.path)
    }
}

#[derive(Default)]
pub struct MemoryRegionStateStore {
    records: Mutex<HashMap<String, RegionRecord>>,
    fail_updates: AtomicBool,
}

impl MemoryRegionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following update fail until reset
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, region: &RegionInfo) -> Option<RegionRecord> {
        self.records.lock().get(&region.name()).cloned()
    }
}

impl RegionStateStore for MemoryRegionStateStore {
    fn update(&self, record: &RegionRecord) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected update failure",
            )));
        }
        self.records
            .lock()
            .insert(record.region.name(), record.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<RegionRecord>> {
        let mut records: Vec<RegionRecord> = self.records.lock().values().cloned().collect();
        records.sort_by_key(|r| r.region.region_id);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(region_id: u64, state: RegionState, location: Option<ServerName>) -> RegionRecord {
        RegionRecord {
            region: RegionInfo::new("t1", vec![region_id as u8], Vec::new(), region_id),
            state,
            location,
            last_host: None,
            open_seq_num: 0,
            last_update: 0,
        }
    }

    #[test]
    fn test_file_store_last_write_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("regions.wal");
        let rs1 = ServerName::new("rs1", 16020, 1);

        {
            let store = FileRegionStateStore::open(&path, WalSyncPolicy::Always).unwrap();
            store.update(&record(1, RegionState::Opening, None)).unwrap();
            store.update(&record(2, RegionState::Offline, None)).unwrap();
            store
                .update(&record(1, RegionState::Open, Some(rs1.clone())))
                .unwrap();
        }

        let store = FileRegionStateStore::open(&path, WalSyncPolicy::Always).unwrap();
        let records = store.load().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].state, RegionState::Open);
        assert_eq!(records[0].location, Some(rs1));
        assert_eq!(records[1].state, RegionState::Offline);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryRegionStateStore::new();
        store.update(&record(7, RegionState::Closed, None)).unwrap();
        store.update(&record(3, RegionState::Open, None)).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].region.region_id, 3);
        assert_eq!(
            store.get(&loaded[1].region).unwrap().state,
            RegionState::Closed
        );

        store.set_fail_updates(true);
        assert!(store.update(&record(7, RegionState::Open, None)).is_err());
        assert_eq!(
            store.get(&loaded[1].region).unwrap().state,
            RegionState::Closed
        );
    }

    #[test]
    fn test_node_round_trip() {
        let rs1 = ServerName::new("rs1", 16020, 1);
        let node = record(4, RegionState::Open, Some(rs1)).into_node();
        assert!(node.owner().is_none());
        assert_eq!(RegionRecord::from_node(&node).state, RegionState::Open);
    }
}
