//! Server crashes, server restarts and coordinator restarts

use regionmaster::assignment::{
    AssignmentManager, AssignmentServices, ExecuteResponse, FileRegionStateStore, HrwPlacement,
    InMemoryNodeRegistry, MemoryRegionStateStore, NodeRegistry, OpenResult, RegionInfo,
    RegionRecord, RegionState, RegionStateStore, ServerName, TransitionCode, TransportError,
};
use regionmaster::common::{Config, ProcedureErrorKind, WalSyncPolicy};
use regionmaster::procedure::{MemoryProcedureStore, ProcedureOutcome, WalProcedureStore};
use regionmaster::sim::SimCluster;
use regionmaster::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> Config {
    let mut config = Config::default();
    config.executor.worker_threads = 4;
    config.dispatcher.batch_delay_ms = 1;
    config.dispatcher.rpc_timeout_ms = 1_000;
    config.dispatcher.timeout_retry_delay_ms = 5;
    config.dispatcher.timeout_max_delay_ms = 20;
    config.dispatcher.startup_retry_delay_ms = 5;
    config.dispatcher.queue_full_base_delay_ms = 5;
    config.dispatcher.queue_full_max_delay_ms = 20;
    config.assignment.retry_delay_ms = 5;
    config.assignment.retry_max_delay_ms = 20;
    config
}

fn region(id: u64) -> RegionInfo {
    RegionInfo::new("t1", vec![id as u8], vec![id as u8 + 1], id)
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn in_state(manager: &AssignmentManager, region: &RegionInfo, state: RegionState) -> bool {
    manager
        .region_state(region)
        .map_or(false, |record| record.state == state)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hung_opens_resolved_by_crash() {
    let cluster = SimCluster::new(3);
    let hung = cluster.servers[0].clone();
    let silent = hung.clone();
    // The hung node swallows every request without answering or reporting
    let transport = cluster.transport(move |nodes, server, request, _| {
        if *server == silent {
            return Ok(ExecuteResponse::default());
        }
        Ok(nodes.good_response(server, request))
    });
    let manager = AssignmentManager::start(fast_config(), cluster.memory_services(transport))
        .await
        .unwrap();
    cluster.connect(&manager);

    let regions: Vec<RegionInfo> = (1..=10).map(region).collect();
    let mut ids = Vec::new();
    for r in &regions {
        ids.push(manager.assign_to(r, Some(hung.clone())).unwrap());
    }
    wait_until("all regions OPENING", || {
        regions
            .iter()
            .all(|r| in_state(&manager, r, RegionState::Opening))
    })
    .await;

    // Nothing times out on its own
    tokio::time::sleep(Duration::from_millis(100)).await;
    for r in &regions {
        assert!(in_state(&manager, r, RegionState::Opening));
        assert!(manager.region_owner(r).is_some());
    }

    cluster.nodes.crash(&hung);
    for id in ids {
        manager.wait_for_success(id, WAIT).await.unwrap();
    }

    for r in &regions {
        let record = manager.region_state(r).unwrap();
        assert_eq!(record.state, RegionState::Open);
        assert_ne!(record.location, Some(hung.clone()));
    }
    assert!(cluster.nodes.hosted_on(&hung).is_empty());
    assert_eq!(cluster.nodes.conflicts(), 0);
    assert_eq!(manager.regions_in_transition(), 0);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hung_close_resolved_by_crash() {
    let cluster = SimCluster::new(2);
    let hang = Arc::new(AtomicBool::new(false));
    let hang_in_transport = hang.clone();
    let transport = cluster.transport(move |nodes, server, request, _| {
        if hang_in_transport.load(Ordering::SeqCst) {
            return Ok(ExecuteResponse::default());
        }
        Ok(nodes.good_response(server, request))
    });
    let manager = AssignmentManager::start(fast_config(), cluster.memory_services(transport))
        .await
        .unwrap();
    cluster.connect(&manager);
    let r1 = region(1);
    let host = cluster.servers[0].clone();

    let id = manager.assign_to(&r1, Some(host.clone())).unwrap();
    manager.wait_for_success(id, WAIT).await.unwrap();

    hang.store(true, Ordering::SeqCst);
    let id = manager.unassign(&r1).unwrap();
    wait_until("CLOSING", || in_state(&manager, &r1, RegionState::Closing)).await;

    cluster.nodes.crash(&host);
    manager.wait_for_success(id, WAIT).await.unwrap();

    let record = manager.region_state(&r1).unwrap();
    assert_eq!(record.state, RegionState::Closed);
    assert!(record.location.is_none());
    // The crash procedure left the region to its unassign
    wait_until("crash procedure", || {
        manager.metrics().server_crash.succeeded.get() == 1
    })
    .await;
    assert_eq!(manager.metrics().assign.submitted.get(), 1);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crash_reassigns_open_regions() {
    let cluster = SimCluster::new(3);
    let manager = AssignmentManager::start(
        fast_config(),
        cluster.memory_services(cluster.good_transport()),
    )
    .await
    .unwrap();
    cluster.connect(&manager);
    let victim = cluster.servers[1].clone();

    let regions: Vec<RegionInfo> = (1..=5).map(region).collect();
    for r in &regions {
        let id = manager.assign_to(r, Some(victim.clone())).unwrap();
        manager.wait_for_success(id, WAIT).await.unwrap();
    }
    assert_eq!(manager.regions_on(&victim).len(), 5);

    cluster.nodes.crash(&victim);
    wait_until("regions moved off the dead server", || {
        regions.iter().all(|r| {
            manager.region_state(r).map_or(false, |record| {
                record.state == RegionState::Open && record.location != Some(victim.clone())
            })
        })
    })
    .await;

    assert!(manager.regions_on(&victim).is_empty());
    assert_eq!(manager.metrics().assign.submitted.get(), 10);
    wait_until("crash procedure", || {
        manager.metrics().server_crash.succeeded.get() == 1
    })
    .await;

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_with_new_start_code() {
    let cluster = SimCluster::new(2);
    let manager = AssignmentManager::start(
        fast_config(),
        cluster.memory_services(cluster.good_transport()),
    )
    .await
    .unwrap();
    cluster.connect(&manager);
    let r1 = region(1);
    let old = cluster.servers[0].clone();

    let id = manager.assign_to(&r1, Some(old.clone())).unwrap();
    manager.wait_for_success(id, WAIT).await.unwrap();

    let new = cluster.nodes.restart(&old);
    assert_eq!(new.address(), old.address());
    assert_ne!(new.start_code, old.start_code);
    assert!(cluster.registry().is_live(&new));
    assert!(!cluster.registry().is_live(&old));

    wait_until("region reopened", || {
        manager.region_state(&r1).map_or(false, |record| {
            record.state == RegionState::Open && record.location != Some(old.clone())
        })
    })
    .await;

    // The old incarnation can no longer move the region
    assert!(matches!(
        manager.report_transition(&old, &r1, TransitionCode::Closed, 0),
        Err(Error::ServerNotLive(_))
    ));
    assert_eq!(
        manager.region_state(&r1).unwrap().state,
        RegionState::Open
    );

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coordinator_restart_resumes_procedures() {
    let dir = TempDir::new().unwrap();
    let procedures = dir.path().join("procedures.wal");
    let regions = dir.path().join("regions.wal");

    let cluster = SimCluster::new(2);
    let hang = Arc::new(AtomicBool::new(false));
    let hang_in_transport = hang.clone();
    let transport = cluster.transport(move |nodes, server, request, _| {
        if hang_in_transport.load(Ordering::SeqCst) {
            return Ok(ExecuteResponse::default());
        }
        Ok(nodes.good_response(server, request))
    });

    let settled = region(1);
    let in_flight = region(2);
    let pending_id = {
        let services = cluster.services(
            transport.clone(),
            Arc::new(WalProcedureStore::open(&procedures, WalSyncPolicy::Always).unwrap()),
            Arc::new(FileRegionStateStore::open(&regions, WalSyncPolicy::Always).unwrap()),
        );
        let manager = AssignmentManager::start(fast_config(), services)
            .await
            .unwrap();
        cluster.connect(&manager);

        let id = manager.assign(&settled).unwrap();
        manager.wait_for_success(id, WAIT).await.unwrap();

        hang.store(true, Ordering::SeqCst);
        let id = manager.assign(&in_flight).unwrap();
        wait_until("OPENING", || {
            in_state(&manager, &in_flight, RegionState::Opening)
        })
        .await;

        manager.shutdown().await;
        id
    };

    hang.store(false, Ordering::SeqCst);
    let services = cluster.services(
        transport,
        Arc::new(WalProcedureStore::open(&procedures, WalSyncPolicy::Always).unwrap()),
        Arc::new(FileRegionStateStore::open(&regions, WalSyncPolicy::Always).unwrap()),
    );
    let manager = AssignmentManager::start(fast_config(), services)
        .await
        .unwrap();
    cluster.connect(&manager);

    assert_eq!(
        manager.region_state(&settled).unwrap().state,
        RegionState::Open
    );
    manager.wait_for_success(pending_id, WAIT).await.unwrap();
    assert_eq!(
        manager.region_state(&in_flight).unwrap().state,
        RegionState::Open
    );
    assert_eq!(cluster.nodes.conflicts(), 0);

    // New procedures never reuse a persisted id
    let id = manager.unassign(&settled).unwrap();
    assert!(id > pending_id);
    manager.wait_for_success(id, WAIT).await.unwrap();

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_failure_stops_coordinator() {
    let cluster = SimCluster::new(2);
    let store = Arc::new(MemoryProcedureStore::new());
    let services = cluster.services(
        cluster.good_transport(),
        store.clone(),
        Arc::new(MemoryRegionStateStore::new()),
    );
    let manager = AssignmentManager::start(fast_config(), services)
        .await
        .unwrap();
    cluster.connect(&manager);

    let id = manager.assign(&region(1)).unwrap();
    manager.wait_for_success(id, WAIT).await.unwrap();
    assert!(!manager.is_stopped());

    store.set_fail_appends(true);
    let r2 = region(2);
    assert!(matches!(
        manager.assign(&r2),
        Err(Error::StoreUnavailable(_))
    ));
    assert!(manager.is_stopped());
    assert!(manager.region_owner(&r2).is_none());

    // Stays stopped even once the store recovers
    store.set_fail_appends(false);
    assert!(matches!(
        manager.assign(&region(3)),
        Err(Error::StoreUnavailable(_))
    ));

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_while_opens_hang_on_old_start_code() {
    let cluster = SimCluster::new(2);
    let old = cluster.servers[0].clone();
    let released = Arc::new(AtomicBool::new(false));
    let stale = old.clone();
    let release = released.clone();
    // The old incarnation sits on the call and answers only once it is gone
    let transport = cluster.transport(move |nodes, server, request, _| {
        if *server != stale {
            return Ok(nodes.good_response(server, request));
        }
        let deadline = Instant::now() + WAIT;
        while !release.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(ExecuteResponse {
            opens: request
                .opens
                .iter()
                .map(|op| (op.op_id, OpenResult::Opened))
                .collect(),
            closes: Vec::new(),
        })
    });
    let manager = AssignmentManager::start(fast_config(), cluster.memory_services(transport.clone()))
        .await
        .unwrap();
    cluster.connect(&manager);

    let regions: Vec<RegionInfo> = (1..=3).map(region).collect();
    let mut ids = Vec::new();
    for r in &regions {
        ids.push(manager.assign_to(r, Some(old.clone())).unwrap());
    }
    wait_until("open call in flight", || transport.calls_to(&old) >= 1).await;
    wait_until("all regions OPENING", || {
        regions
            .iter()
            .all(|r| in_state(&manager, r, RegionState::Opening))
    })
    .await;

    let new = cluster.nodes.restart(&old);
    assert_ne!(new, old);
    wait_until("crash procedure", || {
        manager.metrics().server_crash.succeeded.get() == 1
    })
    .await;
    // The late answer from the old start code finds nothing left to complete
    released.store(true, Ordering::SeqCst);

    for id in ids {
        manager.wait_for_success(id, WAIT).await.unwrap();
    }
    for r in &regions {
        let record = manager.region_state(r).unwrap();
        assert_eq!(record.state, RegionState::Open);
        let location = record.location.unwrap();
        assert_ne!(location, old);
        assert!(cluster.registry().is_live(&location));
        assert_eq!(cluster.nodes.host_of(r), Some(location));

        for code in [TransitionCode::Opened, TransitionCode::Closed] {
            assert!(matches!(
                manager.report_transition(&old, r, code, 1),
                Err(Error::ServerNotLive(_))
            ));
        }
        assert!(in_state(&manager, r, RegionState::Open));
    }
    assert!(cluster.nodes.hosted_on(&old).is_empty());
    assert_eq!(cluster.nodes.conflicts(), 0);
    assert_eq!(manager.regions_in_transition(), 0);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crash_aborts_split_parent() {
    let cluster = SimCluster::new(2);
    let host = cluster.servers[0].clone();
    let closing = region(1).as_split_parent();
    let idle = region(2).as_split_parent();
    let region_store = Arc::new(MemoryRegionStateStore::new());
    for r in [&closing, &idle] {
        region_store
            .update(&RegionRecord {
                region: r.clone(),
                state: RegionState::Open,
                location: Some(host.clone()),
                last_host: None,
                open_seq_num: 1,
                last_update: 0,
            })
            .unwrap();
    }
    // Closes are accepted and never answered
    let transport = cluster.transport(|_, _, _, _| Ok(ExecuteResponse::default()));
    let services = cluster.services(
        transport,
        Arc::new(MemoryProcedureStore::new()),
        region_store.clone(),
    );
    let manager = AssignmentManager::start(fast_config(), services)
        .await
        .unwrap();
    cluster.connect(&manager);

    let id = manager.unassign(&closing).unwrap();
    wait_until("CLOSING", || in_state(&manager, &closing, RegionState::Closing)).await;

    cluster.nodes.crash(&host);
    match manager.wait_for(id, WAIT).await.unwrap() {
        ProcedureOutcome::Failed(err) => assert_eq!(err.kind, ProcedureErrorKind::Aborted),
        other => panic!("expected abort, got {:?}", other),
    }
    assert!(in_state(&manager, &closing, RegionState::Aborted));
    assert!(manager.region_owner(&closing).is_none());

    wait_until("crash procedure", || {
        manager.metrics().server_crash.succeeded.get() == 1
    })
    .await;
    // An unowned split parent is closed, never reopened
    let record = region_store.get(&idle).unwrap();
    assert_eq!(record.state, RegionState::Closed);
    assert!(record.location.is_none());
    assert_eq!(manager.metrics().assign.submitted.get(), 0);

    manager.shutdown().await;
}

/// Registry whose death events never reach subscribers
struct DeafRegistry {
    inner: Arc<InMemoryNodeRegistry>,
    silent: broadcast::Sender<ServerName>,
}

impl NodeRegistry for DeafRegistry {
    fn is_live(&self, server: &ServerName) -> bool {
        self.inner.is_live(server)
    }

    fn mark_dead(&self, server: &ServerName) -> bool {
        self.inner.mark_dead(server)
    }

    fn live_servers(&self) -> Vec<ServerName> {
        self.inner.live_servers()
    }

    fn subscribe_deaths(&self) -> broadcast::Receiver<ServerName> {
        self.silent.subscribe()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rescan_recovers_missed_death() {
    let cluster = SimCluster::new(3);
    let broken = cluster.servers[2].clone();
    let failing = broken.clone();
    let transport = cluster.transport(move |nodes, server, request, _| {
        if *server == failing {
            return Err(TransportError::Remote("region server aborted".into()));
        }
        Ok(nodes.good_response(server, request))
    });
    let (silent, _) = broadcast::channel(1);
    let services = AssignmentServices {
        registry: Arc::new(DeafRegistry {
            inner: cluster.registry(),
            silent,
        }),
        transport,
        placement: Arc::new(HrwPlacement),
        procedure_store: Arc::new(MemoryProcedureStore::new()),
        region_store: Arc::new(MemoryRegionStateStore::new()),
    };
    let manager = AssignmentManager::start(fast_config(), services)
        .await
        .unwrap();
    cluster.connect(&manager);
    let r1 = region(1);

    let id = manager.assign_to(&r1, Some(broken.clone())).unwrap();
    wait_until("server expired", || !cluster.registry().is_live(&broken)).await;

    // Only the pending open still points at the dead server
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(in_state(&manager, &r1, RegionState::Opening));
    assert!(manager.region_state(&r1).unwrap().location.is_none());
    assert!(manager.region_owner(&r1).is_some());
    assert_eq!(manager.metrics().server_crash.submitted.get(), 0);

    manager.recover_dead_servers().unwrap();
    manager.wait_for_success(id, WAIT).await.unwrap();

    let record = manager.region_state(&r1).unwrap();
    assert_eq!(record.state, RegionState::Open);
    assert_ne!(record.location, Some(broken));
    assert_eq!(manager.metrics().server_crash.submitted.get(), 1);

    manager.shutdown().await;
}
