//! Transport failures seen by the dispatcher and how assignment rides them out

use regionmaster::assignment::{
    AssignmentManager, NodeRegistry, RegionInfo, RegionState, TransportError,
};
use regionmaster::common::Config;
use regionmaster::sim::SimCluster;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> Config {
    let mut config = Config::default();
    config.executor.worker_threads = 4;
    config.dispatcher.batch_delay_ms = 1;
    config.dispatcher.rpc_timeout_ms = 1_000;
    config.dispatcher.max_timeout_retries = 3;
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

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_too_big_retries_same_server() {
    let cluster = SimCluster::new(3);
    let transport = cluster.transport(|nodes, server, request, call| {
        if call == 1 {
            return Err(TransportError::QueueTooBig);
        }
        Ok(nodes.good_response(server, request))
    });
    let manager = AssignmentManager::start(
        fast_config(),
        cluster.memory_services(transport.clone()),
    )
    .await
    .unwrap();
    cluster.connect(&manager);
    let r1 = region(1);
    let target = cluster.servers[1].clone();

    let id = manager.assign_to(&r1, Some(target.clone())).unwrap();
    manager.wait_for_success(id, WAIT).await.unwrap();

    let record = manager.region_state(&r1).unwrap();
    assert_eq!(record.state, RegionState::Open);
    assert_eq!(record.location, Some(target.clone()));
    assert_eq!(transport.calls_to(&target), 2);
    assert_eq!(transport.calls_to(&cluster.servers[0]), 0);
    assert_eq!(transport.calls_to(&cluster.servers[2]), 0);
    assert!(manager.metrics().dispatch.rpc_retries.get() >= 1);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeouts_within_bound_are_retried() {
    let cluster = SimCluster::new(2);
    let transport = cluster.transport(|nodes, server, request, call| {
        if call <= 2 {
            return Err(TransportError::Timeout);
        }
        Ok(nodes.good_response(server, request))
    });
    let manager = AssignmentManager::start(
        fast_config(),
        cluster.memory_services(transport.clone()),
    )
    .await
    .unwrap();
    cluster.connect(&manager);
    let r1 = region(1);
    let target = cluster.servers[0].clone();

    let id = manager.assign_to(&r1, Some(target.clone())).unwrap();
    manager.wait_for_success(id, WAIT).await.unwrap();

    assert_eq!(
        manager.region_state(&r1).unwrap().location,
        Some(target.clone())
    );
    assert_eq!(transport.calls_to(&target), 3);
    assert!(cluster.registry().is_live(&target));
    assert_eq!(manager.metrics().server_crash.submitted.get(), 0);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeouts_past_bound_expire_server_and_reassign() {
    let cluster = SimCluster::new(3);
    let unresponsive = cluster.servers[0].clone();
    let stuck = unresponsive.clone();
    let transport = cluster.transport(move |nodes, server, request, _| {
        if *server == stuck {
            return Err(TransportError::Timeout);
        }
        Ok(nodes.good_response(server, request))
    });
    let manager = AssignmentManager::start(fast_config(), cluster.memory_services(transport))
        .await
        .unwrap();
    cluster.connect(&manager);
    let r1 = region(1);

    let id = manager.assign_to(&r1, Some(unresponsive.clone())).unwrap();
    manager.wait_for_success(id, WAIT).await.unwrap();

    let record = manager.region_state(&r1).unwrap();
    assert_eq!(record.state, RegionState::Open);
    assert!(record.location.is_some());
    assert_ne!(record.location, Some(unresponsive.clone()));
    assert!(!cluster.registry().is_live(&unresponsive));

    wait_until("crash procedure", || {
        manager.metrics().server_crash.succeeded.get() == 1
    })
    .await;
    assert_eq!(manager.metrics().server_crash.submitted.get(), 1);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_not_yet_running_waits_for_startup() {
    let cluster = SimCluster::new(2);
    let transport = cluster.transport(|nodes, server, request, call| {
        if call <= 3 {
            return Err(TransportError::NotYetRunning);
        }
        Ok(nodes.good_response(server, request))
    });
    let manager = AssignmentManager::start(
        fast_config(),
        cluster.memory_services(transport.clone()),
    )
    .await
    .unwrap();
    cluster.connect(&manager);
    let r1 = region(1);
    let target = cluster.servers[1].clone();

    let id = manager.assign_to(&r1, Some(target.clone())).unwrap();
    manager.wait_for_success(id, WAIT).await.unwrap();

    assert_eq!(manager.region_state(&r1).unwrap().location, Some(target.clone()));
    assert_eq!(transport.calls_to(&target), 4);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remote_error_is_outcome_unknown() {
    let cluster = SimCluster::new(3);
    let broken = cluster.servers[2].clone();
    let failing = broken.clone();
    let transport = cluster.transport(move |nodes, server, request, _| {
        if *server == failing {
            return Err(TransportError::Remote("region server aborted".into()));
        }
        Ok(nodes.good_response(server, request))
    });
    let manager = AssignmentManager::start(fast_config(), cluster.memory_services(transport))
        .await
        .unwrap();
    cluster.connect(&manager);
    let r1 = region(1);

    let id = manager.assign_to(&r1, Some(broken.clone())).unwrap();
    manager.wait_for_success(id, WAIT).await.unwrap();

    // Unknown outcome: the node is expired and crash recovery moves the region
    let record = manager.region_state(&r1).unwrap();
    assert_eq!(record.state, RegionState::Open);
    assert_ne!(record.location, Some(broken.clone()));
    assert!(!cluster.registry().is_live(&broken));
    assert!(manager.metrics().dispatch.operations_failed.get() >= 1);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batches_many_regions_per_call() {
    let cluster = SimCluster::new(1);
    let mut config = fast_config();
    config.dispatcher.batch_delay_ms = 50;
    let transport = cluster.good_transport();
    let manager = AssignmentManager::start(config, cluster.memory_services(transport.clone()))
        .await
        .unwrap();
    cluster.connect(&manager);

    let regions = SimCluster::table_regions("batched", 40);
    let ids = manager.assign_many(&regions).unwrap();
    for id in ids {
        manager.wait_for_success(id, WAIT).await.unwrap();
    }

    assert_eq!(cluster.nodes.hosted_on(&cluster.servers[0]).len(), 40);
    assert!(transport.calls_to(&cluster.servers[0]) < 40);

    manager.shutdown().await;
}
