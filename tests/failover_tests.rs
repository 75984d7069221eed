mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cubeforge::cube::{parse_timestamp, EngineType, SegmentStatus};
use cubeforge::execution::{ExecutableState, StepKind};
use cubeforge::harness::SUBMITTER;
use cubeforge::lease::{Lease, StoreLease};
use cubeforge::node::SCHEDULER_LEASE;
use cubeforge::scheduler::SchedulerState;
use cubeforge::store::MetadataStore;
use test_harness::{
    assert_eventually, counting_steps, seed_cube, steps_with, CountingStep, GateStep, TestCluster,
};

const ACTIVE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_exactly_one_active_scheduler() {
    let mut cluster = TestCluster::new(3);
    cluster
        .wait_for_active(ACTIVE_TIMEOUT)
        .await
        .expect("no scheduler became active");

    // Sample across several renewal periods.
    for _ in 0..50 {
        assert!(cluster.count_active() <= 1, "more than one active scheduler");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cluster.count_active(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_graceful_stop_hands_over_immediately() {
    let mut cluster = TestCluster::new(2);
    let first = cluster
        .wait_for_active(ACTIVE_TIMEOUT)
        .await
        .expect("no scheduler became active");

    assert!(cluster.stop_node(&first).await);

    // The lease was released, so the survivor does not wait for the TTL.
    let second = cluster
        .wait_for_new_active(&first, Duration::from_millis(250))
        .await
        .expect("standby did not take over a released lease");
    assert_ne!(first, second);

    let node = cluster.get_node(&second).unwrap();
    assert_eq!(node.active_scheduler().await.unwrap().holder, second);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_crashed_holder_is_replaced_after_expiry() {
    let mut cluster = TestCluster::new(2);
    let first = cluster
        .wait_for_active(ACTIVE_TIMEOUT)
        .await
        .expect("no scheduler became active");

    assert!(cluster.crash_node(&first));

    let second = cluster
        .wait_for_new_active(&first, ACTIVE_TIMEOUT)
        .await
        .expect("no takeover after the crashed holder's lease expired");
    assert_ne!(first, second);
    assert_eq!(cluster.count_active(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_job_left_running_by_crash_is_resumed() {
    let mut cluster = TestCluster::empty();
    let first_counter = Arc::new(CountingStep::default());
    let gate = Arc::new(GateStep::default());
    let first = cluster.start_node_with(
        "node-1",
        steps_with(first_counter.clone(), StepKind::BuildDictionary, gate.clone()),
    );
    cluster.wait_for_active(ACTIVE_TIMEOUT).await.expect("no active scheduler");
    seed_cube(&first, "sales", EngineType::Layered).await;

    let handle = first
        .build_segment("sales", parse_timestamp("2013-01-01").unwrap(), SUBMITTER)
        .await
        .unwrap();
    let job_id = handle.job_id;

    assert_eventually(
        || async { gate.entered() == 1 },
        ACTIVE_TIMEOUT,
        "dictionary step never started",
    )
    .await;
    assert!(cluster.crash_node("node-1"));

    let client = cluster.client("client");
    let job = client.registry().get(&job_id).await.unwrap();
    assert_eq!(job.status, ExecutableState::Running);
    assert_eq!(job.steps[1].status, ExecutableState::Succeed);
    assert_eq!(job.steps[2].status, ExecutableState::Running);

    let second_counter = Arc::new(CountingStep::default());
    cluster.start_node_with("node-2", counting_steps(second_counter.clone()));

    let status = client
        .wait_for_final(&job_id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(status, ExecutableState::Succeed);

    // Finished steps are not repeated; the interrupted one runs again.
    assert_eq!(first_counter.calls(StepKind::CreateFlatTable), 1);
    assert_eq!(second_counter.calls(StepKind::CreateFlatTable), 0);
    assert_eq!(second_counter.calls(StepKind::ExtractFactDistinctColumns), 0);
    assert_eq!(second_counter.calls(StepKind::BuildDictionary), 1);
    assert_eq!(second_counter.calls(StepKind::BuildBaseCuboid), 1);

    let cube = client.cubes().get_cube("sales").await.unwrap().cube;
    assert_eq!(cube.segments[0].status, SegmentStatus::Active);
    assert_eq!(cube.segments[0].last_build_job, Some(job_id));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_graceful_stop_leaves_job_for_successor() {
    let mut cluster = TestCluster::empty();
    let first_counter = Arc::new(CountingStep::default());
    let gate = Arc::new(GateStep::default());
    let first = cluster.start_node_with(
        "node-1",
        steps_with(first_counter.clone(), StepKind::BuildDictionary, gate.clone()),
    );
    cluster.wait_for_active(ACTIVE_TIMEOUT).await.expect("no active scheduler");
    let second_counter = Arc::new(CountingStep::default());
    cluster.start_node_with("node-2", counting_steps(second_counter.clone()));

    seed_cube(&first, "sales", EngineType::InMemory).await;
    let handle = first
        .build_segment("sales", parse_timestamp("2022-01-01").unwrap(), SUBMITTER)
        .await
        .unwrap();

    assert_eventually(
        || async { gate.entered() == 1 },
        ACTIVE_TIMEOUT,
        "dictionary step never started",
    )
    .await;

    let leaving = cluster.nodes.remove("node-1").unwrap();
    leaving.request_stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stopping = tokio::spawn(leaving.stop());
    // The in-flight step is allowed to finish.
    gate.open();
    stopping.await.unwrap();

    let client = cluster.client("client");
    let status = client
        .wait_for_final(&handle.job_id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(status, ExecutableState::Succeed);

    // Whoever ran it, every step after the gate ran exactly once.
    assert_eq!(gate.entered(), 1);
    assert_eq!(second_counter.calls(StepKind::BuildDictionary), 0);
    assert_eq!(
        first_counter.calls(StepKind::BuildInMemCuboid) + second_counter.calls(StepKind::BuildInMemCuboid),
        1
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_lost_lease_stops_dispatch_until_reacquired() {
    let mut cluster = TestCluster::new(1);
    cluster.wait_for_active(ACTIVE_TIMEOUT).await.expect("no active scheduler");
    let node = cluster.get_node("node-1").unwrap().clone();
    seed_cube(&node, "sales", EngineType::Layered).await;

    // Another holder grabs the lease behind node-1's back.
    let key = format!("leases/{}", SCHEDULER_LEASE);
    let record = cluster.store.get(&key).await.unwrap().unwrap();
    cluster.store.delete(&key, record.version).await.unwrap();
    let intruder = StoreLease::new(cluster.store.clone(), SCHEDULER_LEASE, "intruder");
    assert!(intruder.acquire(Duration::from_secs(30)).await.unwrap());

    let mut state = node.scheduler().subscribe_state();
    tokio::time::timeout(
        ACTIVE_TIMEOUT,
        state.wait_for(|s| *s == SchedulerState::Stopped),
    )
    .await
    .expect("scheduler kept running without the lease")
    .unwrap();

    let handle = node
        .build_segment("sales", parse_timestamp("2013-01-01").unwrap(), SUBMITTER)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        node.registry().get(&handle.job_id).await.unwrap().status,
        ExecutableState::Ready
    );
    assert_eq!(node.active_scheduler().await.unwrap().holder, "intruder");

    intruder.release().await.unwrap();
    let status = node
        .wait_for_final(&handle.job_id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(status, ExecutableState::Succeed);
    assert_eq!(node.scheduler().state(), SchedulerState::Active);

    cluster.shutdown().await;
}
