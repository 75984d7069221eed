mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cubeforge::cube::{parse_timestamp, SegmentRange, SegmentStatus};
use cubeforge::execution::{ExecutableState, StepKind};
use cubeforge::harness::{self, SCENARIOS};
use cubeforge::node::Node;
use cubeforge::CubeForgeError;
use test_harness::{steps_with, test_node_config, CountingStep, FailingStep, TestCluster, TestNode};

const ACTIVE_TIMEOUT: Duration = Duration::from_secs(5);

fn ts(date: &str) -> i64 {
    parse_timestamp(date).unwrap()
}

async fn ranges(node: &Node, cube: &str) -> Vec<SegmentRange> {
    let cube = node.cubes().get_cube(cube).await.unwrap().cube;
    assert!(cube.segments.iter().all(|s| s.status == SegmentStatus::Active));
    cube.segments.iter().map(|s| s.range).collect()
}

#[tokio::test]
async fn test_all_scenarios_succeed() {
    let mut cluster = TestCluster::new(1);
    cluster.wait_for_active(ACTIVE_TIMEOUT).await.expect("no active scheduler");
    let node = cluster.get_node("node-1").unwrap().clone();

    harness::prepare(&node).await.unwrap();
    let names: Vec<&str> = SCENARIOS.iter().map(|s| s.name).collect();
    let report = harness::run_scenarios(&node, &names, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.all_succeeded(), "{:?}", report);
    report.ensure_succeeded().unwrap();
    assert_eq!(report.results.len(), 4);
    assert_eq!(report.job_count(), 7);

    assert_eq!(
        ranges(&node, "sales_inner_full").await,
        vec![SegmentRange { start: 0, end: ts("2050-01-11") }]
    );
    assert_eq!(
        ranges(&node, "sales_inner_incremental").await,
        vec![
            SegmentRange { start: 0, end: ts("2013-01-01") },
            SegmentRange { start: ts("2013-01-01"), end: ts("2022-01-01") },
        ]
    );
    assert_eq!(
        ranges(&node, "sales_left_full").await,
        vec![SegmentRange { start: 0, end: ts("2050-11-12") }]
    );
    assert_eq!(
        ranges(&node, "sales_left_incremental").await,
        vec![
            SegmentRange { start: 0, end: ts("2012-06-01") },
            SegmentRange { start: ts("2012-06-01"), end: ts("2022-01-01") },
            SegmentRange { start: ts("2022-01-01"), end: ts("2023-01-01") },
        ]
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rerun_resets_cube_and_purges_old_jobs() {
    let mut cluster = TestCluster::new(1);
    cluster.wait_for_active(ACTIVE_TIMEOUT).await.expect("no active scheduler");
    let node = cluster.get_node("node-1").unwrap().clone();
    let cancel = CancellationToken::new();

    harness::prepare(&node).await.unwrap();
    let first = harness::run_scenarios(&node, &["inner_join_incremental"], &cancel)
        .await
        .unwrap();
    first.ensure_succeeded().unwrap();
    assert_eq!(node.registry().list_ids().await.unwrap().len(), 2);

    harness::prepare(&node).await.unwrap();
    assert!(node.registry().list_ids().await.unwrap().is_empty());

    let second = harness::run_scenarios(&node, &["inner_join_incremental"], &cancel)
        .await
        .unwrap();
    second.ensure_succeeded().unwrap();
    assert_eq!(ranges(&node, "sales_inner_incremental").await.len(), 2);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failed_build_ends_the_scenario() {
    let mut cluster = TestCluster::empty();
    let counter = Arc::new(CountingStep::default());
    let node = cluster.start_node_with(
        "node-1",
        steps_with(counter.clone(), StepKind::BuildDictionary, Arc::new(FailingStep)),
    );
    cluster.wait_for_active(ACTIVE_TIMEOUT).await.expect("no active scheduler");

    harness::prepare(&node).await.unwrap();
    let report = harness::run_scenarios(&node, &["inner_join_incremental"], &CancellationToken::new())
        .await
        .unwrap();

    // The second segment is never submitted.
    let result = &report.results[0];
    assert!(!result.succeeded());
    assert!(result.error.is_none());
    assert_eq!(result.jobs.len(), 1);
    assert_eq!(result.jobs[0].status, ExecutableState::Error);
    assert_eq!(node.registry().list_ids().await.unwrap(), vec![result.jobs[0].job_id]);

    let err = report.ensure_succeeded().unwrap_err().to_string();
    assert!(err.contains(&result.jobs[0].job_id.to_string()), "{}", err);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_unknown_scenario_is_rejected() {
    let cluster = TestCluster::empty();
    let client = cluster.client("client");
    harness::prepare(&client).await.unwrap();

    let err = harness::run_scenarios(&client, &["inner_join_full", "no_such"], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CubeForgeError::Validation(_)));
    // Nothing was submitted.
    assert!(client.registry().list_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scenario_without_scheduler_times_out() {
    let cluster = TestCluster::empty();
    let mut config = test_node_config("client");
    config.wait.timeout_ms = Some(200);
    let client = Node::with_store(config, cluster.store.clone());
    harness::prepare(&client).await.unwrap();

    let report = harness::run_scenarios(&client, &["left_join_full"], &CancellationToken::new())
        .await
        .unwrap();
    assert!(!report.all_succeeded());
    let error = report.results[0].error.as_deref().unwrap();
    assert!(error.starts_with("Timed out waiting for job"), "{}", error);

    let jobs = client.registry().list_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, ExecutableState::Ready);
}

#[tokio::test]
async fn test_scenarios_across_processes_sharing_a_data_dir() {
    let dir = tempfile::tempdir().unwrap();

    // Two independent stores on one directory, as two processes would have.
    let scheduler = Node::open(test_node_config("scheduler").with_data_dir(dir.path()))
        .await
        .unwrap();
    let running = TestNode::spawn(scheduler);

    let client = Node::open(test_node_config("client").with_data_dir(dir.path()))
        .await
        .unwrap();
    harness::prepare(&client).await.unwrap();
    let report = harness::run_scenarios(
        &client,
        &["left_join_full", "left_join_incremental"],
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    report.ensure_succeeded().unwrap();
    assert_eq!(report.job_count(), 4);
    assert_eq!(client.active_scheduler().await.unwrap().holder, "scheduler");
    assert_eq!(ranges(&client, "sales_left_incremental").await.len(), 3);

    running.stop().await;
    assert!(matches!(
        client.active_scheduler().await,
        Err(CubeForgeError::SchedulerUnavailable)
    ));
}
