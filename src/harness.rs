//! End-to-end build scenarios.
//!
//! Each scenario resets one cube and builds a sequence of contiguous
//! segments through the public node API, waiting for every job. Scenarios
//! are looked up by name in [`SCENARIOS`].

use futures::future::{join_all, BoxFuture, FutureExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cube::{parse_timestamp, CubeDescriptor, EngineType};
use crate::error::{CubeForgeError, Result};
use crate::execution::ExecutableState;
use crate::node::Node;

pub const SUBMITTER: &str = "TEST";

type ScenarioFn = for<'a> fn(&'a Node, &'a CancellationToken) -> BoxFuture<'a, Result<Vec<Uuid>>>;

pub struct Scenario {
    pub name: &'static str,
    pub cube: &'static str,
    pub engine: EngineType,
    pub description: &'static str,
    run: ScenarioFn,
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("cube", &self.cube)
            .field("engine", &self.engine)
            .finish()
    }
}

pub static SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "inner_join_full",
        cube: "sales_inner_full",
        engine: EngineType::Layered,
        description: "one full build up to 2050-01-11",
        run: inner_join_full,
    },
    Scenario {
        name: "inner_join_incremental",
        cube: "sales_inner_incremental",
        engine: EngineType::Layered,
        description: "two appends: up to 2013-01-01, then up to 2022-01-01",
        run: inner_join_incremental,
    },
    Scenario {
        name: "left_join_full",
        cube: "sales_left_full",
        engine: EngineType::InMemory,
        description: "one full build up to 2050-11-12",
        run: left_join_full,
    },
    Scenario {
        name: "left_join_incremental",
        cube: "sales_left_incremental",
        engine: EngineType::InMemory,
        description: "three appends: 2012-06-01, 2022-01-01, then an empty 2023-01-01 segment",
        run: left_join_incremental,
    },
];

pub fn find(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

fn inner_join_full<'a>(node: &'a Node, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Vec<Uuid>>> {
    build_sequence(node, cancel, "sales_inner_full", &["2050-01-11"]).boxed()
}

fn inner_join_incremental<'a>(
    node: &'a Node,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<Vec<Uuid>>> {
    build_sequence(node, cancel, "sales_inner_incremental", &["2013-01-01", "2022-01-01"]).boxed()
}

fn left_join_full<'a>(node: &'a Node, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Vec<Uuid>>> {
    build_sequence(node, cancel, "sales_left_full", &["2050-11-12"]).boxed()
}

fn left_join_incremental<'a>(
    node: &'a Node,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<Vec<Uuid>>> {
    build_sequence(
        node,
        cancel,
        "sales_left_incremental",
        &["2012-06-01", "2022-01-01", "2023-01-01"],
    )
    .boxed()
}

/// Clear `cube`, then build one segment per end date in order, waiting for
/// each job before appending the next segment. Stops after the first build
/// that does not SUCCEED, so that job is the last one reported.
async fn build_sequence(
    node: &Node,
    cancel: &CancellationToken,
    cube: &str,
    ends: &[&str],
) -> Result<Vec<Uuid>> {
    node.clear_segments(cube).await?;

    let mut jobs = Vec::with_capacity(ends.len());
    for end in ends {
        let handle = node.build_segment(cube, parse_timestamp(end)?, SUBMITTER).await?;
        let status = node.wait_for_final(&handle.job_id, cancel).await?;
        tracing::info!(
            cube = %cube,
            segment = %handle.segment.name,
            job_id = %handle.job_id,
            status = %status,
            "Scenario build finished"
        );
        jobs.push(handle.job_id);
        if status != ExecutableState::Succeed {
            tracing::warn!(cube = %cube, job_id = %handle.job_id, status = %status, "Stopping scenario after failed build");
            break;
        }
    }
    Ok(jobs)
}

/// Create the cubes every scenario needs. Existing cubes are kept.
pub async fn seed_cubes(node: &Node) -> Result<()> {
    for scenario in SCENARIOS {
        let descriptor = CubeDescriptor {
            partition_date_start: 0,
            engine: scenario.engine,
        };
        match node.cubes().create_cube(scenario.cube, descriptor).await {
            Ok(_) | Err(CubeForgeError::CubeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Drop finished build jobs left from earlier runs and make sure the
/// scenario cubes exist.
pub async fn prepare(node: &Node) -> Result<()> {
    node.purge_build_jobs().await?;
    seed_cubes(node).await
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub status: ExecutableState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub name: String,
    pub cube: String,
    pub jobs: Vec<JobResult>,
    pub error: Option<String>,
}

impl ScenarioResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.jobs.iter().all(|j| j.status == ExecutableState::Succeed)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioReport {
    pub results: Vec<ScenarioResult>,
}

impl ScenarioReport {
    pub fn job_count(&self) -> usize {
        self.results.iter().map(|r| r.jobs.len()).sum()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(ScenarioResult::succeeded)
    }

    /// Fail naming every job that did not SUCCEED and every scenario that
    /// errored.
    pub fn ensure_succeeded(&self) -> Result<()> {
        let mut problems = Vec::new();
        for result in &self.results {
            if let Some(error) = &result.error {
                problems.push(format!("{}: {}", result.name, error));
            }
            for job in result.jobs.iter().filter(|j| j.status != ExecutableState::Succeed) {
                problems.push(format!("{}: job '{}' is {}", result.name, job.job_id, job.status));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(CubeForgeError::Execution(problems.join("; ")))
        }
    }
}

/// Run the named scenarios concurrently and collect the final status of
/// every job they submitted. Scenarios need a scheduler holding the lease
/// somewhere; this only submits and waits.
pub async fn run_scenarios(node: &Node, names: &[&str], cancel: &CancellationToken) -> Result<ScenarioReport> {
    let scenarios = names
        .iter()
        .map(|name| {
            find(name).ok_or_else(|| CubeForgeError::Validation(format!("unknown scenario '{}'", name)))
        })
        .collect::<Result<Vec<_>>>()?;

    let runs = scenarios.iter().map(|scenario| async move {
        tracing::info!(scenario = scenario.name, cube = scenario.cube, "Scenario started");
        let outcome = (scenario.run)(node, cancel).await;
        (scenario, outcome)
    });

    let mut report = ScenarioReport::default();
    for (scenario, outcome) in join_all(runs).await {
        let mut result = ScenarioResult {
            name: scenario.name.to_string(),
            cube: scenario.cube.to_string(),
            jobs: Vec::new(),
            error: None,
        };
        match outcome {
            Ok(ids) => {
                for job_id in ids {
                    let status = node.registry().get(&job_id).await?.status;
                    result.jobs.push(JobResult { job_id, status });
                }
            }
            Err(e) => result.error = Some(e.to_string()),
        }
        tracing::info!(
            scenario = scenario.name,
            jobs = result.jobs.len(),
            succeeded = result.succeeded(),
            "Scenario finished"
        );
        report.results.push(result);
    }
    Ok(report)
}
