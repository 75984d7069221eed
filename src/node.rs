use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::cube::{CubeManager, Segment, VersionedCube};
use crate::engine::{default_step_registry, BatchJobFactory};
use crate::error::{CubeForgeError, Result};
use crate::execution::{ChainedExecutor, ExecutableState, JobType, StepRegistry};
use crate::lease::{LeaseRecord, StoreLease};
use crate::registry::JobRegistry;
use crate::scheduler::Scheduler;
use crate::store::{self, MetadataStore};

/// Name of the cluster-wide scheduler lease.
pub const SCHEDULER_LEASE: &str = "scheduler";

/// A segment appended for a build, and the job submitted to fill it.
#[derive(Debug, Clone, Serialize)]
pub struct BuildHandle {
    pub job_id: Uuid,
    pub segment: Segment,
}

/// All services of one process, wired explicitly.
///
/// Every collaborator is built here and passed down by reference; nothing is
/// looked up globally. Several nodes may share one store. Each runs its own
/// scheduler and only the lease holder dispatches.
pub struct Node {
    config: NodeConfig,
    store: Arc<dyn MetadataStore>,
    registry: Arc<JobRegistry>,
    cubes: Arc<CubeManager>,
    factory: BatchJobFactory,
    lease: Arc<StoreLease>,
    scheduler: Arc<Scheduler>,
}

impl Node {
    /// Open the configured store and wire a node with the default step
    /// bodies.
    pub async fn open(config: NodeConfig) -> Result<Self> {
        let store = store::open(&config.store).await?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: NodeConfig, store: Arc<dyn MetadataStore>) -> Self {
        let cubes = Arc::new(CubeManager::new(store.clone()));
        let steps = default_step_registry(cubes.clone(), config.engine.step_delay());
        Self::assemble(config, store, cubes, steps)
    }

    /// Wire a node whose step bodies come from `build_steps`, which is given
    /// the node's cube manager.
    pub fn with_steps<F>(config: NodeConfig, store: Arc<dyn MetadataStore>, build_steps: F) -> Self
    where
        F: FnOnce(Arc<CubeManager>) -> StepRegistry,
    {
        let cubes = Arc::new(CubeManager::new(store.clone()));
        let steps = build_steps(cubes.clone());
        Self::assemble(config, store, cubes, steps)
    }

    fn assemble(
        config: NodeConfig,
        store: Arc<dyn MetadataStore>,
        cubes: Arc<CubeManager>,
        steps: StepRegistry,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new(store.clone()));
        let chain = ChainedExecutor::new(registry.clone(), Arc::new(steps));
        let lease = Arc::new(StoreLease::new(
            store.clone(),
            SCHEDULER_LEASE,
            config.scheduler.node_id.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            registry.clone(),
            chain,
            lease.clone(),
        ));

        Self {
            config,
            store,
            registry,
            cubes,
            factory: BatchJobFactory::new(),
            lease,
            scheduler,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn cubes(&self) -> &Arc<CubeManager> {
        &self.cubes
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Run this node's scheduler until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.scheduler.run(cancel).await
    }

    /// Append the next segment of `cube` up to `end`, build its job and
    /// submit it. The job runs once some scheduler holds the lease.
    pub async fn build_segment(&self, cube: &str, end: i64, submitter: &str) -> Result<BuildHandle> {
        let segment = self.cubes.append_and_commit(cube, end).await?;
        let current = self.cubes.get_cube(cube).await?;
        let job = self
            .factory
            .create_build_job(&current.cube, &segment, submitter)?;
        let job_id = self.registry.submit(job).await?;

        tracing::info!(
            cube = %cube,
            segment = %segment.name,
            job_id = %job_id,
            "Segment build submitted"
        );
        Ok(BuildHandle { job_id, segment })
    }

    /// Remove every segment of `cube`, retrying on concurrent updates.
    pub async fn clear_segments(&self, cube: &str) -> Result<VersionedCube> {
        let cleared = store::retry_on_conflict("clear_segments", || async {
            let current = self.cubes.get_cube(cube).await?;
            self.cubes
                .apply_update(self.cubes.clear_segments(&current))
                .await
        })
        .await?;
        tracing::info!(cube = %cube, "Segments cleared");
        Ok(cleared)
    }

    /// Block until the job is final, using the node's wait settings.
    pub async fn wait_for_final(&self, job_id: &Uuid, cancel: &CancellationToken) -> Result<ExecutableState> {
        self.registry
            .wait_for_final(job_id, &self.config.wait, cancel)
            .await
    }

    /// Delete every cube build job that is not RUNNING. Returns how many
    /// were removed.
    pub async fn purge_build_jobs(&self) -> Result<usize> {
        let mut removed = 0;
        for job in self.registry.list_jobs().await? {
            if job.job_type != JobType::CubeBuild || job.status == ExecutableState::Running {
                continue;
            }
            match self.registry.delete(&job.id).await {
                Ok(()) => removed += 1,
                // Started or removed since listing.
                Err(CubeForgeError::Precondition(_)) | Err(CubeForgeError::JobNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::info!(removed, "Purged build jobs");
        Ok(removed)
    }

    /// Lease record of the currently active scheduler, wherever it runs.
    pub async fn active_scheduler(&self) -> Result<LeaseRecord> {
        match self.lease.current().await? {
            Some(record) if !record.is_expired(Utc::now()) => Ok(record),
            _ => Err(CubeForgeError::SchedulerUnavailable),
        }
    }
}
