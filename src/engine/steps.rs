//! Default step bodies for cube build jobs.
//!
//! Data-processing steps are stand-ins that only record what they would have
//! done. The two metadata steps are real: they move the target segment to
//! READY and then ACTIVE through the [`CubeManager`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::factory::{PARAM_CUBE, PARAM_SEGMENT_ID, PARAM_SEGMENT_NAME};
use crate::cube::{CubeManager, SegmentStatus};
use crate::error::{CubeForgeError, Result};
use crate::execution::{Output, StepContext, StepExecutor, StepKind, StepRegistry, StepResult};

fn required<'a>(ctx: &'a StepContext, key: &str) -> Result<&'a str> {
    ctx.job_param(key).ok_or_else(|| {
        CubeForgeError::Validation(format!("job {} is missing parameter '{}'", ctx.job_id, key))
    })
}

fn segment_id(ctx: &StepContext) -> Result<Uuid> {
    required(ctx, PARAM_SEGMENT_ID)?
        .parse()
        .map_err(|e| CubeForgeError::Validation(format!("bad segment id: {}", e)))
}

/// Records the step and optionally sleeps to stand in for real work.
pub struct SimulatedStep {
    delay: Duration,
}

impl SimulatedStep {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl StepExecutor for SimulatedStep {
    async fn execute(&self, ctx: &StepContext) -> Result<StepResult> {
        let cube = required(ctx, PARAM_CUBE)?;
        let segment = required(ctx, PARAM_SEGMENT_NAME)?;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut output = Output::with_log(format!("{} for {}/{}", ctx.step.name, cube, segment))
            .info("cube", cube)
            .info("segment", segment);
        for (k, v) in &ctx.step.params {
            output = output.info(k.clone(), v);
        }
        if ctx.resumed {
            output = output.info("resumed", true);
        }
        Ok(StepResult::succeed(output))
    }
}

/// Moves the segment to `target`. Already at or past it counts as done.
pub struct SegmentStatusStep {
    cubes: Arc<CubeManager>,
    target: SegmentStatus,
    record_job: bool,
}

impl SegmentStatusStep {
    /// Storage conversion finished: segment data is in place.
    pub fn convert_to_storage(cubes: Arc<CubeManager>) -> Self {
        Self {
            cubes,
            target: SegmentStatus::Ready,
            record_job: false,
        }
    }

    /// Publish the segment and remember which job built it.
    pub fn update_cube_info(cubes: Arc<CubeManager>) -> Self {
        Self {
            cubes,
            target: SegmentStatus::Active,
            record_job: true,
        }
    }
}

#[async_trait]
impl StepExecutor for SegmentStatusStep {
    async fn execute(&self, ctx: &StepContext) -> Result<StepResult> {
        let cube_name = required(ctx, PARAM_CUBE)?;
        let segment_id = segment_id(ctx)?;

        let current = self.cubes.get_cube(cube_name).await?;
        let Some(segment) = current.cube.segment(&segment_id) else {
            return Ok(StepResult::error(format!(
                "segment {} was removed from cube {} during the build",
                segment_id, cube_name
            )));
        };

        if segment.status >= self.target {
            return Ok(StepResult::succeed(
                Output::with_log(format!("segment {} already {}", segment.name, segment.status))
                    .info("segment_status", segment.status),
            ));
        }

        let build_job = self.record_job.then_some(ctx.job_id);
        let updated = self
            .cubes
            .update_segment_status(cube_name, segment_id, self.target, build_job)
            .await?;
        Ok(StepResult::succeed(
            Output::with_log(format!("segment {} is now {}", updated.name, updated.status))
                .info("segment_status", updated.status),
        ))
    }
}

/// Step bodies for every [`StepKind`] a build job can contain.
pub fn default_step_registry(cubes: Arc<CubeManager>, step_delay: Duration) -> StepRegistry {
    let simulated: Arc<dyn StepExecutor> = Arc::new(SimulatedStep::new(step_delay));
    let mut registry = StepRegistry::new();
    for kind in [
        StepKind::CreateFlatTable,
        StepKind::ExtractFactDistinctColumns,
        StepKind::BuildDictionary,
        StepKind::BuildBaseCuboid,
        StepKind::BuildNDimensionCuboid,
        StepKind::BuildInMemCuboid,
        StepKind::GarbageCollection,
    ] {
        registry.register(kind, simulated.clone());
    }
    registry
        .register(
            StepKind::ConvertToStorage,
            Arc::new(SegmentStatusStep::convert_to_storage(cubes.clone())),
        )
        .register(
            StepKind::UpdateCubeInfo,
            Arc::new(SegmentStatusStep::update_cube_info(cubes)),
        );
    registry
}
