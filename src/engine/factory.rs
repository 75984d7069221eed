use chrono::Utc;

use crate::cube::{Cube, EngineType, Segment};
use crate::error::{CubeForgeError, Result};
use crate::execution::{Job, JobType, StepKind};

pub const PARAM_CUBE: &str = "cube_name";
pub const PARAM_SEGMENT_ID: &str = "segment_id";
pub const PARAM_SEGMENT_NAME: &str = "segment_name";
pub const PARAM_RANGE_START: &str = "range_start";
pub const PARAM_RANGE_END: &str = "range_end";
pub const PARAM_ENGINE: &str = "engine";

const LAYERED_CHAIN: &[StepKind] = &[
    StepKind::CreateFlatTable,
    StepKind::ExtractFactDistinctColumns,
    StepKind::BuildDictionary,
    StepKind::BuildBaseCuboid,
    StepKind::BuildNDimensionCuboid,
    StepKind::ConvertToStorage,
    StepKind::UpdateCubeInfo,
    StepKind::GarbageCollection,
];

const IN_MEMORY_CHAIN: &[StepKind] = &[
    StepKind::CreateFlatTable,
    StepKind::ExtractFactDistinctColumns,
    StepKind::BuildDictionary,
    StepKind::BuildInMemCuboid,
    StepKind::ConvertToStorage,
    StepKind::UpdateCubeInfo,
    StepKind::GarbageCollection,
];

/// Turns a segment into the build job that fills it. Never submits.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchJobFactory;

impl BatchJobFactory {
    pub fn new() -> Self {
        Self
    }

    pub fn step_chain(engine: EngineType) -> &'static [StepKind] {
        match engine {
            EngineType::Layered => LAYERED_CHAIN,
            EngineType::InMemory => IN_MEMORY_CHAIN,
        }
    }

    pub fn create_build_job(&self, cube: &Cube, segment: &Segment, submitter: &str) -> Result<Job> {
        if segment.cube_name != cube.name {
            return Err(CubeForgeError::Validation(format!(
                "segment {} belongs to cube {}, not {}",
                segment.id, segment.cube_name, cube.name
            )));
        }
        segment.range.validate()?;

        let engine = cube.descriptor.engine;
        let name = format!(
            "BUILD CUBE - {} - {} - {}",
            cube.name,
            segment.name,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );

        let mut job = Job::new(JobType::CubeBuild, name, submitter)
            .with_param(PARAM_CUBE, &cube.name)
            .with_param(PARAM_SEGMENT_ID, segment.id)
            .with_param(PARAM_SEGMENT_NAME, &segment.name)
            .with_param(PARAM_RANGE_START, segment.range.start)
            .with_param(PARAM_RANGE_END, segment.range.end)
            .with_param(PARAM_ENGINE, engine);

        let flat_table = format!(
            "{}_intermediate_{}",
            cube.name.to_ascii_lowercase(),
            segment.name
        );
        for kind in Self::step_chain(engine) {
            let step = job.add_step(*kind);
            match kind {
                StepKind::CreateFlatTable | StepKind::ExtractFactDistinctColumns => {
                    step.params.insert("flat_table".to_string(), flat_table.clone());
                }
                StepKind::GarbageCollection => {
                    step.params.insert("drop_table".to_string(), flat_table.clone());
                }
                _ => {}
            }
        }

        tracing::debug!(
            job_id = %job.id,
            cube = %cube.name,
            segment = %segment.name,
            engine = %engine,
            steps = job.steps.len(),
            "Build job created"
        );
        Ok(job)
    }
}
