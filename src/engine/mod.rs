//! Batch job factory and the step bodies its jobs run.

mod factory;
mod steps;

pub use factory::{
    BatchJobFactory, PARAM_CUBE, PARAM_ENGINE, PARAM_RANGE_END, PARAM_RANGE_START,
    PARAM_SEGMENT_ID, PARAM_SEGMENT_NAME,
};
pub use steps::{default_step_registry, SegmentStatusStep, SimulatedStep};
