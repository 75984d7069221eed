//! Executable state machine: job and step records, the status graph they
//! move along, and the chained executor that drives a job's steps.

mod chain;
mod job;
mod state;
mod step;

pub use chain::{ChainOutcome, ChainedExecutor};
pub use job::{Job, JobOutput, JobType, Output, Step, StepKind, StepSummary};
pub use state::ExecutableState;
pub use step::{StepContext, StepExecutor, StepRegistry, StepResult};
