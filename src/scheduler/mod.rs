//! Lease-holding scheduler: discovers runnable jobs in the registry and
//! drives them through a bounded pool of chained executors.

mod pool;
mod queue;
mod runner;
mod state;

pub use pool::{Completion, WorkerPool};
pub use queue::{DispatchQueue, DEFAULT_MAX_JOBS};
pub use runner::Scheduler;
pub use state::SchedulerState;
