use thiserror::Error;
use uuid::Uuid;

use crate::execution::ExecutableState;

#[derive(Error, Debug)]
pub enum CubeForgeError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid segment range [{start}, {end}): end must be greater than start")]
    InvalidRange { start: i64, end: i64 },

    #[error("Concurrent modification of {key}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Segment {segment} [{start}, {end}) overlaps another segment of cube {cube}")]
    Overlap {
        cube: String,
        segment: String,
        start: i64,
        end: i64,
    },

    #[error("Step execution failed: {0}")]
    Execution(String),

    #[error("No scheduler instance holds the active lease")]
    SchedulerUnavailable,

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Illegal status transition from {from} to {to}")]
    InvalidTransition {
        from: ExecutableState,
        to: ExecutableState,
    },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Cube not found: {0}")]
    CubeNotFound(String),

    #[error("Cube already exists: {0}")]
    CubeExists(String),

    #[error("Segment {segment} not found in cube {cube}")]
    SegmentNotFound { cube: String, segment: Uuid },

    #[error("Lease {0} is no longer held")]
    LeaseLost(String),

    #[error("Timed out waiting for job {0}")]
    Timeout(Uuid),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Gave up after {0} attempts")]
    TooManyRetries(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CubeForgeError {
    /// Conflicts are the only errors a read-modify-write loop should retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CubeForgeError::ConcurrencyConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, CubeForgeError>;
