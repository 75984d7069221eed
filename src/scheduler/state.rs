use serde::{Deserialize, Serialize};

/// Role of one scheduler instance. Only an ACTIVE instance dispatches work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    /// Not holding the lease; trying to acquire it.
    Stopped,
    /// Lease acquired, recovering persisted work.
    Starting,
    /// Holding the lease and dispatching.
    Active,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerState::Stopped => write!(f, "STOPPED"),
            SchedulerState::Starting => write!(f, "STARTING"),
            SchedulerState::Active => write!(f, "ACTIVE"),
        }
    }
}
