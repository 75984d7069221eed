use serde::{Deserialize, Serialize};

/// Status shared by jobs and their steps.
///
/// ```text
/// READY ──> RUNNING ──> SUCCEED | ERROR
///   │          ├──────> DISCARDED
///   │          └──────> STOPPED ──> READY
///   └──> DISCARDED         └──────> DISCARDED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutableState {
    Ready,
    Running,
    Succeed,
    Error,
    Stopped,
    Discarded,
}

impl ExecutableState {
    pub const ALL: [ExecutableState; 6] = [
        ExecutableState::Ready,
        ExecutableState::Running,
        ExecutableState::Succeed,
        ExecutableState::Error,
        ExecutableState::Stopped,
        ExecutableState::Discarded,
    ];

    /// Whether `self -> to` is an edge of the status graph.
    pub fn can_transition_to(self, to: ExecutableState) -> bool {
        use ExecutableState::*;
        matches!(
            (self, to),
            (Ready, Running)
                | (Ready, Discarded)
                | (Running, Succeed)
                | (Running, Error)
                | (Running, Discarded)
                | (Running, Stopped)
                | (Stopped, Ready)
                | (Stopped, Discarded)
        )
    }

    /// No further transition is possible. STOPPED is a pause, not an end.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ExecutableState::Succeed | ExecutableState::Error | ExecutableState::Discarded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutableState::Ready => "READY",
            ExecutableState::Running => "RUNNING",
            ExecutableState::Succeed => "SUCCEED",
            ExecutableState::Error => "ERROR",
            ExecutableState::Stopped => "STOPPED",
            ExecutableState::Discarded => "DISCARDED",
        }
    }
}

impl std::fmt::Display for ExecutableState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutableState {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        ExecutableState::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| format!("unknown job status '{}'", value))
    }
}
