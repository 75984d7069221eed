use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CubeForgeError, Result};
use crate::execution::ExecutableState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    CubeBuild,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::CubeBuild => write!(f, "CUBE_BUILD"),
        }
    }
}

/// Which step body runs a step. The chain for each job type is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    CreateFlatTable,
    ExtractFactDistinctColumns,
    BuildDictionary,
    BuildBaseCuboid,
    BuildNDimensionCuboid,
    BuildInMemCuboid,
    ConvertToStorage,
    UpdateCubeInfo,
    GarbageCollection,
}

impl StepKind {
    /// Human-readable step name shown in job listings.
    pub fn display_name(self) -> &'static str {
        match self {
            StepKind::CreateFlatTable => "Create Intermediate Flat Table",
            StepKind::ExtractFactDistinctColumns => "Extract Fact Table Distinct Columns",
            StepKind::BuildDictionary => "Build Dimension Dictionary",
            StepKind::BuildBaseCuboid => "Build Base Cuboid",
            StepKind::BuildNDimensionCuboid => "Build N-Dimension Cuboids",
            StepKind::BuildInMemCuboid => "Build Cuboids In Memory",
            StepKind::ConvertToStorage => "Convert Cuboid Data to Storage",
            StepKind::UpdateCubeInfo => "Update Cube Info",
            StepKind::GarbageCollection => "Garbage Collection",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Free-form output attached to a job or step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub log: String,
    pub info: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl Output {
    pub fn with_log(log: impl Into<String>) -> Self {
        Self {
            log: log.into(),
            ..Default::default()
        }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            log: error.clone(),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn info(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.info.insert(key.into(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub name: String,
    pub kind: StepKind,
    pub params: BTreeMap<String, String>,
    pub status: ExecutableState,
    pub output: Output,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(index: usize, kind: StepKind) -> Self {
        Self {
            index,
            name: kind.display_name().to_string(),
            kind,
            params: BTreeMap::new(),
            status: ExecutableState::Ready,
            output: Output::default(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Apply a status change, stamping start/end times.
    pub fn transition(&mut self, to: ExecutableState) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(CubeForgeError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to == ExecutableState::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if to.is_final() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub name: String,
    pub submitter: String,
    pub params: BTreeMap<String, String>,
    pub steps: Vec<Step>,
    pub status: ExecutableState,
    pub output: Output,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(job_type: JobType, name: impl Into<String>, submitter: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type,
            name: name.into(),
            submitter: submitter.into(),
            params: BTreeMap::new(),
            steps: Vec::new(),
            status: ExecutableState::Ready,
            output: Output::default(),
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    /// Append a step to the end of the chain.
    pub fn add_step(&mut self, kind: StepKind) -> &mut Step {
        let index = self.steps.len();
        self.steps.push(Step::new(index, kind));
        &mut self.steps[index]
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Where a (re)started chain picks up: the first step that has not
    /// succeeded. `None` once every step succeeded.
    pub fn first_incomplete_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status != ExecutableState::Succeed)
    }

    pub fn transition(&mut self, to: ExecutableState) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(CubeForgeError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        self.status = to;
        self.updated_at = now;
        if to == ExecutableState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_final() {
            self.ended_at = Some(now);
        }
        Ok(())
    }

    /// Wall-clock duration from first start to end (or now if still going).
    pub fn duration_ms(&self) -> Option<i64> {
        let start = self.started_at?;
        let end = self.ended_at.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds())
    }

    /// Point-in-time view of the job's status and outputs.
    pub fn output_snapshot(&self) -> JobOutput {
        let mut output = self.output.clone();
        if let Some(start) = self.started_at {
            output
                .info
                .insert("start_time".to_string(), start.to_rfc3339());
        }
        if let Some(end) = self.ended_at {
            output.info.insert("end_time".to_string(), end.to_rfc3339());
        }
        if let Some(ms) = self.duration_ms() {
            output.info.insert("duration_ms".to_string(), ms.to_string());
        }

        JobOutput {
            job_id: self.id,
            status: self.status,
            output,
            steps: self
                .steps
                .iter()
                .map(|s| StepSummary {
                    index: s.index,
                    name: s.name.clone(),
                    status: s.status,
                    error: s.output.error.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub index: usize,
    pub name: String,
    pub status: ExecutableState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub job_id: Uuid,
    pub status: ExecutableState,
    pub output: Output,
    pub steps: Vec<StepSummary>,
}
