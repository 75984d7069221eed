use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CubeForgeError, Result};
use crate::execution::{ExecutableState, Output, StepContext, StepRegistry, StepResult};
use crate::registry::JobRegistry;

/// How a call to [`ChainedExecutor::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    /// This run drove the job to SUCCEED or ERROR.
    Finished(ExecutableState),
    /// `halt` fired between steps; the job is left RUNNING for the next
    /// scheduler to resume.
    Halted,
    /// Someone else moved the job out of RUNNING (discard or pause) while
    /// the chain was working on it.
    Interrupted(ExecutableState),
    /// The job was not runnable when picked up.
    Skipped(ExecutableState),
}

/// Runs a job's steps strictly in order, persisting every step transition
/// before moving on.
///
/// Re-running a job that was interrupted continues at the first step that
/// has not succeeded. A step that was RUNNING when the previous run died is
/// invoked again with [`StepContext::resumed`] set.
#[derive(Clone)]
pub struct ChainedExecutor {
    registry: Arc<JobRegistry>,
    steps: Arc<StepRegistry>,
}

impl ChainedExecutor {
    pub fn new(registry: Arc<JobRegistry>, steps: Arc<StepRegistry>) -> Self {
        Self { registry, steps }
    }

    pub async fn run(&self, job_id: Uuid, halt: &CancellationToken) -> Result<ChainOutcome> {
        let job = self.registry.get(&job_id).await?;
        match job.status {
            ExecutableState::Ready => {
                match self.registry.transition(&job_id, ExecutableState::Running).await {
                    Ok(_) => tracing::info!(job_id = %job_id, name = %job.name, "Job started"),
                    // Discarded between the read and the write.
                    Err(CubeForgeError::InvalidTransition { from, .. }) => {
                        return Ok(ChainOutcome::Skipped(from))
                    }
                    Err(e) => return Err(e),
                }
            }
            ExecutableState::Running => {
                tracing::info!(job_id = %job_id, name = %job.name, "Resuming job");
            }
            other => return Ok(ChainOutcome::Skipped(other)),
        }

        loop {
            if halt.is_cancelled() {
                tracing::info!(job_id = %job_id, "Halting job between steps");
                return Ok(ChainOutcome::Halted);
            }

            let job = self.registry.get(&job_id).await?;
            if job.status != ExecutableState::Running {
                tracing::info!(job_id = %job_id, status = %job.status, "Job left RUNNING, stopping chain");
                return Ok(ChainOutcome::Interrupted(job.status));
            }

            let Some(index) = job.first_incomplete_step() else {
                return self
                    .finish(&job_id, ExecutableState::Succeed, Output::with_log("all steps succeeded"))
                    .await;
            };
            let step = job.steps[index].clone();

            let resumed = match step.status {
                ExecutableState::Ready => {
                    self.registry
                        .update_step(&job_id, index, ExecutableState::Running, None)
                        .await?;
                    false
                }
                ExecutableState::Running => true,
                ExecutableState::Error => {
                    // Failed step persisted but the job never got its ERROR.
                    let message = step
                        .output
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("step '{}' failed", step.name));
                    return self.fail(&job_id, index, &message).await;
                }
                other => {
                    let message = format!("step '{}' is {} inside a RUNNING job", step.name, other);
                    return self.fail(&job_id, index, &message).await;
                }
            };

            tracing::info!(
                job_id = %job_id,
                step = index,
                name = %step.name,
                resumed,
                "Running step"
            );
            let ctx = StepContext {
                job_id,
                job_params: job.params.clone(),
                step,
                resumed,
            };
            let result = self.execute(&ctx).await;

            self.registry
                .update_step(&job_id, index, result.status, Some(result.output.clone()))
                .await?;

            if result.status == ExecutableState::Error {
                let message = result
                    .output
                    .error
                    .unwrap_or_else(|| format!("step '{}' failed", ctx.step.name));
                return self.fail(&job_id, index, &message).await;
            }
        }
    }

    async fn execute(&self, ctx: &StepContext) -> StepResult {
        let Some(executor) = self.steps.get(ctx.step.kind) else {
            return StepResult::error(format!("no executor registered for '{}'", ctx.step.kind));
        };
        match executor.execute(ctx).await {
            Ok(result) if result.status == ExecutableState::Succeed => result,
            Ok(result) if result.status == ExecutableState::Error => result,
            Ok(result) => StepResult::error(format!(
                "step '{}' returned non-final status {}",
                ctx.step.name, result.status
            )),
            Err(e) => StepResult::error(e.to_string()),
        }
    }

    async fn fail(&self, job_id: &Uuid, index: usize, message: &str) -> Result<ChainOutcome> {
        tracing::warn!(job_id = %job_id, step = index, error = %message, "Job failed");
        let output = Output::with_error(message).info("failed_step", index);
        self.finish(job_id, ExecutableState::Error, output).await
    }

    async fn finish(
        &self,
        job_id: &Uuid,
        to: ExecutableState,
        output: Output,
    ) -> Result<ChainOutcome> {
        match self.registry.finish(job_id, to, output).await {
            Ok(job) => {
                tracing::info!(
                    job_id = %job_id,
                    status = %to,
                    duration_ms = job.duration_ms().unwrap_or_default(),
                    "Job finished"
                );
                Ok(ChainOutcome::Finished(to))
            }
            // Discarded or paused concurrently; that write wins.
            Err(CubeForgeError::InvalidTransition { from, .. }) => {
                Ok(ChainOutcome::Interrupted(from))
            }
            Err(e) => Err(e),
        }
    }
}
