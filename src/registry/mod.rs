//! Job registry: the single source of truth for job definitions and status.
//!
//! Every mutation is a read-modify-write against the metadata store guarded
//! by the document version, retried on conflict. Two writers racing on the
//! same job therefore serialize; neither update is lost or interleaved.
//! Committed status changes are broadcast as [`JobEvent`]s so waiters do not
//! have to poll.

mod wait;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{CubeForgeError, Result};
use crate::execution::{ExecutableState, Job, JobOutput, Output};
use crate::store::{self, MetadataStore, ABSENT};

const JOB_PREFIX: &str = "jobs/";
const EVENT_CAPACITY: usize = 1024;

/// A committed status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub status: ExecutableState,
}

pub struct JobRegistry {
    store: Arc<dyn MetadataStore>,
    events: broadcast::Sender<JobEvent>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { store, events }
    }

    fn key(id: &Uuid) -> String {
        format!("{}{}", JOB_PREFIX, id)
    }

    /// Subscribe to status changes committed through this registry.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn publish(&self, job: &Job) {
        // No receivers is fine.
        let _ = self.events.send(JobEvent {
            job_id: job.id,
            status: job.status,
        });
    }

    /// Persist a new job in READY status and return its id.
    ///
    /// The job is visible to [`get`](Self::get) and
    /// [`list_ids`](Self::list_ids) as soon as this returns.
    pub async fn submit(&self, mut job: Job) -> Result<Uuid> {
        if job.steps.is_empty() {
            return Err(CubeForgeError::Validation(format!(
                "job '{}' has no steps",
                job.name
            )));
        }

        job.status = ExecutableState::Ready;
        job.started_at = None;
        job.ended_at = None;
        for step in &mut job.steps {
            step.status = ExecutableState::Ready;
            step.started_at = None;
            step.ended_at = None;
        }

        let key = Self::key(&job.id);
        match store::put_typed(self.store.as_ref(), &key, &job, ABSENT).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                return Err(CubeForgeError::Validation(format!(
                    "job {} already submitted",
                    job.id
                )))
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            job_id = %job.id,
            name = %job.name,
            steps = job.steps.len(),
            submitter = %job.submitter,
            "Job submitted"
        );
        self.publish(&job);
        Ok(job.id)
    }

    async fn load(&self, id: &Uuid) -> Result<(Job, u64)> {
        store::get_typed(self.store.as_ref(), &Self::key(id))
            .await?
            .ok_or(CubeForgeError::JobNotFound(*id))
    }

    /// Current persisted snapshot of a job.
    pub async fn get(&self, id: &Uuid) -> Result<Job> {
        Ok(self.load(id).await?.0)
    }

    /// Current persisted status and outputs of a job.
    pub async fn get_output(&self, id: &Uuid) -> Result<JobOutput> {
        Ok(self.get(id).await?.output_snapshot())
    }

    /// Ids of every job in the store, including ones written by other
    /// processes.
    pub async fn list_ids(&self) -> Result<Vec<Uuid>> {
        let keys = self.store.list_keys(JOB_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                let raw = key.strip_prefix(JOB_PREFIX)?;
                match raw.parse() {
                    Ok(id) => Some(id),
                    Err(_) => {
                        tracing::warn!(key = %key, "Ignoring job key with a malformed id");
                        None
                    }
                }
            })
            .collect())
    }

    /// All jobs sorted chronologically by creation time.
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for id in self.list_ids().await? {
            match self.get(&id).await {
                Ok(job) => jobs.push(job),
                // Deleted between list and read.
                Err(CubeForgeError::JobNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    /// Remove a job. Refused while the job is RUNNING.
    pub async fn delete(&self, id: &Uuid) -> Result<()> {
        store::retry_on_conflict("delete_job", || async {
            let (job, version) = self.load(id).await?;
            if job.status == ExecutableState::Running {
                return Err(CubeForgeError::Precondition(format!(
                    "job {} is RUNNING and cannot be deleted",
                    id
                )));
            }
            self.store.delete(&Self::key(id), version).await
        })
        .await?;

        tracing::info!(job_id = %id, "Job deleted");
        Ok(())
    }

    /// Apply `mutate` to the latest persisted version of a job and commit it.
    ///
    /// `mutate` may run more than once if another writer commits first; it
    /// must only depend on the job it is given.
    pub async fn update<F>(&self, id: &Uuid, mutate: F) -> Result<Job>
    where
        F: Fn(&mut Job) -> Result<()>,
    {
        let (job, before) = store::retry_on_conflict("update_job", || async {
            let (mut job, version) = self.load(id).await?;
            let before = job.status;
            mutate(&mut job)?;
            store::put_typed(self.store.as_ref(), &Self::key(id), &job, version).await?;
            Ok((job, before))
        })
        .await?;

        if job.status != before {
            tracing::debug!(job_id = %id, from = %before, to = %job.status, "Job status changed");
            self.publish(&job);
        }
        Ok(job)
    }

    /// Move a job along the status graph.
    pub async fn transition(&self, id: &Uuid, to: ExecutableState) -> Result<Job> {
        self.update(id, |job| job.transition(to)).await
    }

    /// Move a job to a final status and record its output in the same commit.
    pub async fn finish(&self, id: &Uuid, to: ExecutableState, output: Output) -> Result<Job> {
        self.update(id, |job| {
            job.transition(to)?;
            job.output.log = output.log.clone();
            job.output.error = output.error.clone();
            job.output.info.extend(output.info.clone());
            Ok(())
        })
        .await
    }

    /// Move one step along the status graph, optionally replacing its output.
    pub async fn update_step(
        &self,
        id: &Uuid,
        index: usize,
        to: ExecutableState,
        output: Option<Output>,
    ) -> Result<Job> {
        self.update(id, |job| {
            let step = job.steps.get_mut(index).ok_or_else(|| {
                CubeForgeError::Validation(format!("job {} has no step {}", id, index))
            })?;
            // A job driven twice across a lease handover may see its step
            // already finished by the other holder; the first result stands.
            if to.is_final() && step.status == to {
                return Ok(());
            }
            step.transition(to)?;
            if let Some(output) = &output {
                step.output = output.clone();
            }
            Ok(())
        })
        .await
    }

    /// Abandon a READY, RUNNING or STOPPED job. A running chain stops before
    /// its next step; no step is marked ERROR.
    pub async fn discard(&self, id: &Uuid) -> Result<Job> {
        let job = self.transition(id, ExecutableState::Discarded).await?;
        tracing::info!(job_id = %id, "Job discarded");
        Ok(job)
    }

    /// Administratively pause a RUNNING job after its current step.
    pub async fn pause(&self, id: &Uuid) -> Result<Job> {
        let job = self.transition(id, ExecutableState::Stopped).await?;
        tracing::info!(job_id = %id, "Job paused");
        Ok(job)
    }

    /// Make a STOPPED job runnable again. The scheduler picks it up and
    /// continues at its first unfinished step.
    pub async fn resume(&self, id: &Uuid) -> Result<Job> {
        let job = self.transition(id, ExecutableState::Ready).await?;
        tracing::info!(job_id = %id, "Job resumed");
        Ok(job)
    }
}
