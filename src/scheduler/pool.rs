use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CubeForgeError, Result};
use crate::execution::{ChainOutcome, ChainedExecutor};

/// One finished chain: which job, and how it ended.
pub type Completion = (Uuid, Result<ChainOutcome>);

/// Bounded set of chains running on this instance.
///
/// A permit is taken before a chain is spawned and returned when it ends, so
/// at most `size` jobs are driven at once. A job id already in flight is
/// never spawned a second time.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tasks: JoinSet<Completion>,
    in_flight: HashSet<Uuid>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
            tasks: JoinSet::new(),
            in_flight: HashSet::new(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.permits.available_permits() > 0
    }

    pub fn is_running(&self, id: &Uuid) -> bool {
        self.in_flight.contains(id)
    }

    pub fn running_jobs(&self) -> Vec<Uuid> {
        self.in_flight.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Start driving `job_id`. Returns false if the pool is full or the job
    /// is already running here.
    pub fn spawn(&mut self, job_id: Uuid, chain: ChainedExecutor, halt: CancellationToken) -> bool {
        if self.in_flight.contains(&job_id) {
            return false;
        }
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return false;
        };

        self.in_flight.insert(job_id);
        self.tasks.spawn(async move {
            let result = AssertUnwindSafe(chain.run(job_id, &halt))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(CubeForgeError::Internal(format!("chain for job {} panicked", job_id)))
                });
            drop(permit);
            (job_id, result)
        });
        tracing::debug!(job_id = %job_id, running = self.in_flight.len(), "Job dispatched");
        true
    }

    /// Wait for the next chain to end. `None` when nothing is running.
    pub async fn join_next(&mut self) -> Option<Completion> {
        loop {
            match self.tasks.join_next().await? {
                Ok((job_id, result)) => {
                    self.in_flight.remove(&job_id);
                    return Some((job_id, result));
                }
                // Tasks are never aborted and panics are caught inside them.
                Err(e) => tracing::error!(error = %e, "Job task failed to join"),
            }
        }
    }

    /// Wait for every running chain to end.
    pub async fn drain(&mut self) -> Vec<Completion> {
        let mut done = Vec::new();
        while let Some(completion) = self.join_next().await {
            done.push(completion);
        }
        done
    }
}
