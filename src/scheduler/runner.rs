use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{CubeForgeError, Result};
use crate::execution::{ChainOutcome, ChainedExecutor, ExecutableState};
use crate::lease::{jittered, Lease};
use crate::registry::{JobEvent, JobRegistry};
use crate::scheduler::{Completion, DispatchQueue, SchedulerState, WorkerPool};

const RENEW_ATTEMPTS: u32 = 3;
const RENEW_BACKOFF_MS: u64 = 50;

/// Why an ACTIVE term ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TermEnd {
    Shutdown,
    LeaseLost,
}

/// One scheduler instance.
///
/// Runs `STOPPED -> STARTING -> ACTIVE` while it holds the lease and falls
/// back to STOPPED when the lease is lost. Several instances may run against
/// one store; only the lease holder dispatches.
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<JobRegistry>,
    chain: ChainedExecutor,
    lease: Arc<dyn Lease>,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<JobRegistry>,
        chain: ChainedExecutor,
        lease: Arc<dyn Lease>,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Stopped);
        Self {
            config,
            registry,
            chain,
            lease,
            state,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    fn set_state(&self, to: SchedulerState) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::info!(node_id = %self.config.node_id, from = %from, to = %to, "Scheduler state changed");
        }
    }

    /// Compete for the lease and dispatch while holding it, until `cancel`
    /// fires. On return the lease has been released and every chain this
    /// instance started has stopped.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            node_id = %self.config.node_id,
            pool_size = self.config.pool_size,
            "Scheduler starting"
        );

        while !cancel.is_cancelled() {
            let acquired = tokio::select! {
                _ = cancel.cancelled() => break,
                acquired = self.lease.acquire(self.config.lease_ttl()) => acquired,
            };

            match acquired {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(node_id = %self.config.node_id, "Lease held elsewhere");
                    self.idle(&cancel).await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(node_id = %self.config.node_id, error = %e, "Lease acquisition failed");
                    self.idle(&cancel).await;
                    continue;
                }
            }

            let end = self.lead(&cancel).await;
            self.set_state(SchedulerState::Stopped);
            if end == TermEnd::Shutdown {
                break;
            }
        }

        if let Err(e) = self.lease.release().await {
            tracing::warn!(node_id = %self.config.node_id, error = %e, "Failed to release lease");
        }
        self.set_state(SchedulerState::Stopped);
        tracing::info!(node_id = %self.config.node_id, "Scheduler stopped");
        Ok(())
    }

    async fn idle(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(jittered(self.config.acquire_retry())) => {}
        }
    }

    /// One term as lease holder: recover, then dispatch until the lease is
    /// lost or shutdown is requested, then wait for in-flight chains.
    async fn lead(&self, cancel: &CancellationToken) -> TermEnd {
        self.set_state(SchedulerState::Starting);

        // Fires when this term ends; chains stop before their next step.
        let halt = CancellationToken::new();
        let mut queue = DispatchQueue::with_capacity(self.config.max_queued_jobs);
        let mut pool = WorkerPool::new(self.config.pool_size);
        // Jobs whose chain failed on a store error while still RUNNING here.
        let mut redrive: HashSet<Uuid> = HashSet::new();
        let mut events = self.registry.subscribe();
        let mut held = self.lease.subscribe();

        match self.scan(&mut queue, &pool, true).await {
            Ok(found) => {
                tracing::info!(node_id = %self.config.node_id, jobs = found, "Recovered persisted jobs");
            }
            Err(e) => {
                // The periodic scan catches up on READY jobs.
                tracing::warn!(node_id = %self.config.node_id, error = %e, "Recovery scan failed");
            }
        }
        self.set_state(SchedulerState::Active);

        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let renew_every = self.config.lease_renew_interval();
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let end = loop {
            if let Err(e) = self.dispatch(&mut queue, &mut pool, &halt).await {
                if matches!(e, CubeForgeError::LeaseLost(_)) {
                    break TermEnd::LeaseLost;
                }
                tracing::warn!(error = %e, "Dispatch failed");
            }

            tokio::select! {
                _ = cancel.cancelled() => break TermEnd::Shutdown,

                _ = renew.tick() => {
                    if let Err(e) = self.renew_lease().await {
                        tracing::warn!(node_id = %self.config.node_id, error = %e, "Stepping down");
                        break TermEnd::LeaseLost;
                    }
                }

                changed = held.changed() => {
                    if changed.is_err() || !*held.borrow() {
                        break TermEnd::LeaseLost;
                    }
                }

                _ = poll.tick() => {
                    Self::requeue(&mut redrive, &mut queue, &pool);
                    if let Err(e) = self.scan(&mut queue, &pool, false).await {
                        tracing::warn!(error = %e, "Job scan failed");
                    }
                }

                event = events.recv() => match event {
                    Ok(JobEvent { job_id, status: ExecutableState::Ready }) => {
                        if !pool.is_running(&job_id) && !queue.push(job_id) {
                            tracing::warn!(job_id = %job_id, "Dispatch queue at capacity, job left for next scan");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Job events lagged, next scan catches up");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events = self.registry.subscribe();
                    }
                },

                Some(completion) = pool.join_next(), if !pool.is_empty() => {
                    Self::log_completion(&completion);
                    match completion {
                        (_, Err(CubeForgeError::JobNotFound(_))) => {}
                        (job_id, Err(_)) => {
                            redrive.insert(job_id);
                        }
                        _ => {}
                    }
                }
            }
        };

        halt.cancel();
        queue.clear();
        if !pool.is_empty() {
            tracing::info!(
                node_id = %self.config.node_id,
                jobs = ?pool.running_jobs(),
                reason = ?end,
                "Waiting for in-flight jobs to stop"
            );
        }
        for completion in pool.drain().await {
            Self::log_completion(&completion);
        }
        end
    }

    /// Queue runnable jobs found in the registry. At startup RUNNING jobs
    /// are taken too: they were left behind by a previous holder.
    async fn scan(&self, queue: &mut DispatchQueue, pool: &WorkerPool, recovering: bool) -> Result<usize> {
        let mut found = 0;
        for id in self.registry.list_ids().await? {
            if pool.is_running(&id) || queue.contains(&id) {
                continue;
            }
            let job = match self.registry.get(&id).await {
                Ok(job) => job,
                Err(CubeForgeError::JobNotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            let runnable = match job.status {
                ExecutableState::Ready => true,
                ExecutableState::Running => recovering,
                _ => false,
            };
            if !runnable {
                continue;
            }
            if !queue.push(id) {
                tracing::warn!(queued = queue.len(), "Dispatch queue at capacity, deferring scan");
                break;
            }
            if job.status == ExecutableState::Running {
                tracing::info!(job_id = %id, name = %job.name, "Resuming job left RUNNING");
            }
            found += 1;
        }
        Ok(found)
    }

    /// Queue jobs whose chain failed earlier in this term. The chain picks up
    /// from the persisted step statuses; a job that has since finished is
    /// skipped.
    fn requeue(redrive: &mut HashSet<Uuid>, queue: &mut DispatchQueue, pool: &WorkerPool) {
        redrive.retain(|id| {
            if pool.is_running(id) || queue.contains(id) {
                return false;
            }
            if !queue.push(*id) {
                return true;
            }
            tracing::info!(job_id = %id, "Re-driving job after failed chain");
            false
        });
    }

    /// Hand queued jobs to free workers, after confirming the lease is still
    /// ours.
    async fn dispatch(
        &self,
        queue: &mut DispatchQueue,
        pool: &mut WorkerPool,
        halt: &CancellationToken,
    ) -> Result<()> {
        if queue.is_empty() || !pool.has_capacity() {
            return Ok(());
        }
        if !self.lease.is_held().await {
            return Err(CubeForgeError::LeaseLost(self.config.node_id.clone()));
        }

        while pool.has_capacity() {
            let Some(job_id) = queue.pop() else {
                break;
            };
            if !pool.spawn(job_id, self.chain.clone(), halt.clone()) {
                tracing::debug!(job_id = %job_id, "Job already running on this instance");
            }
        }
        Ok(())
    }

    /// Renew, retrying transient store errors with backoff. A lost lease is
    /// not retried.
    async fn renew_lease(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.lease.renew().await {
                Ok(()) => return Ok(()),
                Err(e @ CubeForgeError::LeaseLost(_)) => return Err(e),
                Err(e) if attempt + 1 >= RENEW_ATTEMPTS => return Err(e),
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "Lease renewal failed, retrying");
                    tokio::time::sleep(Duration::from_millis(RENEW_BACKOFF_MS * 2_u64.pow(attempt)))
                        .await;
                }
            }
        }
    }

    fn log_completion(completion: &Completion) {
        let (job_id, result) = completion;
        match result {
            Ok(ChainOutcome::Finished(status)) => {
                tracing::debug!(job_id = %job_id, status = %status, "Chain finished");
            }
            Ok(ChainOutcome::Halted) => {
                tracing::info!(job_id = %job_id, "Chain halted, job left RUNNING for the next holder");
            }
            Ok(ChainOutcome::Interrupted(status)) => {
                tracing::info!(job_id = %job_id, status = %status, "Chain interrupted");
            }
            Ok(ChainOutcome::Skipped(status)) => {
                tracing::debug!(job_id = %job_id, status = %status, "Job not runnable, skipped");
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Chain aborted");
            }
        }
    }
}
