use std::path::PathBuf;
use std::time::Duration;

/// Where job, cube and lease documents are persisted.
///
/// With no `data_dir` everything lives in memory and is lost on exit, which
/// is what tests and single-process demos want.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Directory holding one JSON document per key.
    pub data_dir: Option<PathBuf>,
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self { data_dir: None }
    }

    pub fn on_disk(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
        }
    }
}

/// Scheduler instance tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identity written into the lease record.
    pub node_id: String,
    /// Maximum number of jobs driven concurrently by this instance.
    pub pool_size: usize,
    /// Dispatch loop period.
    pub poll_interval_ms: u64,
    /// Lifetime of the cluster-wide lease after each acquire/renew.
    pub lease_ttl_ms: u64,
    /// How often the active instance renews. Must be well below the TTL.
    pub lease_renew_interval_ms: u64,
    /// Delay between acquisition attempts while STOPPED.
    pub acquire_retry_ms: u64,
    /// Bound on jobs waiting for a free worker slot.
    pub max_queued_jobs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_id: "scheduler-1".to_string(),
            pool_size: 4,
            poll_interval_ms: 500,
            lease_ttl_ms: 10_000,
            lease_renew_interval_ms: 3_000,
            acquire_retry_ms: 1_000,
            max_queued_jobs: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lease_renew_interval_ms)
    }

    pub fn acquire_retry(&self) -> Duration {
        Duration::from_millis(self.acquire_retry_ms)
    }
}

/// Caller-side wait for a job to reach a final status.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Fallback re-read period when no status event arrives.
    pub poll_interval_ms: u64,
    /// Give up after this long. `None` waits until cancelled.
    pub timeout_ms: Option<u64>,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            timeout_ms: None,
        }
    }
}

impl WaitConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Default step bodies.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// How long each simulated data-processing step takes.
    pub step_delay_ms: u64,
}

impl EngineConfig {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub wait: WaitConfig,
    pub engine: EngineConfig,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            scheduler: SchedulerConfig {
                node_id: node_id.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.store = StoreConfig::on_disk(data_dir);
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.scheduler.pool_size = pool_size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.scheduler.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration, renew_every: Duration) -> Self {
        self.scheduler.lease_ttl_ms = ttl.as_millis() as u64;
        self.scheduler.lease_renew_interval_ms = renew_every.as_millis() as u64;
        self
    }

    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.engine.step_delay_ms = delay.as_millis() as u64;
        self
    }
}
