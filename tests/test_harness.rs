//! Test harness for multi-instance scheduler integration tests.
//!
//! Provides utilities for running several nodes against one shared store,
//! crashing or stopping them, and observing which one holds the lease.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cubeforge::config::{NodeConfig, WaitConfig};
use cubeforge::cube::{CubeDescriptor, CubeManager, EngineType};
use cubeforge::engine::{default_step_registry, BatchJobFactory};
use cubeforge::execution::{
    Output, StepContext, StepExecutor, StepKind, StepRegistry, StepResult,
};
use cubeforge::node::Node;
use cubeforge::scheduler::SchedulerState;
use cubeforge::store::{MemoryStore, MetadataStore, Versioned};
use cubeforge::CubeForgeError;

/// Node configuration with short intervals for faster tests
pub fn test_node_config(node_id: &str) -> NodeConfig {
    let mut config = NodeConfig::new(node_id)
        .with_pool_size(4)
        .with_poll_interval(Duration::from_millis(20))
        .with_lease_ttl(Duration::from_millis(300), Duration::from_millis(60))
        .with_wait(
            WaitConfig::default()
                .with_poll_interval(Duration::from_millis(20))
                .with_timeout(Duration::from_secs(10)),
        );
    config.scheduler.acquire_retry_ms = 30;
    config
}

pub async fn seed_cube(node: &Node, name: &str, engine: EngineType) {
    node.cubes()
        .create_cube(
            name,
            CubeDescriptor {
                partition_date_start: 0,
                engine,
            },
        )
        .await
        .unwrap();
}

/// Step body that counts invocations per kind and always succeeds
#[derive(Default)]
pub struct CountingStep {
    calls: std::sync::Mutex<HashMap<StepKind, usize>>,
    total: AtomicUsize,
}

impl CountingStep {
    pub fn calls(&self, kind: StepKind) -> usize {
        self.calls.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepExecutor for CountingStep {
    async fn execute(&self, ctx: &StepContext) -> cubeforge::Result<StepResult> {
        *self.calls.lock().unwrap().entry(ctx.step.kind).or_default() += 1;
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(StepResult::succeed(Output::with_log(ctx.step.name.clone())))
    }
}

/// Step body that blocks until released, so a test can act while a job is
/// mid-step
#[derive(Default)]
pub struct GateStep {
    entered: AtomicUsize,
    release: Notify,
}

impl GateStep {
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn open(&self) {
        self.release.notify_waiters();
    }
}

#[async_trait]
impl StepExecutor for GateStep {
    async fn execute(&self, ctx: &StepContext) -> cubeforge::Result<StepResult> {
        let released = self.release.notified();
        self.entered.fetch_add(1, Ordering::SeqCst);
        released.await;
        Ok(StepResult::succeed(Output::with_log(ctx.step.name.clone())))
    }
}

/// Step body that always reports an error
pub struct FailingStep;

#[async_trait]
impl StepExecutor for FailingStep {
    async fn execute(&self, _ctx: &StepContext) -> cubeforge::Result<StepResult> {
        Ok(StepResult::error("dictionary source table is empty"))
    }
}

/// Every simulated step of both engines routed to `counter`; the segment
/// status steps stay real
pub fn counting_steps(
    counter: Arc<CountingStep>,
) -> impl FnOnce(Arc<CubeManager>) -> StepRegistry {
    move |cubes| {
        let mut registry = default_step_registry(cubes, Duration::ZERO);
        for engine in [EngineType::Layered, EngineType::InMemory] {
            for step in BatchJobFactory::step_chain(engine) {
                if matches!(step, StepKind::ConvertToStorage | StepKind::UpdateCubeInfo) {
                    continue;
                }
                registry.register(*step, counter.clone());
            }
        }
        registry
    }
}

/// Like [`counting_steps`] with `kind` handled by `executor`
pub fn steps_with(
    counter: Arc<CountingStep>,
    kind: StepKind,
    executor: Arc<dyn StepExecutor>,
) -> impl FnOnce(Arc<CubeManager>) -> StepRegistry {
    let build = counting_steps(counter);
    move |cubes| {
        let mut registry = build(cubes);
        registry.register(kind, executor);
        registry
    }
}

/// Store whose `fail_on`-th write under `prefix` fails once with an IO
/// error; every other call goes straight to an in-memory store
pub struct FlakyStore {
    inner: MemoryStore,
    prefix: String,
    fail_on: usize,
    writes: AtomicUsize,
    failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(prefix: &str, fail_on: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            prefix: prefix.to_string(),
            fail_on,
            writes: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataStore for FlakyStore {
    async fn get(&self, key: &str) -> cubeforge::Result<Option<Versioned>> {
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_version: u64,
    ) -> cubeforge::Result<u64> {
        if key.starts_with(&self.prefix) && self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(CubeForgeError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "transient disk hiccup",
            )));
        }
        self.inner.put(key, value, expected_version).await
    }

    async fn delete(&self, key: &str, expected_version: u64) -> cubeforge::Result<()> {
        self.inner.delete(key, expected_version).await
    }

    async fn list_keys(&self, prefix: &str) -> cubeforge::Result<Vec<String>> {
        self.inner.list_keys(prefix).await
    }
}

/// Handle to a running test node
pub struct TestNode {
    pub node_id: String,
    pub node: Arc<Node>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<cubeforge::Result<()>>>,
}

impl TestNode {
    pub fn spawn(node: Node) -> Self {
        let node = Arc::new(node);
        let cancel = CancellationToken::new();
        let runner = node.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { runner.run(token).await });

        Self {
            node_id: node.config().scheduler.node_id.clone(),
            node,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn is_active(&self) -> bool {
        self.node.scheduler().state() == SchedulerState::Active
    }

    /// Ask the scheduler to shut down without waiting for it
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Graceful shutdown: in-flight chains stop after their step and the
    /// lease is released
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.unwrap().unwrap();
        }
    }

    /// Simulated crash: the task is aborted, nothing is released
    pub fn crash(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Test cluster of nodes sharing one in-memory store
pub struct TestCluster {
    pub store: Arc<dyn MetadataStore>,
    pub nodes: HashMap<String, TestNode>,
}

impl TestCluster {
    /// Create and start a cluster with n default nodes
    pub fn new(num_nodes: usize) -> Self {
        let mut cluster = Self::empty();
        for i in 0..num_nodes {
            cluster.start_node(&format!("node-{}", i + 1));
        }
        cluster
    }

    pub fn empty() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    /// A cluster with no nodes yet, sharing `store`
    pub fn with_store(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            nodes: HashMap::new(),
        }
    }

    /// A node wired to the shared store whose scheduler is not running;
    /// useful for submitting work before any instance is active
    pub fn client(&self, node_id: &str) -> Node {
        Node::with_store(test_node_config(node_id), self.store.clone())
    }

    pub fn start_node(&mut self, node_id: &str) -> Arc<Node> {
        let node = Node::with_store(test_node_config(node_id), self.store.clone());
        self.insert(TestNode::spawn(node))
    }

    pub fn start_node_with<F>(&mut self, node_id: &str, build_steps: F) -> Arc<Node>
    where
        F: FnOnce(Arc<CubeManager>) -> StepRegistry,
    {
        let node = Node::with_steps(test_node_config(node_id), self.store.clone(), build_steps);
        self.insert(TestNode::spawn(node))
    }

    fn insert(&mut self, node: TestNode) -> Arc<Node> {
        let handle = node.node.clone();
        self.nodes.insert(node.node_id.clone(), node);
        handle
    }

    pub fn get_node(&self, node_id: &str) -> Option<&Arc<Node>> {
        self.nodes.get(node_id).map(|n| &n.node)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.is_active())
            .map(|n| n.node_id.clone())
            .collect()
    }

    pub fn count_active(&self) -> usize {
        self.active_ids().len()
    }

    /// Wait until some node is ACTIVE and return its id
    pub async fn wait_for_active(&self, timeout_duration: Duration) -> Option<String> {
        let found = wait_for(
            || async { self.count_active() > 0 },
            timeout_duration,
            Duration::from_millis(10),
        )
        .await;
        if found {
            self.active_ids().into_iter().next()
        } else {
            None
        }
    }

    /// Wait for an ACTIVE node other than `excluded`
    pub async fn wait_for_new_active(
        &self,
        excluded: &str,
        timeout_duration: Duration,
    ) -> Option<String> {
        let found = wait_for(
            || async { self.active_ids().iter().any(|id| id != excluded) },
            timeout_duration,
            Duration::from_millis(10),
        )
        .await;
        if found {
            self.active_ids().into_iter().find(|id| id != excluded)
        } else {
            None
        }
    }

    pub async fn stop_node(&mut self, node_id: &str) -> bool {
        match self.nodes.remove(node_id) {
            Some(node) => {
                node.stop().await;
                true
            }
            None => false,
        }
    }

    pub fn crash_node(&mut self, node_id: &str) -> bool {
        match self.nodes.remove(node_id) {
            Some(node) => {
                node.crash();
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&mut self) {
        let ids: Vec<String> = self.nodes.keys().cloned().collect();
        for id in ids {
            self.stop_node(&id).await;
        }
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
