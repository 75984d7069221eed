use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::execution::{ExecutableState, Output, Step, StepKind};

/// What a step body sees when it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job_id: Uuid,
    pub job_params: BTreeMap<String, String>,
    pub step: Step,
    /// The step was found RUNNING when the chain started, i.e. an earlier
    /// run was interrupted part-way through it.
    pub resumed: bool,
}

impl StepContext {
    pub fn job_param(&self, key: &str) -> Option<&str> {
        self.job_params.get(key).map(String::as_str)
    }
}

/// Result of running one step body.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub status: ExecutableState,
    pub output: Output,
}

impl StepResult {
    pub fn succeed(output: Output) -> Self {
        Self {
            status: ExecutableState::Succeed,
            output,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ExecutableState::Error,
            output: Output::with_error(message),
        }
    }
}

/// A step body. Implementations must tolerate being invoked again after a
/// resume, including when a previous invocation already did part or all of
/// the work.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, ctx: &StepContext) -> Result<StepResult>;
}

/// Step bodies keyed by [`StepKind`].
#[derive(Clone, Default)]
pub struct StepRegistry {
    executors: HashMap<StepKind, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the body for `kind`.
    pub fn register(&mut self, kind: StepKind, executor: Arc<dyn StepExecutor>) -> &mut Self {
        self.executors.insert(kind, executor);
        self
    }

    pub fn with(mut self, kind: StepKind, executor: Arc<dyn StepExecutor>) -> Self {
        self.register(kind, executor);
        self
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn contains(&self, kind: StepKind) -> bool {
        self.executors.contains_key(&kind)
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("kinds", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl StepExecutor for Echo {
        async fn execute(&self, ctx: &StepContext) -> Result<StepResult> {
            Ok(StepResult::succeed(Output::with_log(ctx.step.name.clone())))
        }
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = StepRegistry::new().with(StepKind::BuildDictionary, Arc::new(Echo));
        assert!(registry.contains(StepKind::BuildDictionary));
        assert!(registry.get(StepKind::ConvertToStorage).is_none());

        let ctx = StepContext {
            job_id: Uuid::new_v4(),
            job_params: BTreeMap::new(),
            step: Step::new(0, StepKind::BuildDictionary),
            resumed: false,
        };
        let result = registry
            .get(StepKind::BuildDictionary)
            .unwrap()
            .execute(&ctx)
            .await
            .unwrap();
        assert_eq!(result.status, ExecutableState::Succeed);
        assert_eq!(result.output.log, "Build Dimension Dictionary");
    }

    #[test]
    fn test_step_result_error_carries_message() {
        let result = StepResult::error("exit code 2");
        assert_eq!(result.status, ExecutableState::Error);
        assert_eq!(result.output.error.as_deref(), Some("exit code 2"));
    }
}
