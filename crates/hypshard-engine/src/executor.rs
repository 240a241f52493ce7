//! Shard executors.
//!
//! Executors perform the actual unit of work for a shard. They are opaque
//! to the engine: bound by kind at stage parse, possibly long-running, and
//! idempotent across retries of the same cas_id (only `attempt` varies).
//! Executor failures are recorded as failed results by the orchestrator,
//! never raised to submitters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use hypshard_core::canonical_json;

use crate::error::{Error, Result};
use crate::shard::{ShardResult, ShardSpec};

/// Available executor bindings, resolved at stage parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Package backend artifacts.
    PackBackend,
    /// Warm a container registry.
    WarmRegistry,
    /// Index static assets.
    IndexAssets,
    /// Prime downstream caches.
    PrimeCaches,
    /// Rebuild documentation indexes.
    DocsIndex,
    /// Apply SQL migration batches.
    SqlMigrate,
}

impl ExecutorKind {
    /// All executor kinds, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::PackBackend,
        Self::WarmRegistry,
        Self::IndexAssets,
        Self::PrimeCaches,
        Self::DocsIndex,
        Self::SqlMigrate,
    ];

    /// Returns the wire name of this executor.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PackBackend => "pack_backend",
            Self::WarmRegistry => "warm_registry",
            Self::IndexAssets => "index_assets",
            Self::PrimeCaches => "prime_caches",
            Self::DocsIndex => "docs_index",
            Self::SqlMigrate => "sql_migrate",
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Performs the unit of work for a shard.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executes the shard and reports its outcome.
    ///
    /// A failed unit of work is a `ShardResult` with `success = false`;
    /// `Err` is reserved for infrastructure problems (the orchestrator
    /// records those as failed attempts too).
    ///
    /// # Errors
    ///
    /// Returns an error when execution could not be attempted at all.
    async fn execute(&self, spec: &ShardSpec) -> Result<ShardResult>;
}

/// Executor bindings for a running orchestrator.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    bindings: HashMap<ExecutorKind, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds an executor implementation to a kind, replacing any previous
    /// binding.
    pub fn register(&mut self, kind: ExecutorKind, executor: Arc<dyn Executor>) {
        self.bindings.insert(kind, executor);
    }

    /// Resolves the executor bound to a kind.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStrategy` if no executor is bound.
    pub fn get(&self, kind: ExecutorKind) -> Result<Arc<dyn Executor>> {
        self.bindings
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::UnknownStrategy {
                registry: "executor",
                name: kind.as_str().to_string(),
            })
    }

    /// Registry with the simulated executor bound to every kind.
    #[must_use]
    pub fn simulated() -> Self {
        let sim: Arc<dyn Executor> = Arc::new(SimulatedExecutor::new());
        let mut registry = Self::new();
        for kind in ExecutorKind::ALL {
            registry.register(kind, Arc::clone(&sim));
        }
        registry
    }

    /// Registry with one shared executor bound to every kind.
    #[must_use]
    pub fn uniform(executor: Arc<dyn Executor>) -> Self {
        let mut registry = Self::new();
        for kind in ExecutorKind::ALL {
            registry.register(kind, Arc::clone(&executor));
        }
        registry
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.bindings.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("ExecutorRegistry")
            .field("bound", &kinds)
            .finish()
    }
}

/// Deterministic executor for tests and dry runs.
///
/// Produces an output digest derived from the shard identity and inputs,
/// so repeated runs of the same shard agree. Failure injection fails the
/// first `n` attempts of a given cas_id, then succeeds.
#[derive(Debug, Default)]
pub struct SimulatedExecutor {
    delay: Option<Duration>,
    fail_budget: Mutex<HashMap<String, u32>>,
}

impl SimulatedExecutor {
    /// Creates a simulated executor with no delay and no injected failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fixed per-shard execution delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fails the first `attempts` executions of `cas_id`, then succeeds.
    pub fn fail_first_attempts(&self, cas_id: impl Into<String>, attempts: u32) {
        if let Ok(mut budget) = self.fail_budget.lock() {
            budget.insert(cas_id.into(), attempts);
        }
    }

    fn should_fail(&self, cas_id: &str) -> bool {
        let Ok(mut budget) = self.fail_budget.lock() else {
            return false;
        };
        match budget.get_mut(cas_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn output_digest(spec: &ShardSpec) -> Result<String> {
        let input_bytes = canonical_json::to_canonical_bytes(&spec.inputs)?;
        let mut hasher = Sha256::new();
        hasher.update(spec.cas_id.as_bytes());
        hasher.update(b"|");
        hasher.update(&input_bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn execute(&self, spec: &ShardSpec) -> Result<ShardResult> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.should_fail(&spec.cas_id) {
            return Ok(ShardResult::failure(spec, "injected failure"));
        }

        let digest = Self::output_digest(spec)?;
        Ok(ShardResult::success(spec, digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> ShardSpec {
        ShardSpec::new("stage", ExecutorKind::PackBackend, json!({"a": 1}), vec![]).unwrap()
    }

    #[tokio::test]
    async fn simulated_executor_is_deterministic() {
        let exec = SimulatedExecutor::new();
        let spec = spec();
        let a = exec.execute(&spec).await.unwrap();
        let b = exec.execute(&spec).await.unwrap();
        assert!(a.success);
        assert_eq!(a.output_digest, b.output_digest);
        assert_eq!(a.output_digest.len(), 64);
    }

    #[tokio::test]
    async fn failure_injection_exhausts_then_succeeds() {
        let exec = SimulatedExecutor::new();
        let spec = spec();
        exec.fail_first_attempts(&spec.cas_id, 2);

        let first = exec.execute(&spec).await.unwrap();
        let second = exec.execute(&spec).await.unwrap();
        let third = exec.execute(&spec).await.unwrap();
        assert!(!first.success);
        assert!(!second.success);
        assert!(third.success);
        assert_eq!(first.error.as_deref(), Some("injected failure"));
    }

    #[tokio::test]
    async fn registry_resolves_bound_kinds() {
        let registry = ExecutorRegistry::simulated();
        for kind in ExecutorKind::ALL {
            assert!(registry.get(kind).is_ok());
        }
    }

    #[test]
    fn unbound_kind_is_unknown_strategy() {
        let registry = ExecutorRegistry::new();
        let err = registry.get(ExecutorKind::SqlMigrate);
        assert!(matches!(err, Err(Error::UnknownStrategy { .. })));
    }
}
