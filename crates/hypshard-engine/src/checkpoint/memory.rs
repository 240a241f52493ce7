//! In-memory checkpointer.
//!
//! Reference implementation of the [`Checkpointer`] contract, used by
//! tests and single-process deployments. State lives behind a single
//! `tokio::sync::RwLock`; shard maps are `BTreeMap` so listing order is
//! deterministic.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use hypshard_core::{PlanId, WorkerId};

use crate::error::{Error, Result};
use crate::plan::Plan;
use crate::shard::{ShardPhase, ShardResult, ShardSpec};

use super::{CasOutcome, Checkpointer};

#[derive(Default)]
struct Inner {
    plans: BTreeMap<PlanId, Plan>,
    /// plan -> cas_id -> latest shard snapshot.
    shards: HashMap<PlanId, BTreeMap<String, ShardSpec>>,
    /// (plan, cas_id) -> append-only attempt log.
    results: HashMap<(PlanId, String), Vec<ShardResult>>,
}

/// Checkpointer backed by process memory.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    inner: RwLock<Inner>,
    /// Writes left to fail, for fault-injection tests.
    fail_writes: AtomicU32,
}

impl InMemoryCheckpointer {
    /// Creates an empty checkpointer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` write operations fail with `CheckpointWrite`.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        let remaining = self.fail_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::checkpoint("injected write failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn save_plan(&self, plan: &Plan) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        inner.plans.insert(plan.plan_id, plan.clone());
        Ok(())
    }

    async fn get_plan(&self, plan_id: PlanId) -> Result<Option<Plan>> {
        let inner = self.inner.read().await;
        Ok(inner.plans.get(&plan_id).cloned())
    }

    async fn list_plans(&self) -> Result<Vec<Plan>> {
        let inner = self.inner.read().await;
        Ok(inner.plans.values().cloned().collect())
    }

    async fn save_shard(&self, plan_id: PlanId, shard: &ShardSpec) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        inner
            .shards
            .entry(plan_id)
            .or_default()
            .insert(shard.cas_id.clone(), shard.clone());
        Ok(())
    }

    async fn get_shard(&self, plan_id: PlanId, cas_id: &str) -> Result<Option<ShardSpec>> {
        let inner = self.inner.read().await;
        Ok(inner
            .shards
            .get(&plan_id)
            .and_then(|m| m.get(cas_id))
            .cloned())
    }

    async fn get_shards_by_plan(&self, plan_id: PlanId) -> Result<Vec<ShardSpec>> {
        let inner = self.inner.read().await;
        Ok(inner
            .shards
            .get(&plan_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_shards_by_stage(
        &self,
        plan_id: PlanId,
        stage_id: &str,
    ) -> Result<Vec<ShardSpec>> {
        let inner = self.inner.read().await;
        Ok(inner
            .shards
            .get(&plan_id)
            .map(|m| {
                m.values()
                    .filter(|s| s.stage_id == stage_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn cas_shard_phase(
        &self,
        plan_id: PlanId,
        cas_id: &str,
        expected: ShardPhase,
        target: ShardPhase,
        claimed_by: Option<WorkerId>,
    ) -> Result<CasOutcome> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        let Some(shard) = inner
            .shards
            .get_mut(&plan_id)
            .and_then(|m| m.get_mut(cas_id))
        else {
            return Ok(CasOutcome::Missing);
        };

        if shard.phase != expected {
            return Ok(CasOutcome::Mismatch {
                actual: shard.phase,
            });
        }

        shard.transition_to(target)?;
        if claimed_by.is_some() {
            shard.claimed_by = claimed_by;
        }
        Ok(CasOutcome::Swapped(shard.clone()))
    }

    async fn remove_shard(&self, plan_id: PlanId, cas_id: &str) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        if let Some(shards) = inner.shards.get_mut(&plan_id) {
            shards.remove(cas_id);
        }
        Ok(())
    }

    async fn save_result(&self, plan_id: PlanId, result: &ShardResult) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        inner
            .results
            .entry((plan_id, result.cas_id.clone()))
            .or_default()
            .push(result.clone());
        Ok(())
    }

    async fn get_results(&self, plan_id: PlanId, cas_id: &str) -> Result<Vec<ShardResult>> {
        let inner = self.inner.read().await;
        Ok(inner
            .results
            .get(&(plan_id, cas_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
