//! Checkpoint persistence for plans, shards, and results.
//!
//! Every externally visible transition mirrors through a [`Checkpointer`]
//! before it takes effect, which is what lets the rehydrator recover an
//! interrupted plan. The engine mandates the interface, not the store
//! behind it; [`memory::InMemoryCheckpointer`] is the bundled
//! implementation.
//!
//! Ordering contract: checkpoint-before-consequence. A failed checkpoint
//! write aborts the triggering operation without advancing the externally
//! visible phase.

pub mod memory;

use async_trait::async_trait;

use hypshard_core::{PlanId, WorkerId};

use crate::error::Result;
use crate::plan::Plan;
use crate::shard::{ShardPhase, ShardResult, ShardSpec};

/// Outcome of a compare-and-swap on a shard's phase.
///
/// The CAS is the claim-exclusivity primitive: two workers racing for the
/// same shard see one `Swapped` and one `Mismatch`.
#[derive(Debug, Clone)]
pub enum CasOutcome {
    /// The phase matched and was swapped; carries the updated shard.
    Swapped(ShardSpec),
    /// The shard was in a different phase than expected.
    Mismatch {
        /// The phase actually observed.
        actual: ShardPhase,
    },
    /// No shard with that cas_id exists in the plan.
    Missing,
}

impl CasOutcome {
    /// Returns the updated shard if the swap happened.
    #[must_use]
    pub fn swapped(self) -> Option<ShardSpec> {
        match self {
            Self::Swapped(spec) => Some(spec),
            Self::Mismatch { .. } | Self::Missing => None,
        }
    }
}

/// Persists engine state so interrupted plans can be recovered.
///
/// Shards and results are keyed by `(plan_id, cas_id)`: cas_ids are
/// deliberately stable across plans, so the plan id disambiguates.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Persists a plan definition.
    async fn save_plan(&self, plan: &Plan) -> Result<()>;

    /// Loads a plan definition.
    async fn get_plan(&self, plan_id: PlanId) -> Result<Option<Plan>>;

    /// Lists all persisted plans.
    async fn list_plans(&self) -> Result<Vec<Plan>>;

    /// Persists a shard's current state, replacing any previous snapshot.
    async fn save_shard(&self, plan_id: PlanId, shard: &ShardSpec) -> Result<()>;

    /// Loads one shard of a plan.
    async fn get_shard(&self, plan_id: PlanId, cas_id: &str) -> Result<Option<ShardSpec>>;

    /// Loads every shard of a plan, ordered by cas_id.
    async fn get_shards_by_plan(&self, plan_id: PlanId) -> Result<Vec<ShardSpec>>;

    /// Loads a stage's shards, ordered by cas_id.
    async fn get_shards_by_stage(
        &self,
        plan_id: PlanId,
        stage_id: &str,
    ) -> Result<Vec<ShardSpec>>;

    /// Atomically transitions a shard from `expected` to `target`,
    /// recording `claimed_by` when provided.
    ///
    /// The swap validates the transition against the phase table; an
    /// invalid pair is an error, a lost race is a `Mismatch`.
    async fn cas_shard_phase(
        &self,
        plan_id: PlanId,
        cas_id: &str,
        expected: ShardPhase,
        target: ShardPhase,
        claimed_by: Option<WorkerId>,
    ) -> Result<CasOutcome>;

    /// Removes a shard from a plan. Used when hot-shard splitting
    /// replaces a pending shard with finer replacements.
    async fn remove_shard(&self, plan_id: PlanId, cas_id: &str) -> Result<()>;

    /// Appends a result attempt for a shard.
    async fn save_result(&self, plan_id: PlanId, result: &ShardResult) -> Result<()>;

    /// Loads every recorded attempt for a shard, in append order.
    async fn get_results(&self, plan_id: PlanId, cas_id: &str) -> Result<Vec<ShardResult>>;
}
