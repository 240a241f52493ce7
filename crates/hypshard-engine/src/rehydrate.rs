//! Startup recovery for interrupted plans.
//!
//! A process crash leaves shards checkpointed mid-flight (`Claimed`,
//! `Running`, or parked in `Retrying` between the requeue writes). The
//! rehydrator scans the store, finds plans that still have non-`Done`
//! shards, and resets their in-flight shards to `Pending`, discarding
//! stale claim ownership so a fresh worker pool can pick them up.
//! Completed shards and recorded results are left untouched.

use std::sync::Arc;

use hypshard_core::PlanId;

use crate::checkpoint::Checkpointer;
use crate::error::Result;
use crate::shard::ShardPhase;

/// Resets in-flight shards of interrupted plans back into scheduling.
pub struct Rehydrator {
    checkpointer: Arc<dyn Checkpointer>,
}

impl Rehydrator {
    /// Creates a rehydrator over a checkpoint store.
    #[must_use]
    pub fn new(checkpointer: Arc<dyn Checkpointer>) -> Self {
        Self { checkpointer }
    }

    /// Returns plans that have at least one non-`Done` shard.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn find_incomplete_plans(&self) -> Result<Vec<PlanId>> {
        let mut incomplete = Vec::new();
        for plan in self.checkpointer.list_plans().await? {
            let shards = self
                .checkpointer
                .get_shards_by_plan(plan.plan_id)
                .await?;
            if shards.iter().any(|s| s.phase != ShardPhase::Done) {
                incomplete.push(plan.plan_id);
            }
        }
        Ok(incomplete)
    }

    /// Resets every `Pending`, `Claimed`, `Running`, or `Retrying` shard
    /// of each incomplete plan to `Pending` and returns the affected plan
    /// ids. A `Retrying` shard walks the regular `Retrying -> Pending`
    /// edge so its attempt counter still bumps.
    ///
    /// # Errors
    ///
    /// Returns an error if store reads or shard writes fail; already
    /// reset shards stay reset.
    #[tracing::instrument(skip(self))]
    pub async fn rehydrate(&self) -> Result<Vec<PlanId>> {
        let incomplete = self.find_incomplete_plans().await?;
        for &plan_id in &incomplete {
            let shards = self.checkpointer.get_shards_by_plan(plan_id).await?;
            let mut reset = 0usize;
            for mut shard in shards {
                match shard.phase {
                    ShardPhase::Pending | ShardPhase::Claimed | ShardPhase::Running => {
                        shard.force_pending();
                        self.checkpointer.save_shard(plan_id, &shard).await?;
                        reset += 1;
                    }
                    // Crash between the failure and requeue writes: finish
                    // the walk so the shard re-enters scheduling.
                    ShardPhase::Retrying => {
                        shard.transition_to(ShardPhase::Pending)?;
                        self.checkpointer.save_shard(plan_id, &shard).await?;
                        reset += 1;
                    }
                    ShardPhase::Done | ShardPhase::Failed => {}
                }
            }
            tracing::info!(%plan_id, reset, "plan rehydrated");
        }
        Ok(incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::memory::InMemoryCheckpointer;
    use crate::executor::ExecutorKind;
    use crate::partition::PartitionerKind;
    use crate::plan::{Plan, PlanConstraints, Stage};
    use crate::shard::{ShardResult, ShardSpec};
    use hypshard_core::WorkerId;
    use serde_json::json;

    async fn seeded_store() -> (Arc<InMemoryCheckpointer>, PlanId, Vec<ShardSpec>) {
        let store = Arc::new(InMemoryCheckpointer::new());
        let plan = Plan::new(
            "interrupted",
            vec![Stage::new(
                "s1",
                "test",
                PartitionerKind::ByModule,
                ExecutorKind::PackBackend,
            )],
            PlanConstraints::default(),
            "tests",
        );
        store.save_plan(&plan).await.unwrap();

        let mut shards = Vec::new();
        for n in 0..4 {
            let shard =
                ShardSpec::new("s1", ExecutorKind::PackBackend, json!({"n": n}), vec![])
                    .unwrap();
            store.save_shard(plan.plan_id, &shard).await.unwrap();
            shards.push(shard);
        }
        (store, plan.plan_id, shards)
    }

    #[tokio::test]
    async fn resets_in_flight_shards_and_discards_claims() {
        let (store, plan_id, shards) = seeded_store().await;

        // Simulate a crash mid-execution: one claimed, one running, one done.
        let mut claimed = shards[1].clone();
        claimed.transition_to(ShardPhase::Claimed).unwrap();
        claimed.claimed_by = Some(WorkerId::generate());
        store.save_shard(plan_id, &claimed).await.unwrap();

        let mut running = shards[2].clone();
        running.transition_to(ShardPhase::Claimed).unwrap();
        running.transition_to(ShardPhase::Running).unwrap();
        store.save_shard(plan_id, &running).await.unwrap();

        let mut done = shards[3].clone();
        done.transition_to(ShardPhase::Claimed).unwrap();
        done.transition_to(ShardPhase::Running).unwrap();
        done.transition_to(ShardPhase::Done).unwrap();
        store.save_shard(plan_id, &done).await.unwrap();
        store
            .save_result(plan_id, &ShardResult::success(&done, "digest"))
            .await
            .unwrap();

        let rehydrator = Rehydrator::new(Arc::clone(&store) as Arc<dyn Checkpointer>);
        let recovered = rehydrator.rehydrate().await.unwrap();
        assert_eq!(recovered, vec![plan_id]);

        let after = store.get_shards_by_plan(plan_id).await.unwrap();
        for shard in &after {
            if shard.cas_id == done.cas_id {
                assert_eq!(shard.phase, ShardPhase::Done);
            } else {
                assert_eq!(shard.phase, ShardPhase::Pending);
                assert!(shard.claimed_by.is_none());
            }
        }

        // Completed results survive rehydration.
        let results = store.get_results(plan_id, &done.cas_id).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn shard_parked_mid_retry_requeues_with_attempt_bump() {
        let (store, plan_id, shards) = seeded_store().await;

        // Crash landed between the Failed -> Retrying and
        // Retrying -> Pending checkpoint writes.
        let mut parked = shards[0].clone();
        parked.transition_to(ShardPhase::Claimed).unwrap();
        parked.transition_to(ShardPhase::Running).unwrap();
        parked.transition_to(ShardPhase::Failed).unwrap();
        parked.transition_to(ShardPhase::Retrying).unwrap();
        store.save_shard(plan_id, &parked).await.unwrap();

        let rehydrator = Rehydrator::new(Arc::clone(&store) as Arc<dyn Checkpointer>);
        rehydrator.rehydrate().await.unwrap();

        let after = store
            .get_shard(plan_id, &parked.cas_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.phase, ShardPhase::Pending);
        assert_eq!(after.attempt, 2);
        assert!(after.claimed_by.is_none());
    }

    #[tokio::test]
    async fn fully_complete_plans_are_left_alone() {
        let store = Arc::new(InMemoryCheckpointer::new());
        let plan = Plan::new(
            "done",
            vec![Stage::new(
                "s1",
                "test",
                PartitionerKind::ByModule,
                ExecutorKind::PackBackend,
            )],
            PlanConstraints::default(),
            "tests",
        );
        store.save_plan(&plan).await.unwrap();

        let mut shard =
            ShardSpec::new("s1", ExecutorKind::PackBackend, json!({}), vec![]).unwrap();
        shard.transition_to(ShardPhase::Claimed).unwrap();
        shard.transition_to(ShardPhase::Running).unwrap();
        shard.transition_to(ShardPhase::Done).unwrap();
        store.save_shard(plan.plan_id, &shard).await.unwrap();

        let rehydrator = Rehydrator::new(Arc::clone(&store) as Arc<dyn Checkpointer>);
        assert!(rehydrator.rehydrate().await.unwrap().is_empty());
    }
}
