//! Plan orchestration.
//!
//! The orchestrator owns a plan's stage graph and drives it end to end:
//! partitioning ready stages into shards, mediating worker claims through
//! each stage's scheduler, recording results, feeding the Merkle
//! aggregator, and deriving live status. It is an explicit context
//! object; construct as many independent orchestrators as needed.
//!
//! Every phase transition checkpoints before it becomes externally
//! visible, so a crashed process can be rehydrated from the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use hypshard_core::{PlanId, WorkerId};

use crate::checkpoint::{CasOutcome, Checkpointer};
use crate::dag::StageGraph;
use crate::error::{Error, Result};
use crate::executor::ExecutorRegistry;
use crate::merkle::{MerkleProof, MerkleTree};
use crate::metrics::EngineMetrics;
use crate::plan::{
    AutotuneSignal, Plan, PlanState, PlanStatus, SignalType, Stage, StageState,
};
use crate::schedule::{ShardScheduler, WorkerState};
use crate::shard::{ShardPhase, ShardResult, ShardSpec};

/// Poll interval for idle workers and the timebox sweep.
const SWEEP_INTERVAL: Duration = Duration::from_millis(20);

/// Fraction of the timebox after which a `TimeoutRisk` signal fires.
const TIMEOUT_RISK_FRACTION: f64 = 0.8;

/// Inputs handed to an external certifier.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificationSummary {
    /// The plan being certified.
    pub plan_id: PlanId,
    /// Merkle root over the completed result set.
    pub merkle_root: String,
    /// Total shards in the plan.
    pub total_shards: usize,
    /// Shards that completed successfully.
    pub done_shards: usize,
}

/// External certification authority, consulted as a boolean gate once a
/// plan completes. No certifier configured means `truth_certified` stays
/// false; completion is never blocked on certification.
#[async_trait]
pub trait Certifier: Send + Sync {
    /// Returns whether the authority vouches for the result set.
    ///
    /// # Errors
    ///
    /// Returns an error if the authority cannot be consulted; the plan
    /// still completes uncertified.
    async fn certify(&self, summary: &CertificationSummary) -> Result<bool>;
}

/// Per-plan in-memory state. Authoritative shard state lives in the
/// checkpointer; this holds what is derived or transient.
struct PlanRuntime {
    plan: Plan,
    graph: StageGraph,
    stage_states: HashMap<String, StageState>,
    schedulers: HashMap<String, Box<dyn ShardScheduler>>,
    merkle: MerkleTree,
    plan_state: PlanState,
    truth_certified: bool,
    completed_at: Option<DateTime<Utc>>,
    signals: Vec<AutotuneSignal>,
    done_durations_secs: Vec<f64>,
    timeout_warned: bool,
}

impl PlanRuntime {
    fn new(plan: Plan, graph: StageGraph) -> Self {
        let roots = graph.roots();
        let mut stage_states = HashMap::with_capacity(plan.stages.len());
        let mut schedulers = HashMap::with_capacity(plan.stages.len());
        for stage in &plan.stages {
            let state = if roots.contains(&stage.id) {
                StageState::Ready
            } else {
                StageState::NotReady
            };
            stage_states.insert(stage.id.clone(), state);
            schedulers.insert(stage.id.clone(), stage.scheduler.build());
        }
        Self {
            plan,
            graph,
            stage_states,
            schedulers,
            merkle: MerkleTree::new(),
            plan_state: PlanState::Running,
            truth_certified: false,
            completed_at: None,
            signals: Vec::new(),
            done_durations_secs: Vec::new(),
            timeout_warned: false,
        }
    }

    /// Promotes `NotReady` stages whose dependencies have all completed.
    /// Returns the newly ready stage ids.
    fn refresh_ready(&mut self) -> Vec<String> {
        let mut newly_ready = Vec::new();
        let candidates: Vec<String> = self
            .stage_states
            .iter()
            .filter(|(_, state)| **state == StageState::NotReady)
            .map(|(id, _)| id.clone())
            .collect();

        for stage_id in candidates {
            let deps = match self.graph.dependencies_of(&stage_id) {
                Ok(deps) => deps,
                Err(_) => continue,
            };
            let all_complete = deps
                .iter()
                .all(|d| self.stage_states.get(d) == Some(&StageState::Complete));
            if all_complete {
                self.stage_states
                    .insert(stage_id.clone(), StageState::Ready);
                newly_ready.push(stage_id);
            }
        }
        newly_ready
    }

    fn all_stages_complete(&self) -> bool {
        self.stage_states
            .values()
            .all(|s| *s == StageState::Complete)
    }

    fn mark_aborted(&mut self) {
        for state in self.stage_states.values_mut() {
            if *state != StageState::Complete {
                *state = StageState::Aborted;
            }
        }
        self.plan_state = PlanState::Aborted;
        self.completed_at = Some(Utc::now());
    }

    fn push_signal(
        &mut self,
        stage_id: &str,
        signal_type: SignalType,
        metric_value: f64,
        suggested_action: &str,
    ) {
        self.signals.push(AutotuneSignal {
            plan_id: self.plan.plan_id,
            stage_id: stage_id.to_string(),
            signal_type,
            metric_value,
            timestamp: Utc::now(),
            suggested_action: suggested_action.to_string(),
        });
    }

    #[allow(clippy::cast_precision_loss)]
    fn eta_seconds(&self, total: usize, done: usize) -> Option<f64> {
        if self.plan_state != PlanState::Running || self.done_durations_secs.is_empty() {
            return None;
        }
        let avg = self.done_durations_secs.iter().sum::<f64>()
            / self.done_durations_secs.len() as f64;
        Some(total.saturating_sub(done) as f64 * avg)
    }
}

/// Drives plans from submission to a certified Merkle root.
pub struct Orchestrator {
    checkpointer: Arc<dyn Checkpointer>,
    executors: ExecutorRegistry,
    certifier: Option<Arc<dyn Certifier>>,
    metrics: EngineMetrics,
    /// Per-plan runtimes behind individual locks, so claims and results
    /// for one plan never contend with another plan's. The registry lock
    /// is held only for lookup and insertion; store-level CAS provides
    /// shard exclusivity.
    state: RwLock<HashMap<PlanId, Arc<Mutex<PlanRuntime>>>>,
}

impl Orchestrator {
    /// Creates an orchestrator over a checkpoint store and executor
    /// bindings.
    #[must_use]
    pub fn new(
        checkpointer: Arc<dyn Checkpointer>,
        executors: ExecutorRegistry,
        certifier: Option<Arc<dyn Certifier>>,
    ) -> Self {
        Self {
            checkpointer,
            executors,
            certifier,
            metrics: EngineMetrics::new(),
            state: RwLock::new(HashMap::new()),
        }
    }

    async fn runtime_handle(&self, plan_id: PlanId) -> Option<Arc<Mutex<PlanRuntime>>> {
        self.state.read().await.get(&plan_id).cloned()
    }

    async fn insert_runtime(&self, plan_id: PlanId, runtime: PlanRuntime) {
        self.state
            .write()
            .await
            .insert(plan_id, Arc::new(Mutex::new(runtime)));
    }

    fn note_error(&self, err: &Error) {
        if matches!(err, Error::CheckpointWrite { .. }) {
            self.metrics.record_checkpoint_write_failure();
        }
    }

    /// Validates and accepts a plan, partitioning its dependency-free
    /// stages. Returns as soon as initial shards are checkpointed;
    /// execution proceeds through claims.
    ///
    /// # Errors
    ///
    /// Returns `PlanValidation` for a cyclic or dangling stage graph and
    /// `CapacityExceeded` when an initial stage partitions into more than
    /// `max_shards` shards (the plan is recorded as aborted and any shards
    /// already checkpointed for sibling stages are failed).
    #[tracing::instrument(skip(self, plan), fields(plan_id = %plan.plan_id, name = %plan.name))]
    pub async fn submit_plan(&self, plan: Plan) -> Result<PlanId> {
        let graph = plan.validate()?;
        self.checkpointer.save_plan(&plan).await?;
        self.metrics.plan_started();

        let plan_id = plan.plan_id;
        let mut runtime = PlanRuntime::new(plan, graph);
        let roots = runtime.graph.roots();

        let outcome = self.activate_stages(&mut runtime, roots).await;
        match outcome {
            Ok(()) => {
                if runtime.all_stages_complete() {
                    self.finalize_complete(&mut runtime).await;
                }
                self.insert_runtime(plan_id, runtime).await;
                tracing::info!(%plan_id, "plan submitted");
                Ok(plan_id)
            }
            Err(err) => {
                // Earlier stages may already have checkpointed shards;
                // fail them so the store records the abort.
                if let Err(cleanup) = self.fail_active_shards(plan_id, "aborted").await {
                    self.note_error(&cleanup);
                    tracing::warn!(%plan_id, error = %cleanup, "abort cleanup failed");
                }
                runtime.mark_aborted();
                self.metrics.plan_finished();
                self.insert_runtime(plan_id, runtime).await;
                tracing::warn!(%plan_id, error = %err, "plan aborted at submission");
                Err(err)
            }
        }
    }

    /// Partitions each listed stage and checkpoints its shards. Stages
    /// that partition to nothing complete immediately and may unlock
    /// their dependents.
    async fn activate_stages(
        &self,
        runtime: &mut PlanRuntime,
        mut queue: Vec<String>,
    ) -> Result<()> {
        while let Some(stage_id) = queue.pop() {
            let stage = runtime
                .plan
                .stage(&stage_id)
                .cloned()
                .ok_or_else(|| Error::PlanValidation {
                    message: format!("stage not in plan: {stage_id}"),
                })?;

            let shards = stage.partitioner.resolve().partition(&stage)?;
            let max_shards = runtime.plan.constraints.max_shards;
            if shards.len() > max_shards {
                return Err(Error::CapacityExceeded {
                    stage_id: stage_id.clone(),
                    shards: shards.len(),
                    max_shards,
                });
            }

            if shards.is_empty() {
                runtime
                    .stage_states
                    .insert(stage_id.clone(), StageState::Complete);
                queue.extend(runtime.refresh_ready());
                continue;
            }

            for shard in &shards {
                self.checkpointer
                    .save_shard(runtime.plan.plan_id, shard)
                    .await?;
            }
            tracing::debug!(
                stage_id,
                shard_count = shards.len(),
                "stage partitioned"
            );
        }
        Ok(())
    }

    /// Returns a point-in-time snapshot of a plan, or `None` if unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if checkpointed shard state cannot be read.
    pub async fn get_status(&self, plan_id: PlanId) -> Result<Option<PlanStatus>> {
        let Some(handle) = self.runtime_handle(plan_id).await else {
            return Ok(None);
        };
        let runtime = handle.lock().await;

        let shards = self.checkpointer.get_shards_by_plan(plan_id).await?;
        let mut shard_counts: HashMap<String, usize> = HashMap::new();
        for shard in &shards {
            *shard_counts
                .entry(shard.phase.as_label().to_string())
                .or_insert(0) += 1;
        }
        let done = shard_counts.get("done").copied().unwrap_or(0);

        let merkle_root = (runtime.merkle.leaf_count() > 0)
            .then(|| runtime.merkle.compute_root());

        Ok(Some(PlanStatus {
            plan_id,
            name: runtime.plan.name.clone(),
            state: runtime.plan_state,
            stages: runtime.stage_states.clone(),
            total_shards: shards.len(),
            eta_seconds: runtime.eta_seconds(shards.len(), done),
            shard_counts,
            merkle_root,
            truth_certified: runtime.truth_certified,
            submitted_at: runtime.plan.submitted_at,
            completed_at: runtime.completed_at,
        }))
    }

    /// Aborts a plan: every non-terminal shard fails with "aborted" and
    /// no further claims are served. Idempotent; returns false for an
    /// unknown or already terminal plan.
    ///
    /// # Errors
    ///
    /// Returns an error if checkpoint writes fail mid-abort.
    #[tracing::instrument(skip(self), fields(plan_id = %plan_id))]
    pub async fn abort_plan(&self, plan_id: PlanId) -> Result<bool> {
        let Some(handle) = self.runtime_handle(plan_id).await else {
            return Ok(false);
        };
        let mut runtime = handle.lock().await;
        if runtime.plan_state != PlanState::Running {
            return Ok(false);
        }

        self.fail_active_shards(plan_id, "aborted").await?;
        runtime.mark_aborted();
        self.metrics.plan_finished();
        tracing::info!(%plan_id, "plan aborted");
        Ok(true)
    }

    /// Transitions every active shard of a plan to `Failed`, appending a
    /// failure result with the given reason.
    async fn fail_active_shards(&self, plan_id: PlanId, reason: &str) -> Result<()> {
        let shards = self.checkpointer.get_shards_by_plan(plan_id).await?;
        for mut shard in shards {
            if !shard.phase.is_active() {
                continue;
            }
            let was_held = matches!(
                shard.phase,
                ShardPhase::Claimed | ShardPhase::Running
            );
            let from = shard.phase.as_label();
            shard.transition_to(ShardPhase::Failed)?;
            self.checkpointer.save_shard(plan_id, &shard).await?;
            self.checkpointer
                .save_result(plan_id, &ShardResult::failure(&shard, reason))
                .await?;
            self.metrics.record_transition(from, "failed");
            if was_held {
                self.metrics.shard_deactivated();
            }
        }
        Ok(())
    }

    /// Claims the next shard for a worker, or `None` when nothing is
    /// claimable. The `Pending -> Claimed` swap happens in the checkpoint
    /// store, so two racing workers can never hold the same shard.
    ///
    /// # Errors
    ///
    /// Returns an error if checkpoint access fails.
    pub async fn claim_next(
        &self,
        plan_id: PlanId,
        worker: &WorkerState,
    ) -> Result<Option<ShardSpec>> {
        let Some(handle) = self.runtime_handle(plan_id).await else {
            return Ok(None);
        };
        let mut guard = handle.lock().await;
        let runtime = &mut *guard;
        if runtime.plan_state != PlanState::Running {
            return Ok(None);
        }

        if worker.queue_depth > worker.queue_threshold {
            #[allow(clippy::cast_precision_loss)]
            let depth = worker.queue_depth as f64;
            runtime.push_signal(
                "",
                SignalType::QueueDepth,
                depth,
                "worker queue over threshold; claims declined",
            );
            self.metrics.record_autotune_signal("queue_depth");
        }

        let stage_order = runtime.graph.toposort()?;
        for stage_id in stage_order {
            match runtime.stage_states.get(&stage_id) {
                Some(StageState::Ready | StageState::InProgress) => {}
                _ => continue,
            }

            let mut ready: Vec<ShardSpec> = self
                .checkpointer
                .get_shards_by_stage(plan_id, &stage_id)
                .await?
                .into_iter()
                .filter(|s| s.phase == ShardPhase::Pending)
                .collect();
            if ready.is_empty() {
                continue;
            }

            let Some(scheduler) = runtime.schedulers.get_mut(&stage_id) else {
                continue;
            };

            while let Some(idx) = scheduler.next_shard(&ready, worker) {
                let candidate = ready.swap_remove(idx);
                let outcome = self
                    .checkpointer
                    .cas_shard_phase(
                        plan_id,
                        &candidate.cas_id,
                        ShardPhase::Pending,
                        ShardPhase::Claimed,
                        Some(worker.worker_id),
                    )
                    .await?;
                match outcome {
                    CasOutcome::Swapped(claimed) => {
                        runtime
                            .stage_states
                            .insert(stage_id.clone(), StageState::InProgress);
                        self.metrics.record_transition("pending", "claimed");
                        self.metrics.shard_activated();
                        return Ok(Some(claimed));
                    }
                    // Lost the race or the shard was split away; try the
                    // remaining candidates.
                    CasOutcome::Mismatch { .. } | CasOutcome::Missing => {
                        if ready.is_empty() {
                            break;
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    /// Moves a claimed shard into `Running` before execution starts.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPhaseTransition` if the shard is not `Claimed`, or
    /// `ShardNotFound` if it is unknown.
    pub async fn mark_running(&self, plan_id: PlanId, cas_id: &str) -> Result<()> {
        let outcome = self
            .checkpointer
            .cas_shard_phase(
                plan_id,
                cas_id,
                ShardPhase::Claimed,
                ShardPhase::Running,
                None,
            )
            .await?;
        match outcome {
            CasOutcome::Swapped(_) => {
                self.metrics.record_transition("claimed", "running");
                Ok(())
            }
            CasOutcome::Mismatch { actual } => Err(Error::InvalidPhaseTransition {
                from: actual.to_string(),
                to: ShardPhase::Running.to_string(),
                reason: "shard must be CLAIMED before it can run".into(),
            }),
            CasOutcome::Missing => Err(Error::ShardNotFound {
                cas_id: cas_id.to_string(),
            }),
        }
    }

    /// Records one shard attempt's outcome and drives everything that
    /// follows from it: retries, Merkle leaves, stage completion,
    /// downstream partitioning, and plan completion.
    ///
    /// Results for plans no longer running are discarded (cooperative
    /// cancellation after abort or timeout).
    ///
    /// # Errors
    ///
    /// Returns `ShardNotFound` for an unknown cas_id, `CapacityExceeded`
    /// when a newly unlocked stage partitions over budget (the plan is
    /// aborted), and checkpoint errors verbatim; a checkpoint failure
    /// leaves the shard's externally visible phase unchanged.
    #[tracing::instrument(
        skip(self, result),
        fields(plan_id = %plan_id, cas_id = %result.cas_id, success = result.success)
    )]
    pub async fn record_result(&self, plan_id: PlanId, result: ShardResult) -> Result<()> {
        let Some(handle) = self.runtime_handle(plan_id).await else {
            return Err(Error::PlanNotFound { plan_id });
        };
        let mut guard = handle.lock().await;
        let runtime = &mut *guard;
        if runtime.plan_state != PlanState::Running {
            tracing::debug!(cas_id = %result.cas_id, "discarding result for terminal plan");
            return Ok(());
        }

        let Some(shard) = self
            .checkpointer
            .get_shard(plan_id, &result.cas_id)
            .await?
        else {
            return Err(Error::ShardNotFound {
                cas_id: result.cas_id.clone(),
            });
        };
        let stage = runtime
            .plan
            .stage(&shard.stage_id)
            .cloned()
            .ok_or_else(|| Error::PlanValidation {
                message: format!("shard references unknown stage: {}", shard.stage_id),
            })?;

        // Attempt log first; the phase transition is the consequence.
        self.checkpointer.save_result(plan_id, &result).await?;

        let duration_ms = u64::try_from(result.duration_ms().max(0)).unwrap_or(0);
        self.observe_attempt(runtime, &stage, duration_ms, result.success);

        if result.success {
            self.complete_shard(runtime, plan_id, &stage, &result).await
        } else {
            self.retry_or_fail_shard(runtime, plan_id, &stage, shard, &result)
                .await
        }
    }

    /// Feeds duration into the stage scheduler and emits latency signals.
    fn observe_attempt(
        &self,
        runtime: &mut PlanRuntime,
        stage: &Stage,
        duration_ms: u64,
        success: bool,
    ) {
        #[allow(clippy::cast_precision_loss)]
        let duration_secs = duration_ms as f64 / 1000.0;
        self.metrics.observe_shard_duration(
            stage.executor.as_str(),
            if success { "done" } else { "failed" },
            duration_secs,
        );

        #[allow(clippy::cast_precision_loss)]
        let duration_value = duration_ms as f64;
        if duration_ms > stage.slo_ms {
            runtime.push_signal(
                &stage.id,
                SignalType::HighLatency,
                duration_value,
                "attempt exceeded stage SLO",
            );
            self.metrics.record_autotune_signal("high_latency");
        }

        let signal = runtime
            .schedulers
            .get_mut(&stage.id)
            .and_then(|s| s.observe(duration_ms, stage.slo_ms));
        if let Some(signal) = signal {
            runtime.push_signal(
                &stage.id,
                signal,
                duration_value,
                "hot shard detected; splitting pending shards",
            );
            self.metrics.record_autotune_signal("hotspot");
        }
    }

    async fn complete_shard(
        &self,
        runtime: &mut PlanRuntime,
        plan_id: PlanId,
        stage: &Stage,
        result: &ShardResult,
    ) -> Result<()> {
        let outcome = self
            .checkpointer
            .cas_shard_phase(
                plan_id,
                &result.cas_id,
                ShardPhase::Running,
                ShardPhase::Done,
                None,
            )
            .await?;
        match outcome {
            CasOutcome::Swapped(_) => {}
            CasOutcome::Mismatch { actual } => {
                return Err(Error::InvalidPhaseTransition {
                    from: actual.to_string(),
                    to: ShardPhase::Done.to_string(),
                    reason: "results may only be recorded for RUNNING shards".into(),
                });
            }
            CasOutcome::Missing => {
                return Err(Error::ShardNotFound {
                    cas_id: result.cas_id.clone(),
                });
            }
        }
        self.metrics.record_transition("running", "done");
        self.metrics.shard_deactivated();

        runtime
            .merkle
            .add_leaf(&result.cas_id, &result.output_digest, result.attempt);
        #[allow(clippy::cast_precision_loss)]
        runtime
            .done_durations_secs
            .push(result.duration_ms().max(0) as f64 / 1000.0);

        self.split_hot_shards(runtime, plan_id, stage).await?;

        let stage_shards = self
            .checkpointer
            .get_shards_by_stage(plan_id, &stage.id)
            .await?;
        let stage_done = stage_shards
            .iter()
            .all(|s| s.phase == ShardPhase::Done);
        if stage_done {
            runtime
                .stage_states
                .insert(stage.id.clone(), StageState::Complete);
            tracing::info!(stage_id = %stage.id, "stage complete");

            let newly_ready = runtime.refresh_ready();
            if !newly_ready.is_empty() {
                if let Err(err) = self.activate_stages(runtime, newly_ready).await {
                    self.fail_active_shards(plan_id, "aborted").await?;
                    runtime.mark_aborted();
                    self.metrics.plan_finished();
                    return Err(err);
                }
            }

            if runtime.all_stages_complete() {
                self.finalize_complete(runtime).await;
            }
        }
        Ok(())
    }

    async fn retry_or_fail_shard(
        &self,
        runtime: &mut PlanRuntime,
        plan_id: PlanId,
        stage: &Stage,
        mut shard: ShardSpec,
        result: &ShardResult,
    ) -> Result<()> {
        if shard.attempt >= stage.max_attempts {
            let outcome = self
                .checkpointer
                .cas_shard_phase(
                    plan_id,
                    &result.cas_id,
                    ShardPhase::Running,
                    ShardPhase::Failed,
                    None,
                )
                .await?;
            if matches!(outcome, CasOutcome::Missing) {
                return Err(Error::ShardNotFound {
                    cas_id: result.cas_id.clone(),
                });
            }
            self.metrics.record_transition("running", "failed");
            self.metrics.shard_deactivated();
            runtime.plan_state = PlanState::Failed;
            runtime.completed_at = Some(Utc::now());
            self.metrics.plan_finished();
            tracing::warn!(
                cas_id = %result.cas_id,
                attempt = shard.attempt,
                "shard failed terminally; plan failed"
            );
            return Ok(());
        }

        // Retry budget remains: walk Failed -> Retrying -> Pending,
        // checkpointing each step. The Retrying -> Pending edge bumps the
        // attempt counter.
        shard.transition_to(ShardPhase::Failed)?;
        self.checkpointer.save_shard(plan_id, &shard).await?;
        shard.transition_to(ShardPhase::Retrying)?;
        self.checkpointer.save_shard(plan_id, &shard).await?;
        shard.transition_to(ShardPhase::Pending)?;
        self.checkpointer.save_shard(plan_id, &shard).await?;

        self.metrics.record_transition("running", "failed");
        self.metrics.shard_deactivated();
        self.metrics.record_retry(&stage.id);
        tracing::debug!(
            cas_id = %shard.cas_id,
            attempt = shard.attempt,
            "shard requeued for retry"
        );
        Ok(())
    }

    /// Replaces pending shards of a hot stage with finer ones. Only the
    /// hot-shard scheduler ever produces replacements; capacity still
    /// binds the post-split shard count.
    async fn split_hot_shards(
        &self,
        runtime: &mut PlanRuntime,
        plan_id: PlanId,
        stage: &Stage,
    ) -> Result<()> {
        let pending: Vec<ShardSpec> = self
            .checkpointer
            .get_shards_by_stage(plan_id, &stage.id)
            .await?
            .into_iter()
            .filter(|s| s.phase == ShardPhase::Pending)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let stage_total = self
            .checkpointer
            .get_shards_by_stage(plan_id, &stage.id)
            .await?
            .len();
        let max_shards = runtime.plan.constraints.max_shards;

        for original in pending {
            let Some(scheduler) = runtime.schedulers.get_mut(&stage.id) else {
                return Ok(());
            };
            let Some(replacements) = scheduler.split(&original)? else {
                continue;
            };
            if stage_total - 1 + replacements.len() > max_shards {
                tracing::debug!(stage_id = %stage.id, "split skipped: would exceed max_shards");
                return Ok(());
            }

            self.checkpointer
                .remove_shard(plan_id, &original.cas_id)
                .await?;
            for replacement in &replacements {
                self.checkpointer.save_shard(plan_id, replacement).await?;
            }
            tracing::info!(
                stage_id = %stage.id,
                original = %original.cas_id,
                replacements = replacements.len(),
                "hot shard split"
            );
            // One split per recorded result keeps the work bounded.
            return Ok(());
        }
        Ok(())
    }

    async fn finalize_complete(&self, runtime: &mut PlanRuntime) {
        runtime.plan_state = PlanState::Complete;
        runtime.completed_at = Some(Utc::now());
        self.metrics.plan_finished();

        let summary = CertificationSummary {
            plan_id: runtime.plan.plan_id,
            merkle_root: runtime.merkle.compute_root(),
            total_shards: runtime.merkle.leaf_count(),
            done_shards: runtime.merkle.leaf_count(),
        };
        runtime.truth_certified = match &self.certifier {
            Some(certifier) => match certifier.certify(&summary).await {
                Ok(verdict) => verdict,
                Err(err) => {
                    tracing::warn!(error = %err, "certifier unavailable; completing uncertified");
                    false
                }
            },
            None => false,
        };
        tracing::info!(
            plan_id = %runtime.plan.plan_id,
            merkle_root = %summary.merkle_root,
            certified = runtime.truth_certified,
            "plan complete"
        );
    }

    /// Fails a plan that exceeded its timebox: in-flight shards fail with
    /// the timeout error; completed results and the partial Merkle root
    /// survive.
    async fn fail_timeout(&self, plan_id: PlanId, timebox_ms: u64) -> Result<()> {
        let Some(handle) = self.runtime_handle(plan_id).await else {
            return Ok(());
        };
        let mut runtime = handle.lock().await;
        if runtime.plan_state != PlanState::Running {
            return Ok(());
        }

        let reason = Error::Timeout {
            plan_id,
            timebox_ms,
        }
        .to_string();
        self.fail_active_shards(plan_id, &reason).await?;
        for stage_state in runtime.stage_states.values_mut() {
            if *stage_state != StageState::Complete {
                *stage_state = StageState::Aborted;
            }
        }
        runtime.plan_state = PlanState::Failed;
        runtime.completed_at = Some(Utc::now());
        self.metrics.plan_finished();
        tracing::warn!(%plan_id, timebox_ms, "plan failed: timebox exceeded");
        Ok(())
    }

    async fn is_terminal(&self, plan_id: PlanId) -> bool {
        match self.runtime_handle(plan_id).await {
            Some(handle) => handle.lock().await.plan_state != PlanState::Running,
            None => true,
        }
    }

    /// Runs a submitted plan to a terminal state with `worker_count`
    /// cooperative workers, sweeping the timebox in the background.
    ///
    /// # Errors
    ///
    /// Returns `PlanNotFound` for an unknown plan; execution failures are
    /// reflected in the returned status rather than raised.
    pub async fn run_to_completion(
        self: &Arc<Self>,
        plan_id: PlanId,
        worker_count: usize,
    ) -> Result<PlanStatus> {
        if self.runtime_handle(plan_id).await.is_none() {
            return Err(Error::PlanNotFound { plan_id });
        }

        let sweep = tokio::spawn(Arc::clone(self).timebox_sweep(plan_id));

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count.max(1) {
            let orch = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                orch.worker_loop(plan_id).await;
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }
        sweep.abort();

        self.get_status(plan_id)
            .await?
            .ok_or(Error::PlanNotFound { plan_id })
    }

    async fn worker_loop(self: Arc<Self>, plan_id: PlanId) {
        let worker = WorkerState::new(WorkerId::generate());
        loop {
            if self.is_terminal(plan_id).await {
                return;
            }
            let claimed = match self.claim_next(plan_id, &worker).await {
                Ok(claimed) => claimed,
                Err(err) => {
                    self.note_error(&err);
                    tracing::warn!(worker_id = %worker.worker_id, error = %err, "claim failed");
                    tokio::time::sleep(SWEEP_INTERVAL).await;
                    continue;
                }
            };
            let Some(spec) = claimed else {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                continue;
            };

            if let Err(err) = self.mark_running(plan_id, &spec.cas_id).await {
                self.note_error(&err);
                tracing::warn!(cas_id = %spec.cas_id, error = %err, "could not start shard");
                continue;
            }

            let result = self.execute_shard(&spec).await;
            if let Err(err) = self.record_result(plan_id, result).await {
                self.note_error(&err);
                tracing::warn!(cas_id = %spec.cas_id, error = %err, "recording result failed");
            }
        }
    }

    /// Executes a shard, converting executor infrastructure errors into
    /// failed results so they flow through the retry machinery.
    async fn execute_shard(&self, spec: &ShardSpec) -> ShardResult {
        let started = Utc::now();
        let executor = match self.executors.get(spec.executor) {
            Ok(executor) => executor,
            Err(err) => return ShardResult::failure(spec, err.to_string()),
        };
        match executor.execute(spec).await {
            Ok(mut result) => {
                result.started_at = started;
                result.finished_at = Utc::now();
                result
            }
            Err(err) => {
                let mut result = ShardResult::failure(spec, err.to_string());
                result.started_at = started;
                result.finished_at = Utc::now();
                result
            }
        }
    }

    async fn timebox_sweep(self: Arc<Self>, plan_id: PlanId) {
        let (timebox_ms, submitted_at) = {
            let Some(handle) = self.runtime_handle(plan_id).await else {
                return;
            };
            let runtime = handle.lock().await;
            let Some(timebox_ms) = runtime.plan.constraints.timebox_ms() else {
                return;
            };
            (timebox_ms, runtime.plan.submitted_at)
        };

        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            if self.is_terminal(plan_id).await {
                return;
            }
            let elapsed_ms =
                u64::try_from((Utc::now() - submitted_at).num_milliseconds().max(0))
                    .unwrap_or(u64::MAX);

            #[allow(clippy::cast_precision_loss)]
            let risk_threshold = (timebox_ms as f64 * TIMEOUT_RISK_FRACTION) as u64;
            if elapsed_ms > risk_threshold {
                if let Some(handle) = self.runtime_handle(plan_id).await {
                    let mut runtime = handle.lock().await;
                    if !runtime.timeout_warned {
                        runtime.timeout_warned = true;
                        #[allow(clippy::cast_precision_loss)]
                        let elapsed = elapsed_ms as f64;
                        runtime.push_signal(
                            "",
                            SignalType::TimeoutRisk,
                            elapsed,
                            "plan approaching timebox",
                        );
                        self.metrics.record_autotune_signal("timeout_risk");
                    }
                }
            }

            if elapsed_ms > timebox_ms {
                if let Err(err) = self.fail_timeout(plan_id, timebox_ms).await {
                    self.note_error(&err);
                    tracing::warn!(%plan_id, error = %err, "timebox sweep failed");
                }
                return;
            }
        }
    }

    /// Current Merkle root of a plan's completed result set.
    pub async fn merkle_root(&self, plan_id: PlanId) -> Option<String> {
        match self.runtime_handle(plan_id).await {
            Some(handle) => Some(handle.lock().await.merkle.compute_root()),
            None => None,
        }
    }

    /// Inclusion proof for a completed shard, or `None` if the plan or
    /// shard has no leaf.
    pub async fn generate_proof(&self, plan_id: PlanId, cas_id: &str) -> Option<MerkleProof> {
        match self.runtime_handle(plan_id).await {
            Some(handle) => handle.lock().await.merkle.generate_proof(cas_id),
            None => None,
        }
    }

    /// Uniformly sampled inclusion proofs for probabilistic auditing.
    pub async fn sample_proofs(&self, plan_id: PlanId, n: usize) -> Vec<MerkleProof> {
        match self.runtime_handle(plan_id).await {
            Some(handle) => handle.lock().await.merkle.sample_proofs(n),
            None => Vec::new(),
        }
    }

    /// Advisory autotune signals accumulated for a plan.
    pub async fn signals(&self, plan_id: PlanId) -> Vec<AutotuneSignal> {
        match self.runtime_handle(plan_id).await {
            Some(handle) => handle.lock().await.signals.clone(),
            None => Vec::new(),
        }
    }

    /// Rebuilds in-memory runtime for a checkpointed plan after a
    /// restart. Call after [`Rehydrator::rehydrate`] has reset in-flight
    /// shards; returns false if the plan is unknown to the store.
    ///
    /// [`Rehydrator::rehydrate`]: crate::rehydrate::Rehydrator::rehydrate
    ///
    /// # Errors
    ///
    /// Returns an error if checkpointed state cannot be read or fails
    /// validation.
    pub async fn resume_plan(&self, plan_id: PlanId) -> Result<bool> {
        let Some(plan) = self.checkpointer.get_plan(plan_id).await? else {
            return Ok(false);
        };
        let graph = plan.validate()?;
        self.metrics.plan_started();
        let mut runtime = PlanRuntime::new(plan, graph);

        let shards = self.checkpointer.get_shards_by_plan(plan_id).await?;
        for shard in &shards {
            if shard.phase != ShardPhase::Done {
                continue;
            }
            let results = self
                .checkpointer
                .get_results(plan_id, &shard.cas_id)
                .await?;
            if let Some(success) = results.iter().rev().find(|r| r.success) {
                runtime
                    .merkle
                    .add_leaf(&success.cas_id, &success.output_digest, success.attempt);
            }
        }

        // Derive stage states from checkpointed shards.
        let stage_ids: Vec<String> = runtime.plan.stages.iter().map(|s| s.id.clone()).collect();
        for stage_id in &stage_ids {
            let stage_shards: Vec<&ShardSpec> = shards
                .iter()
                .filter(|s| &s.stage_id == stage_id)
                .collect();
            if stage_shards.is_empty() {
                continue;
            }
            let state = if stage_shards.iter().all(|s| s.phase == ShardPhase::Done) {
                StageState::Complete
            } else if stage_shards
                .iter()
                .any(|s| s.phase != ShardPhase::Pending)
            {
                StageState::InProgress
            } else {
                StageState::Ready
            };
            runtime.stage_states.insert(stage_id.clone(), state);
        }
        let newly_ready = runtime.refresh_ready();
        if !newly_ready.is_empty() {
            self.activate_stages(&mut runtime, newly_ready).await?;
        }
        if runtime.all_stages_complete() {
            self.finalize_complete(&mut runtime).await;
        }

        self.insert_runtime(plan_id, runtime).await;
        tracing::info!(%plan_id, "plan resumed from checkpoint");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::memory::InMemoryCheckpointer;
    use crate::executor::ExecutorKind;
    use crate::partition::PartitionerKind;
    use crate::plan::PlanConstraints;
    use serde_json::json;

    fn orchestrator() -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            Arc::new(InMemoryCheckpointer::new()),
            ExecutorRegistry::simulated(),
            None,
        ))
    }

    fn module_stage(id: &str, modules: &[&str]) -> Stage {
        let config = match json!({"modules": modules}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        Stage::new(id, "test", PartitionerKind::ByModule, ExecutorKind::PackBackend)
            .with_config(config)
    }

    #[tokio::test]
    async fn submit_partitions_root_stages() {
        let orch = orchestrator();
        let plan = Plan::new(
            "p",
            vec![module_stage("s1", &["a", "b"])],
            PlanConstraints::default(),
            "tests",
        );
        let plan_id = orch.submit_plan(plan).await.unwrap();

        let status = orch.get_status(plan_id).await.unwrap().unwrap();
        assert_eq!(status.state, PlanState::Running);
        assert_eq!(status.total_shards, 2);
        assert_eq!(status.count(ShardPhase::Pending), 2);
    }

    #[tokio::test]
    async fn invalid_plan_is_rejected_synchronously() {
        let orch = orchestrator();
        let plan = Plan::new("p", vec![], PlanConstraints::default(), "tests");
        let err = orch.submit_plan(plan).await;
        assert!(matches!(err, Err(Error::PlanValidation { .. })));
    }

    #[tokio::test]
    async fn capacity_exceeded_aborts_at_submission() {
        let orch = orchestrator();
        let plan = Plan::new(
            "p",
            vec![module_stage("s1", &["a", "b", "c"])],
            PlanConstraints {
                max_shards: 2,
                timebox: None,
            },
            "tests",
        );
        let plan_id = plan.plan_id;
        let err = orch.submit_plan(plan).await;
        assert!(matches!(err, Err(Error::CapacityExceeded { .. })));

        let status = orch.get_status(plan_id).await.unwrap().unwrap();
        assert_eq!(status.state, PlanState::Aborted);
    }

    #[tokio::test]
    async fn rejected_submission_leaves_no_pending_shards() {
        let store = Arc::new(InMemoryCheckpointer::new());
        let orch = Arc::new(Orchestrator::new(
            Arc::clone(&store) as Arc<dyn Checkpointer>,
            ExecutorRegistry::simulated(),
            None,
        ));
        // The two-module stage partitions first and checkpoints its
        // shards; the four-module stage then overflows max_shards.
        let plan = Plan::new(
            "p",
            vec![
                module_stage("big", &["a", "b", "c", "d"]),
                module_stage("small", &["x", "y"]),
            ],
            PlanConstraints {
                max_shards: 3,
                timebox: None,
            },
            "tests",
        );
        let plan_id = plan.plan_id;
        let err = orch.submit_plan(plan).await;
        assert!(matches!(err, Err(Error::CapacityExceeded { .. })));

        let shards = store.get_shards_by_plan(plan_id).await.unwrap();
        assert!(!shards.is_empty());
        assert!(shards.iter().all(|s| s.phase == ShardPhase::Failed));

        let status = orch.get_status(plan_id).await.unwrap().unwrap();
        assert_eq!(status.state, PlanState::Aborted);
    }

    #[tokio::test]
    async fn independent_plans_progress_concurrently() {
        let orch = orchestrator();
        let plan_a = Plan::new(
            "a",
            vec![module_stage("s1", &["a", "b"])],
            PlanConstraints::default(),
            "tests",
        );
        let plan_b = Plan::new(
            "b",
            vec![module_stage("s1", &["c", "d"])],
            PlanConstraints::default(),
            "tests",
        );
        let id_a = orch.submit_plan(plan_a).await.unwrap();
        let id_b = orch.submit_plan(plan_b).await.unwrap();

        let (status_a, status_b) = tokio::join!(
            orch.run_to_completion(id_a, 2),
            orch.run_to_completion(id_b, 2),
        );
        let status_a = status_a.unwrap();
        let status_b = status_b.unwrap();
        assert_eq!(status_a.state, PlanState::Complete);
        assert_eq!(status_b.state, PlanState::Complete);
        assert_eq!(status_a.count(ShardPhase::Done), 2);
        assert_eq!(status_b.count(ShardPhase::Done), 2);
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_checkpointed() {
        let orch = orchestrator();
        let plan = Plan::new(
            "p",
            vec![module_stage("s1", &["a"])],
            PlanConstraints::default(),
            "tests",
        );
        let plan_id = orch.submit_plan(plan).await.unwrap();

        let worker = WorkerState::new(WorkerId::generate());
        let first = orch.claim_next(plan_id, &worker).await.unwrap();
        assert!(first.is_some());
        let second = orch.claim_next(plan_id, &worker).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let orch = orchestrator();
        let plan = Plan::new(
            "p",
            vec![module_stage("s1", &["a"])],
            PlanConstraints::default(),
            "tests",
        );
        let plan_id = orch.submit_plan(plan).await.unwrap();

        assert!(orch.abort_plan(plan_id).await.unwrap());
        assert!(!orch.abort_plan(plan_id).await.unwrap());
        assert!(!orch.abort_plan(PlanId::generate()).await.unwrap());

        let status = orch.get_status(plan_id).await.unwrap().unwrap();
        assert_eq!(status.state, PlanState::Aborted);
        assert_eq!(status.count(ShardPhase::Failed), 1);
    }

    #[tokio::test]
    async fn aborted_plan_serves_no_claims() {
        let orch = orchestrator();
        let plan = Plan::new(
            "p",
            vec![module_stage("s1", &["a", "b"])],
            PlanConstraints::default(),
            "tests",
        );
        let plan_id = orch.submit_plan(plan).await.unwrap();
        orch.abort_plan(plan_id).await.unwrap();

        let worker = WorkerState::new(WorkerId::generate());
        assert!(orch.claim_next(plan_id, &worker).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_to_completion_completes_single_stage() {
        let orch = orchestrator();
        let plan = Plan::new(
            "p",
            vec![module_stage("s1", &["a", "b", "c"])],
            PlanConstraints::default(),
            "tests",
        );
        let plan_id = orch.submit_plan(plan).await.unwrap();

        let status = orch.run_to_completion(plan_id, 2).await.unwrap();
        assert_eq!(status.state, PlanState::Complete);
        assert_eq!(status.count(ShardPhase::Done), 3);
        assert!(!status.truth_certified);
        assert!(status.merkle_root.is_some());
    }

    #[tokio::test]
    async fn downstream_stage_waits_for_upstream() {
        let orch = orchestrator();
        let downstream =
            module_stage("s2", &["x"]).with_dependencies(vec!["s1".to_string()]);
        let plan = Plan::new(
            "p",
            vec![module_stage("s1", &["a"]), downstream],
            PlanConstraints::default(),
            "tests",
        );
        let plan_id = orch.submit_plan(plan).await.unwrap();

        // Only s1 is partitioned at submission.
        let status = orch.get_status(plan_id).await.unwrap().unwrap();
        assert_eq!(status.total_shards, 1);
        assert_eq!(status.stages["s2"], StageState::NotReady);

        let final_status = orch.run_to_completion(plan_id, 2).await.unwrap();
        assert_eq!(final_status.state, PlanState::Complete);
        assert_eq!(final_status.count(ShardPhase::Done), 2);
        assert_eq!(final_status.stages["s2"], StageState::Complete);
    }

    #[tokio::test]
    async fn unknown_plan_has_no_status() {
        let orch = orchestrator();
        assert!(orch
            .get_status(PlanId::generate())
            .await
            .unwrap()
            .is_none());
    }

    struct ApprovingCertifier;

    #[async_trait]
    impl Certifier for ApprovingCertifier {
        async fn certify(&self, _summary: &CertificationSummary) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn certifier_verdict_is_reported() {
        let orch = Arc::new(Orchestrator::new(
            Arc::new(InMemoryCheckpointer::new()),
            ExecutorRegistry::simulated(),
            Some(Arc::new(ApprovingCertifier)),
        ));
        let plan = Plan::new(
            "p",
            vec![module_stage("s1", &["a"])],
            PlanConstraints::default(),
            "tests",
        );
        let plan_id = orch.submit_plan(plan).await.unwrap();
        let status = orch.run_to_completion(plan_id, 1).await.unwrap();
        assert!(status.truth_certified);
    }
}
