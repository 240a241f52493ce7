//! Plans, stages, and derived status.
//!
//! A plan is the unit of submission: a DAG of stages plus plan-level
//! constraints. Stages declare their partitioner, scheduler, and executor
//! by kind; the orchestrator resolves those at submission. `PlanStatus` is
//! always recomputed from checkpointed shard state, never stored.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hypshard_core::PlanId;

use crate::dag::StageGraph;
use crate::error::{Error, Result};
use crate::executor::ExecutorKind;
use crate::partition::PartitionerKind;
use crate::schedule::SchedulerKind;
use crate::shard::ShardPhase;

fn default_max_attempts() -> u32 {
    3
}

/// One stage of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// Stage id, unique within the plan.
    pub id: String,
    /// Human-readable stage kind label.
    pub kind: String,
    /// Per-shard latency objective in milliseconds. The hot-shard scheduler
    /// compares observed execution time against this.
    pub slo_ms: u64,
    /// How stage work is split into shards.
    pub partitioner: PartitionerKind,
    /// Which executor runs this stage's shards.
    pub executor: ExecutorKind,
    /// How ready shards are handed to workers.
    pub scheduler: SchedulerKind,
    /// Ids of stages this stage waits on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Partitioner-specific configuration.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Retry budget per shard. A shard is terminally failed once its
    /// attempt count reaches this.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Stage {
    /// Creates a stage with default scheduler, no dependencies, and the
    /// default retry budget.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        partitioner: PartitionerKind,
        executor: ExecutorKind,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            slo_ms: 30_000,
            partitioner,
            executor,
            scheduler: SchedulerKind::FairRoundRobin,
            dependencies: Vec::new(),
            config: serde_json::Map::new(),
            max_attempts: default_max_attempts(),
        }
    }

    /// Sets the stage dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Sets the scheduler kind.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Sets the partitioner configuration.
    #[must_use]
    pub fn with_config(mut self, config: serde_json::Map<String, serde_json::Value>) -> Self {
        self.config = config;
        self
    }

    /// Sets the per-shard retry budget.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the per-shard latency objective.
    #[must_use]
    pub fn with_slo_ms(mut self, slo_ms: u64) -> Self {
        self.slo_ms = slo_ms;
        self
    }
}

/// Plan-level execution constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanConstraints {
    /// Maximum shards any single stage may partition into. Exceeding this
    /// aborts the plan at partition time.
    pub max_shards: usize,
    /// Overall wall-clock budget for the plan. `None` means unbounded.
    #[serde(default, with = "humantime_serde::option")]
    pub timebox: Option<Duration>,
}

impl PlanConstraints {
    /// Returns the timebox in milliseconds, if one is set.
    #[must_use]
    pub fn timebox_ms(&self) -> Option<u64> {
        self.timebox
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

impl Default for PlanConstraints {
    fn default() -> Self {
        Self {
            max_shards: 1024,
            timebox: None,
        }
    }
}

/// A declarative execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Unique plan identifier.
    pub plan_id: PlanId,
    /// Human-readable plan name.
    pub name: String,
    /// Ordered stage definitions.
    pub stages: Vec<Stage>,
    /// Plan-level constraints.
    #[serde(default)]
    pub constraints: PlanConstraints,
    /// When the plan was submitted.
    pub submitted_at: DateTime<Utc>,
    /// Who submitted the plan.
    pub submitted_by: String,
}

impl Plan {
    /// Creates a plan with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        stages: Vec<Stage>,
        constraints: PlanConstraints,
        submitted_by: impl Into<String>,
    ) -> Self {
        Self {
            plan_id: PlanId::generate(),
            name: name.into(),
            stages,
            constraints,
            submitted_at: Utc::now(),
            submitted_by: submitted_by.into(),
        }
    }

    /// Returns the stage with the given id, if present.
    #[must_use]
    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    /// Validates the plan and returns its stage graph.
    ///
    /// Checks, in order: at least one stage, unique stage ids, dependency
    /// references resolve, and the dependency graph is acyclic.
    ///
    /// # Errors
    ///
    /// Returns `PlanValidation` describing the first problem found.
    #[tracing::instrument(skip(self), fields(plan_id = %self.plan_id, stages = self.stages.len()))]
    pub fn validate(&self) -> Result<StageGraph> {
        if self.stages.is_empty() {
            return Err(Error::PlanValidation {
                message: "plan has no stages".into(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.id.as_str()) {
                return Err(Error::PlanValidation {
                    message: format!("duplicate stage id: {}", stage.id),
                });
            }
        }

        let graph = StageGraph::from_stages(
            self.stages
                .iter()
                .map(|s| (s.id.as_str(), s.dependencies.as_slice())),
        )?;

        // Surfaces cycles before any shard is created.
        graph.toposort()?;
        Ok(graph)
    }
}

/// Lifecycle state of a single stage within a running plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Upstream stages have not all completed.
    NotReady,
    /// Eligible to partition and schedule.
    Ready,
    /// Has shards in flight.
    InProgress,
    /// All shards done.
    Complete,
    /// Abandoned due to abort, capacity, or timeout.
    Aborted,
}

/// Overall state of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    /// Shards are pending or in flight.
    Running,
    /// Every shard completed successfully.
    Complete,
    /// At least one shard failed terminally, or the timebox elapsed.
    Failed,
    /// The plan was aborted.
    Aborted,
}

/// Point-in-time snapshot of a plan, derived from checkpointed shard state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    /// The plan this status describes.
    pub plan_id: PlanId,
    /// Plan name.
    pub name: String,
    /// Overall plan state.
    pub state: PlanState,
    /// Per-stage lifecycle states.
    pub stages: HashMap<String, StageState>,
    /// Shard counts keyed by phase label.
    pub shard_counts: HashMap<String, usize>,
    /// Total shards created so far.
    pub total_shards: usize,
    /// Merkle root over the completed result set, once any shard is done.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<String>,
    /// Whether an external certifier vouched for the result set.
    pub truth_certified: bool,
    /// Rough seconds-to-completion estimate from observed throughput.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    /// When the plan was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When the plan reached a terminal state, if it has.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PlanStatus {
    /// Returns the shard count for a phase, defaulting to zero.
    #[must_use]
    pub fn count(&self, phase: ShardPhase) -> usize {
        self.shard_counts
            .get(phase.as_label())
            .copied()
            .unwrap_or(0)
    }

    /// Returns true if the plan is in a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, PlanState::Running)
    }
}

/// Classification of an advisory autotune observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    /// Shard execution time is well above the stage SLO.
    HighLatency,
    /// A small set of shards dominates stage runtime.
    Hotspot,
    /// The plan is on track to exceed its timebox.
    TimeoutRisk,
    /// Worker queues are backing up.
    QueueDepth,
}

/// Advisory signal emitted by schedulers and the timebox sweep.
///
/// Signals never change behavior by themselves; operators and the
/// hot-shard scheduler consume them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutotuneSignal {
    /// The plan the signal concerns.
    pub plan_id: PlanId,
    /// The stage the signal concerns.
    pub stage_id: String,
    /// What kind of condition was observed.
    pub signal_type: SignalType,
    /// The observed metric value (meaning depends on `signal_type`).
    pub metric_value: f64,
    /// When the signal was emitted.
    pub timestamp: DateTime<Utc>,
    /// Suggested operator action.
    pub suggested_action: String,
}
