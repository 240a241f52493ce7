//! Content-addressed shards and their lifecycle.
//!
//! This module provides:
//! - `ShardPhase`: The state machine for shard execution
//! - `ShardSpec`: A content-addressed unit of stage work
//! - `ShardResult`: The recorded outcome of one execution attempt
//!
//! `ShardSpec` is a passive record; transitions are driven by the
//! orchestrator and validated here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use hypshard_core::canonical_json;
use hypshard_core::WorkerId;

use crate::error::{Error, Result};
use crate::executor::ExecutorKind;

/// Number of hex characters kept from the SHA-256 digest for a CAS id.
///
/// 64 bits of digest; collision probability is negligible at the shard
/// counts a single deployment sees, and the short form keys storage and
/// Merkle leaf ids.
const CAS_ID_HEX_LEN: usize = 16;

/// Shard execution phase state machine.
///
/// ```text
/// ┌─────────┐ claim ┌─────────┐ start ┌─────────┐
/// │ PENDING │──────►│ CLAIMED │──────►│ RUNNING │
/// └─────────┘       └─────────┘       └─────────┘
///      ▲                                  │
///      │                        ┌─────────┼─────────┐
///      │                        ▼                   ▼
///      │                   ┌────────┐          ┌────────┐
///      │                   │  DONE  │          │ FAILED │
///      │                   └────────┘          └────────┘
///      │                                            │ budget left?
///      │            ┌──────────┐                    │
///      └────────────│ RETRYING │◄───────────────────┘
///                   └──────────┘
/// ```
///
/// `Done` is terminal. `Failed` is terminal only once the attempt count
/// reaches the stage retry budget. Rehydration may force any non-`Done`
/// shard back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardPhase {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed by a worker, not yet executing.
    Claimed,
    /// Actively executing.
    Running,
    /// Completed successfully (terminal).
    Done,
    /// Failed; terminal once the retry budget is exhausted.
    Failed,
    /// Queued for re-entry into scheduling after a failure.
    Retrying,
}

impl ShardPhase {
    /// Returns true if this phase never transitions further.
    ///
    /// `Failed` is reported terminal here; whether a failed shard actually
    /// stops depends on the stage retry budget, which the orchestrator
    /// checks before moving it to `Retrying`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns true if the shard is awaiting or undergoing execution.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Claimed | Self::Running | Self::Retrying
        )
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Claimed | Self::Failed),
            Self::Claimed => matches!(target, Self::Running | Self::Failed),
            Self::Running => matches!(target, Self::Done | Self::Failed),
            Self::Failed => matches!(target, Self::Retrying),
            Self::Retrying => matches!(target, Self::Pending | Self::Failed),
            Self::Done => false,
        }
    }

    /// Returns all valid target phases from the current phase.
    #[must_use]
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Pending => vec![Self::Claimed, Self::Failed],
            Self::Claimed => vec![Self::Running, Self::Failed],
            Self::Running => vec![Self::Done, Self::Failed],
            Self::Failed => vec![Self::Retrying],
            Self::Retrying => vec![Self::Pending, Self::Failed],
            Self::Done => vec![],
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

impl Default for ShardPhase {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for ShardPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Claimed => write!(f, "CLAIMED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Done => write!(f, "DONE"),
            Self::Failed => write!(f, "FAILED"),
            Self::Retrying => write!(f, "RETRYING"),
        }
    }
}

/// Preimage for CAS id computation.
///
/// Field names are part of the identity contract; canonical JSON sorts
/// them, so adding a field changes every id.
#[derive(Serialize)]
struct CasPreimage<'a> {
    stage_id: &'a str,
    executor: ExecutorKind,
    inputs: &'a serde_json::Value,
    dependencies: Vec<String>,
}

/// A content-addressed, independently schedulable unit of stage work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardSpec {
    /// Content-addressed identity: hash of (stage, executor, inputs, deps).
    pub cas_id: String,
    /// The stage this shard belongs to.
    pub stage_id: String,
    /// The executor that will run this shard.
    pub executor: ExecutorKind,
    /// Opaque inputs handed to the executor.
    pub inputs: serde_json::Value,
    /// CAS ids of shards this shard depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Attempt number (1-indexed, increments on retry).
    pub attempt: u32,
    /// Current lifecycle phase.
    pub phase: ShardPhase,
    /// Worker holding the current claim, if any. Advisory; rehydration
    /// discards stale ownership.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<WorkerId>,
    /// Timestamp of the most recent phase transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ShardSpec {
    /// Creates a new shard in `Pending` phase, computing its CAS id.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs cannot be canonically serialized.
    pub fn new(
        stage_id: impl Into<String>,
        executor: ExecutorKind,
        inputs: serde_json::Value,
        dependencies: Vec<String>,
    ) -> Result<Self> {
        let stage_id = stage_id.into();
        let cas_id = Self::compute_cas_id(&stage_id, executor, &inputs, &dependencies)?;
        Ok(Self {
            cas_id,
            stage_id,
            executor,
            inputs,
            dependencies,
            attempt: 1,
            phase: ShardPhase::Pending,
            claimed_by: None,
            updated_at: None,
        })
    }

    /// Computes the content-addressed shard id.
    ///
    /// Pure and deterministic: canonical JSON (sorted keys), sorted
    /// dependency list, SHA-256 truncated to 16 hex characters. Identical
    /// logical work always maps to the same id, across plans and restarts.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs cannot be canonically serialized.
    pub fn compute_cas_id(
        stage_id: &str,
        executor: ExecutorKind,
        inputs: &serde_json::Value,
        dependencies: &[String],
    ) -> Result<String> {
        let mut deps: Vec<String> = dependencies.to_vec();
        deps.sort();

        let preimage = CasPreimage {
            stage_id,
            executor,
            inputs,
            dependencies: deps,
        };
        let bytes = canonical_json::to_canonical_bytes(&preimage)?;

        let digest = Sha256::digest(&bytes);
        let hex = format!("{digest:x}");
        Ok(hex[..CAS_ID_HEX_LEN].to_string())
    }

    /// Transitions to a new phase.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    #[tracing::instrument(
        skip(self),
        fields(cas_id = %self.cas_id, from = %self.phase, to = %target, attempt = self.attempt)
    )]
    pub fn transition_to(&mut self, target: ShardPhase) -> Result<()> {
        if !self.phase.can_transition_to(target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.phase.to_string(),
                to: target.to_string(),
                reason: format!(
                    "valid transitions from {}: {:?}",
                    self.phase,
                    self.phase.valid_transitions()
                ),
            });
        }

        // Re-entering scheduling starts a fresh attempt.
        if self.phase == ShardPhase::Retrying && target == ShardPhase::Pending {
            self.attempt += 1;
            self.claimed_by = None;
        }
        if target == ShardPhase::Pending || self.phase.is_terminal() {
            self.claimed_by = None;
        }

        self.phase = target;
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// Forces the shard back to `Pending`, discarding claim ownership.
    ///
    /// Recovery-only: bypasses the transition table so that shards
    /// checkpointed mid-flight (`Claimed`, `Running`) can re-enter
    /// scheduling after a restart. Callers must not use this on `Done`
    /// shards.
    pub fn force_pending(&mut self) {
        self.phase = ShardPhase::Pending;
        self.claimed_by = None;
        self.updated_at = Some(Utc::now());
    }
}

/// The recorded outcome of one shard execution attempt.
///
/// Results are append-only per attempt; only the latest successful result
/// feeds the Merkle leaf set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardResult {
    /// The shard this result belongs to.
    pub cas_id: String,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Hash of the executor output.
    pub output_digest: String,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// The attempt this result records.
    pub attempt: u32,
    /// Error message (if failed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Executor-defined metadata.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ShardResult {
    /// Creates a successful result for the given shard attempt.
    #[must_use]
    pub fn success(spec: &ShardSpec, output_digest: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            cas_id: spec.cas_id.clone(),
            success: true,
            output_digest: output_digest.into(),
            started_at: now,
            finished_at: now,
            attempt: spec.attempt,
            error: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Creates a failed result for the given shard attempt.
    #[must_use]
    pub fn failure(spec: &ShardSpec, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            cas_id: spec.cas_id.clone(),
            success: false,
            output_digest: String::new(),
            started_at: now,
            finished_at: now,
            attempt: spec.attempt,
            error: Some(error.into()),
            metadata: serde_json::Map::new(),
        }
    }

    /// Returns the wall-clock duration of this attempt in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cas_id_is_deterministic() {
        let inputs = json!({"file": "lib.rs", "size": 100});
        let a = ShardSpec::compute_cas_id("stage1", ExecutorKind::PackBackend, &inputs, &[])
            .unwrap();
        let b = ShardSpec::compute_cas_id("stage1", ExecutorKind::PackBackend, &inputs, &[])
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cas_id_differs_when_any_field_differs() {
        let inputs = json!({"file": "lib.rs"});
        let base = ShardSpec::compute_cas_id("stage1", ExecutorKind::PackBackend, &inputs, &[])
            .unwrap();

        let other_stage =
            ShardSpec::compute_cas_id("stage2", ExecutorKind::PackBackend, &inputs, &[]).unwrap();
        let other_exec =
            ShardSpec::compute_cas_id("stage1", ExecutorKind::WarmRegistry, &inputs, &[]).unwrap();
        let other_inputs = ShardSpec::compute_cas_id(
            "stage1",
            ExecutorKind::PackBackend,
            &json!({"file": "main.rs"}),
            &[],
        )
        .unwrap();
        let other_deps = ShardSpec::compute_cas_id(
            "stage1",
            ExecutorKind::PackBackend,
            &inputs,
            &["abc".to_string()],
        )
        .unwrap();

        assert_ne!(base, other_stage);
        assert_ne!(base, other_exec);
        assert_ne!(base, other_inputs);
        assert_ne!(base, other_deps);
    }

    #[test]
    fn cas_id_ignores_dependency_order() {
        let inputs = json!({});
        let deps_a = vec!["bbb".to_string(), "aaa".to_string()];
        let deps_b = vec!["aaa".to_string(), "bbb".to_string()];

        let a = ShardSpec::compute_cas_id("s", ExecutorKind::PackBackend, &inputs, &deps_a)
            .unwrap();
        let b = ShardSpec::compute_cas_id("s", ExecutorKind::PackBackend, &inputs, &deps_b)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cas_id_ignores_input_key_order() {
        let a = ShardSpec::compute_cas_id(
            "s",
            ExecutorKind::PackBackend,
            &json!({"a": 1, "b": 2}),
            &[],
        )
        .unwrap();
        let b = ShardSpec::compute_cas_id(
            "s",
            ExecutorKind::PackBackend,
            &json!({"b": 2, "a": 1}),
            &[],
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn happy_path_transitions() {
        let mut shard =
            ShardSpec::new("stage1", ExecutorKind::PackBackend, json!({}), vec![]).unwrap();
        assert_eq!(shard.phase, ShardPhase::Pending);

        shard.transition_to(ShardPhase::Claimed).unwrap();
        shard.transition_to(ShardPhase::Running).unwrap();
        shard.transition_to(ShardPhase::Done).unwrap();
        assert!(shard.phase.is_terminal());
    }

    #[test]
    fn done_is_terminal() {
        let mut shard =
            ShardSpec::new("stage1", ExecutorKind::PackBackend, json!({}), vec![]).unwrap();
        shard.transition_to(ShardPhase::Claimed).unwrap();
        shard.transition_to(ShardPhase::Running).unwrap();
        shard.transition_to(ShardPhase::Done).unwrap();

        let err = shard.transition_to(ShardPhase::Pending);
        assert!(matches!(err, Err(Error::InvalidPhaseTransition { .. })));
    }

    #[test]
    fn retry_increments_attempt_and_clears_claim() {
        let mut shard =
            ShardSpec::new("stage1", ExecutorKind::PackBackend, json!({}), vec![]).unwrap();
        shard.claimed_by = Some(WorkerId::generate());
        shard.transition_to(ShardPhase::Claimed).unwrap();
        shard.transition_to(ShardPhase::Running).unwrap();
        shard.transition_to(ShardPhase::Failed).unwrap();
        shard.transition_to(ShardPhase::Retrying).unwrap();
        shard.transition_to(ShardPhase::Pending).unwrap();

        assert_eq!(shard.attempt, 2);
        assert!(shard.claimed_by.is_none());
    }

    #[test]
    fn cannot_skip_claimed() {
        let mut shard =
            ShardSpec::new("stage1", ExecutorKind::PackBackend, json!({}), vec![]).unwrap();
        let err = shard.transition_to(ShardPhase::Running);
        assert!(matches!(err, Err(Error::InvalidPhaseTransition { .. })));
    }

    #[test]
    fn force_pending_resets_claim() {
        let mut shard =
            ShardSpec::new("stage1", ExecutorKind::PackBackend, json!({}), vec![]).unwrap();
        shard.transition_to(ShardPhase::Claimed).unwrap();
        shard.claimed_by = Some(WorkerId::generate());
        shard.transition_to(ShardPhase::Running).unwrap();

        shard.force_pending();
        assert_eq!(shard.phase, ShardPhase::Pending);
        assert!(shard.claimed_by.is_none());
    }

    #[test]
    fn result_duration() {
        let shard =
            ShardSpec::new("stage1", ExecutorKind::PackBackend, json!({}), vec![]).unwrap();
        let mut result = ShardResult::success(&shard, "digest");
        result.finished_at = result.started_at + chrono::Duration::milliseconds(250);
        assert_eq!(result.duration_ms(), 250);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn identical_preimages_give_identical_ids(
                stage in "[a-z_]{1,12}",
                key in "[a-z]{1,6}",
                value in -10_000i64..10_000i64,
                deps in prop::collection::vec("[0-9a-f]{16}", 0..4)
            ) {
                let inputs = json!({ key.clone(): value });
                let a = ShardSpec::compute_cas_id(
                    &stage, ExecutorKind::PackBackend, &inputs, &deps,
                ).unwrap();
                let b = ShardSpec::compute_cas_id(
                    &stage, ExecutorKind::PackBackend, &inputs, &deps,
                ).unwrap();
                prop_assert_eq!(a, b);
            }

            #[test]
            fn different_values_give_different_ids(
                value_a in 0i64..10_000i64,
                value_b in 10_001i64..20_000i64
            ) {
                let a = ShardSpec::compute_cas_id(
                    "s", ExecutorKind::PackBackend, &json!({"v": value_a}), &[],
                ).unwrap();
                let b = ShardSpec::compute_cas_id(
                    "s", ExecutorKind::PackBackend, &json!({"v": value_b}), &[],
                ).unwrap();
                prop_assert_ne!(a, b);
            }
        }
    }
}
