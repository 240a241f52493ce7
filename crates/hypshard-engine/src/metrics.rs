//! Observability metrics for the execution engine.
//!
//! Exposed via the `metrics` crate facade; install any compatible
//! recorder to export them.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `hypshard_shard_transitions_total` | Counter | `from_phase`, `to_phase` | Shard phase transitions |
//! | `hypshard_shard_duration_seconds` | Histogram | `executor`, `outcome` | Shard attempt duration |
//! | `hypshard_shards_active` | Gauge | - | Shards currently claimed or running |
//! | `hypshard_plans_active` | Gauge | - | Plans not yet terminal |
//! | `hypshard_retries_total` | Counter | `stage` | Shard retries |
//! | `hypshard_autotune_signals_total` | Counter | `signal_type` | Advisory signals emitted |
//! | `hypshard_checkpoint_write_failures_total` | Counter | - | Failed checkpoint writes |

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: shard phase transitions.
    pub const SHARD_TRANSITIONS_TOTAL: &str = "hypshard_shard_transitions_total";
    /// Histogram: shard attempt duration in seconds.
    pub const SHARD_DURATION_SECONDS: &str = "hypshard_shard_duration_seconds";
    /// Gauge: shards currently claimed or running.
    pub const SHARDS_ACTIVE: &str = "hypshard_shards_active";
    /// Gauge: plans not yet terminal.
    pub const PLANS_ACTIVE: &str = "hypshard_plans_active";
    /// Counter: shard retries.
    pub const RETRIES_TOTAL: &str = "hypshard_retries_total";
    /// Counter: advisory autotune signals emitted.
    pub const AUTOTUNE_SIGNALS_TOTAL: &str = "hypshard_autotune_signals_total";
    /// Counter: failed checkpoint writes.
    pub const CHECKPOINT_WRITE_FAILURES_TOTAL: &str = "hypshard_checkpoint_write_failures_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous shard phase (for transitions).
    pub const FROM_PHASE: &str = "from_phase";
    /// Target shard phase (for transitions).
    pub const TO_PHASE: &str = "to_phase";
    /// Executor kind.
    pub const EXECUTOR: &str = "executor";
    /// Attempt outcome (done, failed).
    pub const OUTCOME: &str = "outcome";
    /// Stage id.
    pub const STAGE: &str = "stage";
    /// Autotune signal type.
    pub const SIGNAL_TYPE: &str = "signal_type";
}

/// High-level interface for recording engine metrics.
///
/// Cheap to clone and share across workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineMetrics;

impl EngineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a shard phase transition.
    pub fn record_transition(&self, from_phase: &str, to_phase: &str) {
        counter!(
            names::SHARD_TRANSITIONS_TOTAL,
            labels::FROM_PHASE => from_phase.to_string(),
            labels::TO_PHASE => to_phase.to_string(),
        )
        .increment(1);
    }

    /// Records a finished shard attempt's duration.
    pub fn observe_shard_duration(&self, executor: &str, outcome: &str, duration_secs: f64) {
        histogram!(
            names::SHARD_DURATION_SECONDS,
            labels::EXECUTOR => executor.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .record(duration_secs);
    }

    /// Marks a shard entering the claimed-or-running window.
    pub fn shard_activated(&self) {
        gauge!(names::SHARDS_ACTIVE).increment(1.0);
    }

    /// Marks a shard leaving the claimed-or-running window.
    pub fn shard_deactivated(&self) {
        gauge!(names::SHARDS_ACTIVE).decrement(1.0);
    }

    /// Marks a plan entering execution.
    pub fn plan_started(&self) {
        gauge!(names::PLANS_ACTIVE).increment(1.0);
    }

    /// Marks a plan reaching a terminal state.
    pub fn plan_finished(&self) {
        gauge!(names::PLANS_ACTIVE).decrement(1.0);
    }

    /// Records a shard retry.
    pub fn record_retry(&self, stage: &str) {
        counter!(
            names::RETRIES_TOTAL,
            labels::STAGE => stage.to_string(),
        )
        .increment(1);
    }

    /// Records an emitted autotune signal.
    pub fn record_autotune_signal(&self, signal_type: &str) {
        counter!(
            names::AUTOTUNE_SIGNALS_TOTAL,
            labels::SIGNAL_TYPE => signal_type.to_string(),
        )
        .increment(1);
    }

    /// Records a failed checkpoint write.
    pub fn record_checkpoint_write_failure(&self) {
        counter!(names::CHECKPOINT_WRITE_FAILURES_TOTAL).increment(1);
    }
}
