//! Shard scheduling strategies.
//!
//! A scheduler decides which ready shard a worker claims next. Strategies
//! are stateful and live per stage (the round-robin cursor, hot-shard
//! observations). Two rules bind every strategy: never hand out a shard
//! that is not `Pending`, and never hand the same shard to two concurrent
//! callers (the claim CAS in the checkpoint store enforces the latter).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hypshard_core::WorkerId;

use crate::error::Result;
use crate::plan::SignalType;
use crate::shard::{ShardPhase, ShardSpec};

/// Execution-time multiple of the stage SLO past which a shard counts
/// as hot.
const HOT_FACTOR: f64 = 2.0;

/// Default worker queue depth past which backpressure declines claims.
const DEFAULT_QUEUE_THRESHOLD: usize = 8;

/// Available scheduling strategies, resolved at stage parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Rotate claims across the ready set.
    FairRoundRobin,
    /// Decline claims from overloaded workers.
    BackpressureAware,
    /// Round-robin that may split shards running well past their SLO.
    HotShardSplitter,
}

impl SchedulerKind {
    /// Builds a fresh stateful scheduler for this kind.
    #[must_use]
    pub fn build(self) -> Box<dyn ShardScheduler> {
        match self {
            Self::FairRoundRobin => Box::new(FairRoundRobin::default()),
            Self::BackpressureAware => Box::new(BackpressureAware::default()),
            Self::HotShardSplitter => Box::new(HotShardSplitter::default()),
        }
    }

    /// Returns the wire name of this strategy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FairRoundRobin => "fair_round_robin",
            Self::BackpressureAware => "backpressure_aware",
            Self::HotShardSplitter => "hot_shard_splitter",
        }
    }
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker-reported state used for scheduling decisions.
#[derive(Debug, Clone)]
pub struct WorkerState {
    /// The claiming worker.
    pub worker_id: WorkerId,
    /// Shards currently queued or executing on the worker.
    pub queue_depth: usize,
    /// Queue depth past which backpressure-aware scheduling declines.
    pub queue_threshold: usize,
}

impl WorkerState {
    /// Creates worker state with an empty queue and the default threshold.
    #[must_use]
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            queue_depth: 0,
            queue_threshold: DEFAULT_QUEUE_THRESHOLD,
        }
    }
}

/// Chooses the next shard for a worker to claim.
pub trait ShardScheduler: Send {
    /// Returns the index into `ready` of the shard to claim, or `None`
    /// to decline. Only `Pending` shards may be returned.
    fn next_shard(&mut self, ready: &[ShardSpec], worker: &WorkerState) -> Option<usize>;

    /// Feeds an observed attempt duration. Returns an advisory signal
    /// when the strategy wants one emitted.
    fn observe(&mut self, duration_ms: u64, slo_ms: u64) -> Option<SignalType> {
        let _ = (duration_ms, slo_ms);
        None
    }

    /// Splits a pending shard into finer replacements. Only the
    /// hot-shard strategy ever returns `Some`; replacements carry fresh
    /// cas_ids and the original shard is discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if replacement shard identity cannot be computed.
    fn split(&mut self, spec: &ShardSpec) -> Result<Option<Vec<ShardSpec>>> {
        let _ = spec;
        Ok(None)
    }
}

fn pick_from(ready: &[ShardSpec], start: usize) -> Option<usize> {
    if ready.is_empty() {
        return None;
    }
    (0..ready.len())
        .map(|offset| (start + offset) % ready.len())
        .find(|&idx| ready[idx].phase == ShardPhase::Pending)
}

/// Rotates a cursor across the ready set so no shard starves behind
/// earlier entries.
#[derive(Debug, Default)]
struct FairRoundRobin {
    cursor: usize,
}

impl ShardScheduler for FairRoundRobin {
    fn next_shard(&mut self, ready: &[ShardSpec], _worker: &WorkerState) -> Option<usize> {
        let idx = pick_from(ready, self.cursor)?;
        self.cursor = idx.wrapping_add(1);
        Some(idx)
    }
}

/// Declines claims from workers whose reported queue depth exceeds their
/// threshold; otherwise behaves like round-robin.
#[derive(Debug, Default)]
struct BackpressureAware {
    cursor: usize,
}

impl ShardScheduler for BackpressureAware {
    fn next_shard(&mut self, ready: &[ShardSpec], worker: &WorkerState) -> Option<usize> {
        if worker.queue_depth > worker.queue_threshold {
            return None;
        }
        let idx = pick_from(ready, self.cursor)?;
        self.cursor = idx.wrapping_add(1);
        Some(idx)
    }
}

/// Round-robin that watches observed durations and, once the stage runs
/// hot, splits pending shards with divisible inputs into halves.
#[derive(Debug, Default)]
struct HotShardSplitter {
    cursor: usize,
    hot: bool,
}

/// Input keys whose array values represent divisible work.
const SPLITTABLE_KEYS: &[&str] = &["files", "statements", "routes", "assets", "nodes", "modules"];

impl HotShardSplitter {
    fn splittable_key(inputs: &Value) -> Option<&'static str> {
        SPLITTABLE_KEYS.iter().copied().find(|key| {
            inputs
                .get(key)
                .and_then(Value::as_array)
                .is_some_and(|arr| arr.len() >= 2)
        })
    }
}

impl ShardScheduler for HotShardSplitter {
    fn next_shard(&mut self, ready: &[ShardSpec], _worker: &WorkerState) -> Option<usize> {
        let idx = pick_from(ready, self.cursor)?;
        self.cursor = idx.wrapping_add(1);
        Some(idx)
    }

    #[allow(clippy::cast_precision_loss)]
    fn observe(&mut self, duration_ms: u64, slo_ms: u64) -> Option<SignalType> {
        if slo_ms > 0 && duration_ms as f64 > slo_ms as f64 * HOT_FACTOR {
            self.hot = true;
            return Some(SignalType::Hotspot);
        }
        None
    }

    fn split(&mut self, spec: &ShardSpec) -> Result<Option<Vec<ShardSpec>>> {
        if !self.hot || spec.phase != ShardPhase::Pending {
            return Ok(None);
        }
        let Some(key) = Self::splittable_key(&spec.inputs) else {
            return Ok(None);
        };
        let Some(items) = spec.inputs.get(key).and_then(Value::as_array) else {
            return Ok(None);
        };

        let mid = items.len() / 2;
        let halves = [&items[..mid], &items[mid..]];

        let mut replacements = Vec::with_capacity(2);
        for half in halves {
            let mut inputs = spec.inputs.clone();
            if let Some(slot) = inputs.get_mut(key) {
                *slot = Value::Array(half.to_vec());
            }
            replacements.push(ShardSpec::new(
                spec.stage_id.clone(),
                spec.executor,
                inputs,
                spec.dependencies.clone(),
            )?);
        }
        Ok(Some(replacements))
    }
}
