//! Error types for the execution engine.

use hypshard_core::PlanId;

/// The result type used throughout hypshard-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A submitted plan failed validation (cyclic or dangling dependencies).
    #[error("plan validation failed: {message}")]
    PlanValidation {
        /// Description of the validation failure.
        message: String,
    },

    /// A stage partitioned into more shards than the plan allows.
    #[error("stage {stage_id} produced {shards} shards, exceeding max_shards={max_shards}")]
    CapacityExceeded {
        /// The stage that exceeded capacity.
        stage_id: String,
        /// Number of shards produced.
        shards: usize,
        /// The plan-level shard cap.
        max_shards: usize,
    },

    /// The plan exceeded its overall timebox.
    #[error("plan {plan_id} exceeded timebox of {timebox_ms}ms")]
    Timeout {
        /// The plan that timed out.
        plan_id: PlanId,
        /// The configured timebox in milliseconds.
        timebox_ms: u64,
    },

    /// A shard executor failed.
    #[error("executor failed: {message}")]
    Executor {
        /// Description of the failure.
        message: String,
    },

    /// A checkpoint write failed. The triggering operation must not make
    /// its phase transition externally visible.
    #[error("checkpoint write failed: {message}")]
    CheckpointWrite {
        /// Description of the write failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An invalid shard phase transition was attempted.
    #[error("invalid phase transition: {from} -> {to} ({reason})")]
    InvalidPhaseTransition {
        /// The current phase.
        from: String,
        /// The attempted target phase.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A plan was not found.
    #[error("plan not found: {plan_id}")]
    PlanNotFound {
        /// The plan ID that was not found.
        plan_id: PlanId,
    },

    /// A shard was not found.
    #[error("shard not found: {cas_id}")]
    ShardNotFound {
        /// The CAS id that was not found.
        cas_id: String,
    },

    /// An unknown strategy name was used in a stage definition.
    #[error("unknown {registry} strategy: {name}")]
    UnknownStrategy {
        /// Which registry was consulted (partitioner/scheduler/executor).
        registry: &'static str,
        /// The unrecognized strategy name.
        name: String,
    },

    /// An error from hypshard-core.
    #[error("core error: {0}")]
    Core(#[from] hypshard_core::Error),
}

impl Error {
    /// Creates a new checkpoint write error.
    #[must_use]
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::CheckpointWrite {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new checkpoint write error with a source.
    #[must_use]
    pub fn checkpoint_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::CheckpointWrite {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new executor error.
    #[must_use]
    pub fn executor(message: impl Into<String>) -> Self {
        Self::Executor {
            message: message.into(),
        }
    }
}

impl From<hypshard_core::canonical_json::CanonicalJsonError> for Error {
    fn from(e: hypshard_core::canonical_json::CanonicalJsonError) -> Self {
        Self::Core(hypshard_core::Error::CanonicalJson(e))
    }
}
