//! Content-addressed, shard-based work execution engine.
//!
//! `hypshard-engine` takes a declarative plan of ordered stages,
//! partitions each stage's workload into content-addressed shards,
//! schedules their execution across a cooperative worker pool, and
//! certifies the aggregate outcome with a Merkle commitment so results
//! can be audited or sampled without re-execution. Every transition
//! mirrors through a checkpoint store, letting an in-flight plan survive
//! a process restart.
//!
//! # Architecture
//!
//! - [`plan`]: plan and stage definitions, validation, derived status
//! - [`shard`]: content addressing and the shard lifecycle state machine
//! - [`partition`] / [`schedule`] / [`executor`]: pluggable strategies
//!   resolved per stage
//! - [`orchestrator`]: drives plans from submission to a certified root
//! - [`merkle`]: result aggregation, inclusion proofs, sampled auditing
//! - [`checkpoint`] / [`rehydrate`]: crash-recoverable persistence
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hypshard_engine::prelude::*;
//!
//! # async fn demo() -> hypshard_engine::Result<()> {
//! let orchestrator = Arc::new(Orchestrator::new(
//!     Arc::new(InMemoryCheckpointer::new()),
//!     ExecutorRegistry::simulated(),
//!     None,
//! ));
//!
//! let stage = Stage::new(
//!     "pack",
//!     "deploy.pack",
//!     PartitionerKind::ByModule,
//!     ExecutorKind::PackBackend,
//! );
//! let plan = Plan::new("release", vec![stage], PlanConstraints::default(), "ci");
//!
//! let plan_id = orchestrator.submit_plan(plan).await?;
//! let status = orchestrator.run_to_completion(plan_id, 4).await?;
//! println!("root: {:?}", status.merkle_root);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod checkpoint;
pub mod dag;
pub mod error;
pub mod executor;
pub mod merkle;
pub mod metrics;
pub mod orchestrator;
pub mod partition;
pub mod plan;
pub mod rehydrate;
pub mod schedule;
pub mod shard;

pub use error::{Error, Result};

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use crate::checkpoint::memory::InMemoryCheckpointer;
    pub use crate::checkpoint::{CasOutcome, Checkpointer};
    pub use crate::error::{Error, Result};
    pub use crate::executor::{Executor, ExecutorKind, ExecutorRegistry, SimulatedExecutor};
    pub use crate::merkle::{MerkleProof, MerkleTree, verify_proof};
    pub use crate::orchestrator::{Certifier, CertificationSummary, Orchestrator};
    pub use crate::partition::PartitionerKind;
    pub use crate::plan::{
        AutotuneSignal, Plan, PlanConstraints, PlanState, PlanStatus, SignalType, Stage,
        StageState,
    };
    pub use crate::rehydrate::Rehydrator;
    pub use crate::schedule::{SchedulerKind, WorkerState};
    pub use crate::shard::{ShardPhase, ShardResult, ShardSpec};
    pub use hypshard_core::{PlanId, WorkerId};
}
