//! # hypshard-core
//!
//! Core abstractions shared across the hypshard execution engine.
//!
//! This crate provides the foundational types used by every component:
//!
//! - **Identifiers**: Strongly-typed IDs for plans and workers
//! - **Canonical JSON**: Deterministic serialization for content addressing
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `hypshard-core` is the only crate allowed to define shared primitives.
//! The engine crate builds on top of these and never redefines them.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod canonical_json;
pub mod error;
pub mod id;

pub use error::{Error, Result};
pub use id::{PlanId, WorkerId};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::canonical_json::{to_canonical_bytes, to_canonical_string};
    pub use crate::error::{Error, Result};
    pub use crate::id::{PlanId, WorkerId};
}
