//! Identifier newtypes for plans and workers.
//!
//! Both wrap a ULID, so an id carries its creation instant and sorts
//! chronologically as a plain string. The newtypes exist so a worker id
//! can never be handed to an API expecting a plan id; everything else
//! (`Display`, `FromStr`, serde as a bare string) passes through to the
//! ULID.
//!
//! # Example
//!
//! ```rust
//! use hypshard_core::id::PlanId;
//!
//! let first = PlanId::generate();
//! let reparsed: PlanId = first.to_string().parse().unwrap();
//! assert_eq!(first, reparsed);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Identifies one submitted plan for its whole lifetime, across
/// checkpoints and process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(Ulid);

impl PlanId {
    /// Mints a fresh plan id. Safe to call from any number of processes
    /// at once; no coordination is involved.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Wraps an existing ULID as a plan id.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// The instant this id was minted, recovered from the ULID's
    /// timestamp component.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = self.0.timestamp_ms();
        chrono::DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PlanId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid plan ID '{s}': {e}"),
            })
    }
}

/// Identifies a worker holding shard claims.
///
/// Claim ownership is advisory; rehydration discards stale claims, so a
/// worker id only needs to be unique within the pool's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Ulid);

impl WorkerId {
    /// Mints a fresh worker id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Wraps an existing ULID as a worker id.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid worker ID '{s}': {e}"),
            })
    }
}
