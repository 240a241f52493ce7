//! Shared error types for hypshard components.

/// The result type used throughout hypshard-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier failed to parse.
    #[error("invalid ID: {message}")]
    InvalidId {
        /// Description of the parse failure.
        message: String,
    },

    /// Canonical serialization failed.
    #[error("canonical JSON error: {0}")]
    CanonicalJson(#[from] crate::canonical_json::CanonicalJsonError),
}
