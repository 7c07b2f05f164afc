//! Error types for the Ferry engine.

use crate::{ComponentId, LookupKey};
use thiserror::Error;

/// All possible errors from the Ferry engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Identity errors
    #[error("identity mismatch: expected '{expected}', got '{got}'")]
    IdentityMismatch {
        expected: LookupKey,
        got: LookupKey,
    },

    #[error("unknown component: {0}")]
    UnknownComponent(ComponentId),

    // Queue errors
    #[error("no queued item for lookup key: {0}")]
    MissingQueueEntry(LookupKey),

    // Adapter errors
    #[error("adapter error: {0}")]
    Adapter(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
