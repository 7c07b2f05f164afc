//! Failure reporting for sync runs.
//!
//! Every user-visible failure flows through [`SyncFailure`], a
//! `(code, status, message)` triple. Callers interpret well-known codes to
//! drive recovery flows (forced resync, upgrade prompts); that
//! interpretation lives outside this crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Well-known failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureCode {
    /// Network or server failure during fetch or upload; retried by the
    /// next scheduled run
    Network,
    /// Malformed server response or unknown component
    Protocol,
    /// The run was cancelled before completing
    Cancelled,
    /// Server refuses this client version
    ClientTooOld,
    /// Server demands a full re-import
    ResyncRequired,
    /// Too many invalid PIN attempts
    TooManyPinAttempts,
    /// Anything else
    Internal,
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCode::Network => "network",
            FailureCode::Protocol => "protocol",
            FailureCode::Cancelled => "cancelled",
            FailureCode::ClientTooOld => "client_too_old",
            FailureCode::ResyncRequired => "resync_required",
            FailureCode::TooManyPinAttempts => "too_many_pin_attempts",
            FailureCode::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// A failed sync run, as reported through the failure observers.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("sync failure [{code}]: {message}")]
pub struct SyncFailure {
    pub code: FailureCode,
    /// Transport status (e.g. HTTP status) where one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
}

impl SyncFailure {
    pub fn new(code: FailureCode, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code,
            status,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureCode::Network, None, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(FailureCode::Protocol, None, message)
    }

    pub fn cancelled() -> Self {
        Self::new(FailureCode::Cancelled, None, "sync run was cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureCode::Internal, None, message)
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == FailureCode::Cancelled
    }
}

/// Result type alias for sync runs.
pub type Result<T> = std::result::Result<T, SyncFailure>;
