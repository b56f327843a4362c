//! Error types for the grain directory.
//!
//! Stale ownership is not an error: partitions answer with
//! [`DirectoryResult::RefreshRequired`](crate::DirectoryResult) and the
//! caller refreshes its view. The errors below are what remains once the
//! routing loop has absorbed everything it can retry.

use thiserror::Error;

use crate::types::{GrainId, SiloAddress};

/// Errors returned by the transport when invoking a remote partition or
/// directory client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// The target rejected the message or could not be reached.
    ///
    /// This usually means the silo has been declared dead. Callers retry
    /// with backoff.
    #[error("message to {silo} rejected")]
    Rejected {
        /// The silo that rejected the call.
        silo: SiloAddress,
    },

    /// The call failed in a way that retrying will not fix.
    #[error("rpc failed: {reason}")]
    Failed {
        /// Human-readable failure description.
        reason: String,
    },
}

impl RpcError {
    /// Whether the routing loop may retry after this error.
    pub fn is_retriable(&self) -> bool {
        matches!(self, RpcError::Rejected { .. })
    }
}

/// Errors surfaced to directory callers.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Client and system-target identities are not directory-managed.
    #[error("grain {grain_id} cannot be registered in the grain directory")]
    UnsupportedGrainType {
        /// The rejected identity.
        grain_id: GrainId,
    },

    /// The owning silo stayed unreachable for the whole retry budget.
    #[error("directory partition on {silo} unreachable after {attempts} attempts")]
    RemoteUnreachable {
        /// The last silo the operation was routed to.
        silo: SiloAddress,
        /// Number of rejected attempts.
        attempts: u32,
    },

    /// The caller cancelled the operation or the directory is stopping.
    #[error("directory operation cancelled")]
    Cancelled,

    /// The transport failed in a non-retriable way.
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
}

/// Errors from validating a [`DirectoryConfig`](crate::DirectoryConfig).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// At least one virtual partition per silo is required.
    #[error("partitions_per_silo must be at least 1")]
    NoPartitions,

    /// At least one attempt per operation is required.
    #[error("max_attempts must be at least 1")]
    NoAttempts,

    /// Backoff must not shrink between attempts.
    #[error("backoff_multiplier must be >= 1.0, got {0}")]
    ShrinkingBackoff(f64),
}
