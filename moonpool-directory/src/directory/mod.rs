//! Partitioned grain directory.
//!
//! Maps a grain identity to the silo hosting its single live activation.
//! The identity space is a 32-bit ring split into virtual partitions;
//! every silo hosts its partitions plus a [`DistributedGrainDirectory`]
//! that routes operations to whichever partition owns a grain under the
//! latest membership view.
//!
//! # Orleans Reference
//!
//! Corresponds to Orleans' `IGrainDirectory`:
//! - `Register(GrainAddress, GrainAddress?)` → returns the stored record
//! - `Lookup(GrainId)` → returns `GrainAddress?`
//! - `Unregister(GrainAddress)` → removes only if the activation matches
//! - `UnregisterSilos(List<SiloAddress>)` → batch cleanup on silo death

mod distributed;
mod membership_service;
mod partition;
mod rpc;
mod snapshot;

use std::fmt;

pub use distributed::{DirectoryLifecycle, DistributedGrainDirectory};
pub use membership_service::DirectoryMembershipService;
pub use partition::GrainDirectoryPartition;
pub use rpc::{
    ClientRef, DirectoryResult, DirectoryTransport, GrainDirectoryClientRpc,
    GrainDirectoryPartitionRpc, PartitionRef, PartitionSnapshot,
};
pub use snapshot::{DirectoryMembershipSnapshot, PartitionRange, RingOwner};

use crate::error::DirectoryError;
use crate::types::{GrainAddress, GrainId, SiloAddress};

/// Client-facing directory operations.
///
/// # Register Semantics (Orleans-style)
///
/// `register()` never overwrites a live record:
/// - If no entry exists: registers the new address, returns it
/// - If an entry already exists: returns the existing entry
///
/// The caller compares the returned address with what it tried to
/// register. If the activation differs, another activation won the race.
/// `register_replacing()` overwrites only when the stored record is the
/// given `previous` one (or points at a dead silo).
///
/// Operations return `Ok(None)` rather than failing while no silo is
/// available to own the grain.
#[async_trait::async_trait]
pub trait GrainDirectory: fmt::Debug + Send + Sync {
    /// Look up the current activation of a grain.
    async fn lookup(&self, grain_id: &GrainId) -> Result<Option<GrainAddress>, DirectoryError>;

    /// Register an activation, keeping any existing live record.
    async fn register(&self, address: GrainAddress)
        -> Result<Option<GrainAddress>, DirectoryError>;

    /// Register an activation in place of `previous`.
    async fn register_replacing(
        &self,
        address: GrainAddress,
        previous: Option<GrainAddress>,
    ) -> Result<Option<GrainAddress>, DirectoryError>;

    /// Remove an activation if it is the stored one.
    ///
    /// Succeeds whether or not anything was removed.
    async fn unregister(&self, address: &GrainAddress) -> Result<(), DirectoryError>;

    /// Remove every record pointing at the given silos.
    async fn unregister_silos(&self, silos: &[SiloAddress]) -> Result<(), DirectoryError>;
}
