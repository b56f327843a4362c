//! Message contracts between silos.
//!
//! Every directory partition and every silo's directory client is reached
//! through an object-safe async trait. The transport decides whether a call
//! stays in-process or crosses the network; the directory only sees
//! [`RpcError`] when the target could not be reached.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::ring::RingRange;
use crate::types::{GrainAddress, GrainId, MembershipVersion, SiloAddress};

/// Outcome of a fenced partition operation.
///
/// Either a real answer computed under `version`, or a request to retry once
/// the caller has caught up with the partition's view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryResult<T> {
    /// The partition owned the grain and executed the operation.
    Ok {
        /// Operation result.
        value: T,
        /// View under which the operation ran.
        version: MembershipVersion,
    },
    /// The partition is not the owner under its latest view.
    RefreshRequired {
        /// The partition's view, which the caller must reach before retrying.
        version: MembershipVersion,
    },
}

impl<T> DirectoryResult<T> {
    /// A successful result.
    pub fn ok(value: T, version: MembershipVersion) -> Self {
        DirectoryResult::Ok { value, version }
    }

    /// A stale-view result.
    pub fn refresh_required(version: MembershipVersion) -> Self {
        DirectoryResult::RefreshRequired { version }
    }

    /// The membership version carried by the result.
    pub fn version(&self) -> MembershipVersion {
        match self {
            DirectoryResult::Ok { version, .. } | DirectoryResult::RefreshRequired { version } => {
                *version
            }
        }
    }

    /// Extract the value if it was computed under `view_version`.
    ///
    /// Otherwise returns the version the caller has to refresh to.
    pub fn try_get_result(self, view_version: MembershipVersion) -> Result<T, MembershipVersion> {
        match self {
            DirectoryResult::Ok { value, version } if version == view_version => Ok(value),
            other => Err(other.version()),
        }
    }
}

/// A bulk transfer of the records in a sealed range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    /// Records held by the previous owner.
    pub entries: Vec<(GrainId, GrainAddress)>,
}

/// RPC surface of one (silo, partition index) directory partition.
#[async_trait::async_trait]
pub trait GrainDirectoryPartitionRpc: fmt::Debug + Send + Sync {
    /// Register `address`, replacing `previous` if it is the stored record.
    async fn register(
        &self,
        version: MembershipVersion,
        address: GrainAddress,
        previous: Option<GrainAddress>,
    ) -> Result<DirectoryResult<GrainAddress>, RpcError>;

    /// Look up the record for `grain_id`.
    async fn lookup(
        &self,
        version: MembershipVersion,
        grain_id: GrainId,
    ) -> Result<DirectoryResult<Option<GrainAddress>>, RpcError>;

    /// Remove `address` if it is the stored record.
    async fn deregister(
        &self,
        version: MembershipVersion,
        address: GrainAddress,
    ) -> Result<DirectoryResult<bool>, RpcError>;

    /// Fetch the records this partition sealed when it lost `range`.
    ///
    /// `version` is the view in which the caller gained the range and
    /// `range_version` the view in which this partition still owned it.
    async fn get_snapshot(
        &self,
        version: MembershipVersion,
        range_version: MembershipVersion,
        range: RingRange,
    ) -> Result<Option<PartitionSnapshot>, RpcError>;

    /// Confirm that `silo`'s partition applied the snapshot for `version`.
    async fn acknowledge_snapshot_transfer(
        &self,
        silo: SiloAddress,
        partition_index: usize,
        version: MembershipVersion,
    ) -> Result<bool, RpcError>;
}

/// RPC surface of a silo's directory client, used during recovery.
#[async_trait::async_trait]
pub trait GrainDirectoryClientRpc: fmt::Debug + Send + Sync {
    /// Report the directory-managed activations hosted by this silo whose
    /// grain hashes fall in `range`.
    async fn get_registered_activations(
        &self,
        version: MembershipVersion,
        range: RingRange,
        is_validation: bool,
    ) -> Result<Vec<GrainAddress>, RpcError>;

    /// Like [`get_registered_activations`](Self::get_registered_activations),
    /// but first tells local partitions that `silo`'s partition
    /// `partition_index` is rebuilding from scratch.
    async fn recover_registered_activations(
        &self,
        version: MembershipVersion,
        range: RingRange,
        silo: SiloAddress,
        partition_index: usize,
    ) -> Result<Vec<GrainAddress>, RpcError>;
}

/// Shared reference to a partition endpoint.
pub type PartitionRef = Arc<dyn GrainDirectoryPartitionRpc>;

/// Shared reference to a directory client endpoint.
pub type ClientRef = Arc<dyn GrainDirectoryClientRpc>;

/// Resolves silo endpoints and hosts the local ones.
pub trait DirectoryTransport: fmt::Debug + Send + Sync {
    /// Reference to partition `partition_index` on `silo`.
    ///
    /// Resolution never fails; calls through the reference fail with
    /// [`RpcError::Rejected`] while the target is unreachable.
    fn partition(&self, silo: &SiloAddress, partition_index: usize) -> PartitionRef;

    /// Reference to `silo`'s directory client.
    fn client(&self, silo: &SiloAddress) -> ClientRef;

    /// Make `silo`'s endpoints reachable.
    fn attach(&self, silo: &SiloAddress, client: ClientRef, partitions: Vec<PartitionRef>);

    /// Stop routing calls to `silo`.
    fn detach(&self, silo: &SiloAddress);
}
