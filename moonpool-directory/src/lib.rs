//! # Moonpool Directory
//!
//! Partitioned grain directory for location-transparent actors.
//!
//! Maps each grain identity to the silo hosting its single live
//! activation. Any silo can register, look up, or remove an activation, and
//! at most one silo is authoritative for a grain at any moment, even while
//! the cluster membership changes.
//!
//! Inspired by the distributed grain directory of
//! [Orleans](https://learn.microsoft.com/dotnet/orleans/).
//!
//! ## Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                DistributedGrainDirectory                    │
//! │   routing + retry • recovery client • lifecycle             │
//! ├──────────────────────────┬──────────────────────────────────┤
//! │  GrainDirectoryPartition │  DirectoryMembershipService      │
//! │  • fenced register/      │  • ring view per membership      │
//! │    lookup/deregister     │    version, latest wins          │
//! │  • range hand-off        │  • refresh to a target version   │
//! ├──────────────────────────┴──────────────────────────────────┤
//! │  DirectoryMembershipSnapshot: ring partitioning, owners     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RingRange / RingRangeCollection: 32-bit ring intervals     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Collaborators sit behind traits: [`MembershipProvider`] feeds membership
//! snapshots, [`DirectoryTransport`] carries partition and client RPCs, and
//! [`LocalActivations`] exposes the activations a silo hosts. In-memory
//! implementations of all three ([`SharedMembership`], [`LocalTransport`],
//! [`InMemoryActivations`]) run a whole cluster inside one process.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use moonpool_directory::*;
//!
//! let membership = Arc::new(SharedMembership::with_members(vec![silo.clone()]));
//! let transport = Arc::new(LocalTransport::new());
//! let activations = Arc::new(InMemoryActivations::new());
//!
//! let directory = DistributedGrainDirectory::new(
//!     silo,
//!     DirectoryConfig::default(),
//!     membership,
//!     transport,
//!     activations,
//! );
//! directory.start();
//!
//! let stored = directory.register(address).await?;
//! ```

#![deny(missing_docs)]

pub mod activations;
pub mod config;
pub mod directory;
pub mod error;
pub mod membership;
pub mod ring;
pub mod transport;
pub mod types;

pub use activations::{DeactivationReason, InMemoryActivations, LocalActivation, LocalActivations};
pub use config::{DirectoryConfig, DirectoryConfigBuilder, DEFAULT_PARTITIONS_PER_SILO};
pub use directory::{
    ClientRef, DirectoryLifecycle, DirectoryMembershipService, DirectoryMembershipSnapshot,
    DirectoryResult, DirectoryTransport, DistributedGrainDirectory, GrainDirectory,
    GrainDirectoryClientRpc, GrainDirectoryPartition, GrainDirectoryPartitionRpc, PartitionRange,
    PartitionRef, PartitionSnapshot, RingOwner,
};
pub use error::{ConfigError, DirectoryError, RpcError};
pub use membership::{
    ClusterMember, ClusterMembershipSnapshot, MembershipError, MembershipProvider,
    SharedMembership, SiloStatus,
};
pub use ring::{RingRange, RingRangeCollection, RING_SIZE};
pub use transport::LocalTransport;
pub use types::{ActivationId, GrainAddress, GrainId, GrainType, MembershipVersion, SiloAddress};
