//! Ring partitioning derived from one membership snapshot.
//!
//! # Design
//!
//! Each active silo contributes `P` points on the 32-bit ring, derived from
//! its address. The points of all silos are sorted together; every point
//! owns the range that ends at it, `(previous point, point]`. Because the
//! computation only depends on the membership snapshot and `P`, every silo
//! that has seen the same version agrees on every owner.
//!
//! # Orleans Reference
//!
//! Mirrors `DirectoryMembershipSnapshot` from Orleans 9's distributed grain
//! directory.

use std::fmt;
use std::sync::Arc;

use crate::config::DEFAULT_PARTITIONS_PER_SILO;
use crate::directory::rpc::{DirectoryTransport, PartitionRef};
use crate::membership::ClusterMembershipSnapshot;
use crate::ring::{RingRange, RingRangeCollection};
use crate::types::{GrainId, MembershipVersion, SiloAddress};

/// One slot of the ring: the partition owning the range ending at `point`.
#[derive(Debug, Clone, Copy)]
struct RingEntry {
    point: u32,
    member_index: usize,
    partition_index: usize,
    range: RingRange,
}

/// The partition owning a point on the ring.
#[derive(Clone)]
pub struct RingOwner {
    /// Silo hosting the partition.
    pub silo: SiloAddress,
    /// Index of the partition on that silo.
    pub partition_index: usize,
    /// Endpoint to dispatch partition RPCs to.
    pub partition: PartitionRef,
}

impl fmt::Debug for RingOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingOwner")
            .field("silo", &self.silo)
            .field("partition_index", &self.partition_index)
            .finish()
    }
}

/// A ring range together with the partition owning it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRange {
    /// Silo hosting the partition.
    pub silo: SiloAddress,
    /// Index of the partition on that silo.
    pub partition_index: usize,
    /// The range owned by the partition. Empty on a point collision.
    pub range: RingRange,
}

/// Immutable assignment of the ring to the active members of one
/// membership version.
pub struct DirectoryMembershipSnapshot {
    cluster: Arc<ClusterMembershipSnapshot>,
    partitions_per_silo: usize,
    members: Vec<SiloAddress>,
    entries: Vec<RingEntry>,
    partition_refs: Vec<Vec<PartitionRef>>,
    member_ranges: Vec<RingRangeCollection>,
}

impl DirectoryMembershipSnapshot {
    /// Partition the ring among the active members of `cluster`.
    pub fn new(
        cluster: Arc<ClusterMembershipSnapshot>,
        partitions_per_silo: usize,
        transport: &dyn DirectoryTransport,
    ) -> Self {
        let mut members = cluster.active_members();
        members.sort();

        let mut entries = Vec::with_capacity(members.len() * partitions_per_silo);
        for (member_index, silo) in members.iter().enumerate() {
            for (partition_index, point) in silo
                .uniform_hashes(partitions_per_silo)
                .into_iter()
                .enumerate()
            {
                entries.push(RingEntry {
                    point,
                    member_index,
                    partition_index,
                    range: RingRange::EMPTY,
                });
            }
        }
        entries.sort_by_key(|e| (e.point, e.partition_index, e.member_index));

        let n = entries.len();
        if n == 1 {
            entries[0].range = RingRange::FULL;
        } else if n > 1 {
            let points: Vec<u32> = entries.iter().map(|e| e.point).collect();
            for (i, entry) in entries.iter_mut().enumerate() {
                let previous = points[(i + n - 1) % n];
                entry.range = RingRange::new(previous, points[i]);
            }
            // Every point collided: the first entry still has to own the ring.
            if points[0] == points[n - 1] {
                entries[0].range = RingRange::FULL;
            }
        }

        let partition_refs = members
            .iter()
            .map(|silo| {
                (0..partitions_per_silo)
                    .map(|index| transport.partition(silo, index))
                    .collect()
            })
            .collect();

        let member_ranges = (0..members.len())
            .map(|member_index| {
                RingRangeCollection::create(
                    entries
                        .iter()
                        .filter(|e| e.member_index == member_index)
                        .map(|e| e.range),
                )
            })
            .collect();

        Self {
            cluster,
            partitions_per_silo,
            members,
            entries,
            partition_refs,
            member_ranges,
        }
    }

    /// Membership version this snapshot was built from.
    pub fn version(&self) -> MembershipVersion {
        self.cluster.version
    }

    /// Active members, sorted.
    pub fn members(&self) -> &[SiloAddress] {
        &self.members
    }

    /// The cluster snapshot this view was derived from.
    pub fn cluster(&self) -> &Arc<ClusterMembershipSnapshot> {
        &self.cluster
    }

    /// Number of partitions per member.
    pub fn partitions_per_silo(&self) -> usize {
        self.partitions_per_silo
    }

    /// Whether `silo` is part of the ring.
    pub fn is_member(&self, silo: &SiloAddress) -> bool {
        self.member_index(silo).is_some()
    }

    /// The partition owning `grain_id`, if the ring has any member.
    pub fn try_get_owner(&self, grain_id: &GrainId) -> Option<RingOwner> {
        self.try_get_owner_by_hash(grain_id.uniform_hash())
    }

    /// The partition owning `hash`, if the ring has any member.
    pub fn try_get_owner_by_hash(&self, hash: u32) -> Option<RingOwner> {
        if self.entries.is_empty() {
            return None;
        }

        let mut index = self.entries.partition_point(|e| e.point < hash);
        if index == self.entries.len() {
            index = 0;
        }
        let entry = &self.entries[index];
        Some(RingOwner {
            silo: self.members[entry.member_index].clone(),
            partition_index: entry.partition_index,
            partition: Arc::clone(&self.partition_refs[entry.member_index][entry.partition_index]),
        })
    }

    /// Everything `silo` owns. Empty if it is not a member.
    pub fn member_ranges(&self, silo: &SiloAddress) -> RingRangeCollection {
        self.member_index(silo)
            .map(|index| self.member_ranges[index].clone())
            .unwrap_or_default()
    }

    /// The range owned by `silo`'s partition `partition_index`.
    pub fn partition_range(&self, silo: &SiloAddress, partition_index: usize) -> RingRange {
        let Some(member_index) = self.member_index(silo) else {
            return RingRange::EMPTY;
        };
        self.entries
            .iter()
            .find(|e| e.member_index == member_index && e.partition_index == partition_index)
            .map(|e| e.range)
            .unwrap_or(RingRange::EMPTY)
    }

    /// Every partition and its range, in ring order.
    pub fn partition_ranges(&self) -> impl Iterator<Item = PartitionRange> + '_ {
        self.entries.iter().map(|e| PartitionRange {
            silo: self.members[e.member_index].clone(),
            partition_index: e.partition_index,
            range: e.range,
        })
    }

    /// Endpoint of `silo`'s partition `partition_index`, if `silo` is a member.
    pub fn partition_ref(&self, silo: &SiloAddress, partition_index: usize) -> Option<PartitionRef> {
        let member_index = self.member_index(silo)?;
        self.partition_refs[member_index]
            .get(partition_index)
            .cloned()
    }

    fn member_index(&self, silo: &SiloAddress) -> Option<usize> {
        self.members.binary_search(silo).ok()
    }
}

impl Default for DirectoryMembershipSnapshot {
    fn default() -> Self {
        Self {
            cluster: Arc::new(ClusterMembershipSnapshot::new()),
            partitions_per_silo: DEFAULT_PARTITIONS_PER_SILO,
            members: Vec::new(),
            entries: Vec::new(),
            partition_refs: Vec::new(),
            member_ranges: Vec::new(),
        }
    }
}

impl fmt::Debug for DirectoryMembershipSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryMembershipSnapshot")
            .field("version", &self.version())
            .field("members", &self.members)
            .field("partitions_per_silo", &self.partitions_per_silo)
            .finish()
    }
}
