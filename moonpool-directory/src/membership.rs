//! Membership provider: tracks which silos are in the cluster.
//!
//! The [`MembershipProvider`] trait gives the directory a view of the
//! current cluster topology as an ordered stream of snapshots. The directory
//! never detects failures itself; it only consumes what the provider
//! publishes.
//!
//! # Design
//!
//! - `MembershipProvider` is a trait so implementations can range from a
//!   shared in-process table (tests, single process) to a gossip-based
//!   protocol (production).
//! - [`SharedMembership`] is an in-memory implementation every silo in one
//!   process can share, so all of them observe the same versions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::types::{MembershipVersion, SiloAddress};

/// Status of a silo in the cluster.
///
/// Follows the Orleans silo lifecycle: silos join, become active,
/// and eventually shut down or are declared dead by failure detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SiloStatus {
    /// Silo is joining the cluster (announced but not yet ready to serve).
    Joining,
    /// Silo is fully operational and owns directory ranges.
    Active,
    /// Silo is gracefully shutting down (handing off its ranges).
    ShuttingDown,
    /// Silo is no longer reachable (crashed or completed shutdown).
    Dead,
}

impl fmt::Display for SiloStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joining => write!(f, "Joining"),
            Self::Active => write!(f, "Active"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Dead => write!(f, "Dead"),
        }
    }
}

/// A single member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Address of this member.
    pub silo: SiloAddress,
    /// Current lifecycle status.
    pub status: SiloStatus,
    /// Human-readable name (for logging/debugging).
    pub name: String,
}

impl ClusterMember {
    /// Create a new cluster member.
    pub fn new(silo: SiloAddress, status: SiloStatus, name: impl Into<String>) -> Self {
        Self {
            silo,
            status,
            name: name.into(),
        }
    }

    /// Check if this member is in a status where it owns directory ranges.
    pub fn is_active(&self) -> bool {
        self.status == SiloStatus::Active
    }
}

/// Immutable snapshot of cluster membership at a specific version.
#[derive(Debug, Clone, Default)]
pub struct ClusterMembershipSnapshot {
    /// All known members, keyed by silo address.
    pub members: HashMap<SiloAddress, ClusterMember>,
    /// Version of this snapshot (monotonically increasing).
    pub version: MembershipVersion,
}

impl ClusterMembershipSnapshot {
    /// Create an empty snapshot at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all active member addresses, in no particular order.
    pub fn active_members(&self) -> Vec<SiloAddress> {
        self.members
            .values()
            .filter(|m| m.is_active())
            .map(|m| m.silo.clone())
            .collect()
    }

    /// Get a specific member by address.
    pub fn get_member(&self, silo: &SiloAddress) -> Option<&ClusterMember> {
        self.members.get(silo)
    }

    /// Get the status of a specific member, or `None` if unknown.
    pub fn get_status(&self, silo: &SiloAddress) -> Option<SiloStatus> {
        self.members.get(silo).map(|m| m.status)
    }

    /// Whether the silo has been declared dead.
    ///
    /// Silos unknown to this snapshot are not considered dead.
    pub fn is_dead(&self, silo: &SiloAddress) -> bool {
        self.get_status(silo) == Some(SiloStatus::Dead)
    }

    /// Members whose status differs from `previous` (including new members).
    pub fn changes_since(&self, previous: &ClusterMembershipSnapshot) -> Vec<ClusterMember> {
        self.members
            .values()
            .filter(|m| previous.get_status(&m.silo) != Some(m.status))
            .cloned()
            .collect()
    }
}

/// Errors from membership operations.
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    /// The silo was not found in the membership.
    #[error("silo not found: {address}")]
    NotFound {
        /// The address that was not found.
        address: SiloAddress,
    },
}

/// Source of cluster membership snapshots.
///
/// # Orleans Reference
///
/// Combines aspects of Orleans' `IClusterMembershipService` (read
/// snapshot, subscribe to updates, refresh) and `MembershipAgent` (status
/// transitions for the local silo).
#[async_trait::async_trait]
pub trait MembershipProvider: fmt::Debug + Send + Sync {
    /// The latest snapshot known to this provider.
    fn snapshot(&self) -> Arc<ClusterMembershipSnapshot>;

    /// Subscribe to snapshots. The receiver always holds the latest one.
    fn subscribe(&self) -> watch::Receiver<Arc<ClusterMembershipSnapshot>>;

    /// Ask the provider to fetch a newer snapshot.
    ///
    /// This is a hint: it returns without waiting for the snapshot to be
    /// published. `target` is the version the caller knows to exist.
    async fn refresh(&self, target: Option<MembershipVersion>);

    /// Register a silo into the cluster with the given status.
    ///
    /// If the silo is already registered, its status is updated.
    /// The membership version is bumped on every change.
    async fn register_node(
        &self,
        silo: SiloAddress,
        status: SiloStatus,
        name: String,
    ) -> Result<MembershipVersion, MembershipError>;

    /// Update the status of an already-registered silo.
    ///
    /// Returns the new membership version, or an error if the silo is
    /// not registered.
    async fn update_status(
        &self,
        silo: &SiloAddress,
        status: SiloStatus,
    ) -> Result<MembershipVersion, MembershipError>;
}

/// Shared in-memory membership.
///
/// All silos in one process can share the same `Arc<SharedMembership>`,
/// giving them a consistent view of the cluster. Every change bumps the
/// version and is published to subscribers immediately.
///
/// # Example
///
/// ```rust,ignore
/// let membership = SharedMembership::new();
/// membership.register_node(silo_a, SiloStatus::Active, "a".into()).await?;
/// membership.register_node(silo_b, SiloStatus::Active, "b".into()).await?;
/// assert_eq!(membership.snapshot().active_members().len(), 2);
///
/// membership.update_status(&silo_a, SiloStatus::Dead).await?;
/// assert_eq!(membership.snapshot().active_members().len(), 1);
/// ```
#[derive(Debug)]
pub struct SharedMembership {
    inner: Mutex<ClusterMembershipSnapshot>,
    updates: watch::Sender<Arc<ClusterMembershipSnapshot>>,
}

impl SharedMembership {
    /// Create a new empty shared membership.
    pub fn new() -> Self {
        let (updates, _) = watch::channel(Arc::new(ClusterMembershipSnapshot::new()));
        Self {
            inner: Mutex::new(ClusterMembershipSnapshot::new()),
            updates,
        }
    }

    /// Create a shared membership pre-populated with active members.
    ///
    /// Each address is registered as `Active` with an auto-generated name,
    /// and the version equals the number of members.
    pub fn with_members(silos: Vec<SiloAddress>) -> Self {
        let membership = Self::new();
        for silo in silos {
            membership.set_status(silo, SiloStatus::Active, None);
        }
        membership
    }

    /// Add an active member (no-op if already present).
    pub fn add_member(&self, silo: SiloAddress) {
        if self.inner.lock().members.contains_key(&silo) {
            return;
        }
        self.set_status(silo, SiloStatus::Active, None);
    }

    /// Declare a member dead. Returns the new version, if the member existed.
    pub fn declare_dead(&self, silo: &SiloAddress) -> Option<MembershipVersion> {
        if !self.inner.lock().members.contains_key(silo) {
            return None;
        }
        Some(self.set_status(silo.clone(), SiloStatus::Dead, None))
    }

    fn set_status(
        &self,
        silo: SiloAddress,
        status: SiloStatus,
        name: Option<String>,
    ) -> MembershipVersion {
        let published = {
            let mut inner = self.inner.lock();
            inner.version = inner.version.next();
            let name = match name {
                Some(name) => name,
                None => match inner.members.get(&silo) {
                    Some(existing) => existing.name.clone(),
                    None => format!("silo-{}", inner.members.len()),
                },
            };
            inner
                .members
                .insert(silo.clone(), ClusterMember::new(silo, status, name));
            Arc::new(inner.clone())
        };
        let version = published.version;
        // Versions are assigned under the lock but published outside it, so
        // never let an older snapshot replace a newer one.
        self.updates.send_if_modified(|current| {
            if published.version > current.version {
                *current = published;
                true
            } else {
                false
            }
        });
        version
    }
}

impl Default for SharedMembership {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MembershipProvider for SharedMembership {
    fn snapshot(&self) -> Arc<ClusterMembershipSnapshot> {
        self.updates.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Arc<ClusterMembershipSnapshot>> {
        self.updates.subscribe()
    }

    async fn refresh(&self, _target: Option<MembershipVersion>) {
        // Every change is published as soon as it is made.
    }

    async fn register_node(
        &self,
        silo: SiloAddress,
        status: SiloStatus,
        name: String,
    ) -> Result<MembershipVersion, MembershipError> {
        Ok(self.set_status(silo, status, Some(name)))
    }

    async fn update_status(
        &self,
        silo: &SiloAddress,
        status: SiloStatus,
    ) -> Result<MembershipVersion, MembershipError> {
        if !self.inner.lock().members.contains_key(silo) {
            return Err(MembershipError::NotFound {
                address: silo.clone(),
            });
        }
        Ok(self.set_status(silo.clone(), status, None))
    }
}
