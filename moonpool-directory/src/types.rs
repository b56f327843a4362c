//! Core directory types.
//!
//! These types form the data contract between directory callers, directory
//! partitions and the local activation catalog. All of them are plain values
//! that travel over the wire inside partition RPCs.
//!
//! # Design
//!
//! - `SiloAddress` identifies a cluster member (endpoint + generation).
//! - `GrainId` is `GrainType` + a string key (e.g., "player-42").
//! - `GrainAddress` is what the directory stores: which activation of which
//!   grain lives on which silo, and the view under which it was accepted.
//!
//! # Orleans Reference
//!
//! Mirrors Orleans' `SiloAddress`, `GrainId`, `ActivationId`,
//! `MembershipVersion` and `GrainAddress`.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Monotonically increasing membership version.
///
/// Every membership change (join, status transition, leave) bumps the version.
/// Used to detect stale views and to fence directory operations.
///
/// Version 0 ([`MembershipVersion::MIN`]) is the version of the empty initial
/// view. On a [`GrainAddress`] it means the registration has not been
/// confirmed by the directory yet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MembershipVersion(pub u64);

impl MembershipVersion {
    /// The initial version, also used for unconfirmed registrations.
    pub const MIN: MembershipVersion = MembershipVersion(0);

    /// Create version 0 (initial).
    pub fn new() -> Self {
        Self::MIN
    }

    /// Return the next version.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for MembershipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Address of a cluster member.
///
/// Two processes started on the same endpoint are told apart by their
/// `generation`. Ordering is total (ip, then port, then generation), which
/// makes ring construction deterministic on every silo.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiloAddress {
    /// IP address (IPv4 or IPv6).
    pub ip: IpAddr,
    /// Port number.
    pub port: u16,
    /// Process generation, bumped on every restart at the same endpoint.
    pub generation: u64,
}

impl SiloAddress {
    /// Create a new silo address.
    pub fn new(ip: IpAddr, port: u16, generation: u64) -> Self {
        Self {
            ip,
            port,
            generation,
        }
    }

    /// Derive `count` ring points for this silo.
    ///
    /// Point `i` is a SHA-256 based hash of the silo identity and `i`, so
    /// every silo in the cluster computes the same points for the same member.
    pub fn uniform_hashes(&self, count: usize) -> Vec<u32> {
        let identity = self.to_string();
        (0..count)
            .map(|index| {
                let mut hasher = Sha256::new();
                hasher.update(identity.as_bytes());
                hasher.update((index as u64).to_le_bytes());
                leading_u32(&hasher.finalize())
            })
            .collect()
    }
}

impl fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "S{}:{}@{}", ip, self.port, self.generation),
            IpAddr::V6(ip) => write!(f, "S[{}]:{}@{}", ip, self.port, self.generation),
        }
    }
}

/// Identifies a grain TYPE.
///
/// Types starting with `sys.client` (client identities) or `sys.svc`
/// (system targets) are not placed through the grain directory.
#[derive(Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub struct GrainType(pub String);

impl GrainType {
    const CLIENT_PREFIX: &'static str = "sys.client";
    const SYSTEM_TARGET_PREFIX: &'static str = "sys.svc";

    /// Create a grain type from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The grain type used for client identities.
    pub fn client() -> Self {
        Self(Self::CLIENT_PREFIX.to_string())
    }

    /// A system target type with the given suffix.
    pub fn system_target(name: &str) -> Self {
        Self(format!("{}.{}", Self::SYSTEM_TARGET_PREFIX, name))
    }

    /// Whether this type identifies a client.
    pub fn is_client(&self) -> bool {
        self.0.starts_with(Self::CLIENT_PREFIX)
    }

    /// Whether this type identifies a system target.
    pub fn is_system_target(&self) -> bool {
        self.0.starts_with(Self::SYSTEM_TARGET_PREFIX)
    }

    /// Whether grains of this type can be registered in the directory.
    pub fn is_directory_managed(&self) -> bool {
        !self.is_client() && !self.is_system_target()
    }
}

impl fmt::Display for GrainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Full grain identity = type + key.
///
/// # Examples
///
/// ```rust
/// use moonpool_directory::{GrainId, GrainType};
///
/// let player = GrainId::new(GrainType::new("player"), "player-42");
/// assert_eq!(player.uniform_hash(), player.clone().uniform_hash());
/// ```
#[derive(Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub struct GrainId {
    /// The type of grain.
    pub grain_type: GrainType,
    /// The specific instance key (e.g., "player-42", "account-abc").
    pub key: String,
}

impl GrainId {
    /// Create a new grain ID.
    pub fn new(grain_type: GrainType, key: impl Into<String>) -> Self {
        Self {
            grain_type,
            key: key.into(),
        }
    }

    /// Deterministic, uniformly distributed 32-bit hash of this identity.
    ///
    /// This is the grain's position on the directory ring.
    pub fn uniform_hash(&self) -> u32 {
        let mut hasher = Sha256::new();
        hasher.update(self.grain_type.0.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.key.as_bytes());
        leading_u32(&hasher.finalize())
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.grain_type, self.key)
    }
}

/// Unique identifier for a specific grain activation.
///
/// A grain that is deactivated and activated again gets a new id, which is
/// how the directory tells a stale registration from a current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationId(pub u64);

impl ActivationId {
    /// Create a new activation ID from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "act-{:016x}", self.0)
    }
}

/// A directory record: identity + location + activation + accepting view.
///
/// `membership_version` is the view under which the directory accepted the
/// record. It is [`MembershipVersion::MIN`] until the registration has been
/// confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrainAddress {
    /// The grain's identity.
    pub grain_id: GrainId,
    /// The silo hosting this activation.
    pub silo: SiloAddress,
    /// Unique identifier for this specific activation.
    pub activation_id: ActivationId,
    /// The view under which the registration was accepted.
    pub membership_version: MembershipVersion,
}

impl GrainAddress {
    /// Create an unconfirmed grain address.
    pub fn new(grain_id: GrainId, silo: SiloAddress, activation_id: ActivationId) -> Self {
        Self {
            grain_id,
            silo,
            activation_id,
            membership_version: MembershipVersion::MIN,
        }
    }

    /// Return a copy stamped with the given membership version.
    pub fn with_version(mut self, version: MembershipVersion) -> Self {
        self.membership_version = version;
        self
    }

    /// Whether `other` designates the same activation.
    ///
    /// The membership version is ignored: it records when the entry was
    /// accepted, not which activation it points at.
    pub fn matches(&self, other: Option<&GrainAddress>) -> bool {
        match other {
            Some(other) => {
                self.grain_id == other.grain_id
                    && self.silo == other.silo
                    && self.activation_id == other.activation_id
            }
            None => false,
        }
    }
}

impl fmt::Display for GrainAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {} {} {}]",
            self.grain_id, self.silo, self.activation_id, self.membership_version
        )
    }
}

fn leading_u32(digest: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&digest[..4]);
    u32::from_be_bytes(bytes)
}
