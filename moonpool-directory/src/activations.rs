//! Activations hosted by the local silo.
//!
//! Recovery rebuilds directory partitions from what each silo actually
//! hosts, so the directory needs read access to the local activation
//! catalog and a way to deactivate activations whose registration is in
//! doubt.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{GrainAddress, GrainId, MembershipVersion};

/// Why an activation is being deactivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeactivationReason {
    /// The directory could not vouch for the activation's registration.
    DirectoryFailure,
}

impl DeactivationReason {
    /// Whether the activation must skip unregistering itself.
    ///
    /// An in-doubt registration was never confirmed, so there is nothing it
    /// may safely remove from the directory.
    pub fn skip_directory_unregistration(&self) -> bool {
        match self {
            DeactivationReason::DirectoryFailure => true,
        }
    }
}

impl fmt::Display for DeactivationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeactivationReason::DirectoryFailure => write!(f, "DirectoryFailure"),
        }
    }
}

/// A locally-hosted activation as seen by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalActivation {
    /// Where the activation lives. Its membership version is
    /// [`MembershipVersion::MIN`] until the directory confirmed it.
    pub address: GrainAddress,
    /// Whether the activation is running normally.
    pub is_valid: bool,
    /// Whether the activation's grain type is registered in this directory.
    pub uses_directory: bool,
}

impl LocalActivation {
    /// A valid, directory-managed activation.
    pub fn new(address: GrainAddress) -> Self {
        Self {
            address,
            is_valid: true,
            uses_directory: true,
        }
    }

    /// Whether the directory cannot vouch for this activation.
    pub fn is_in_doubt(&self) -> bool {
        self.address.membership_version == MembershipVersion::MIN || !self.is_valid
    }
}

/// Access to the local silo's activations.
#[async_trait::async_trait]
pub trait LocalActivations: fmt::Debug + Send + Sync {
    /// Every activation currently hosted.
    fn activations(&self) -> Vec<LocalActivation>;

    /// Deactivate the activation of `grain_id`, returning once it is gone.
    async fn deactivate(&self, grain_id: &GrainId, reason: DeactivationReason);
}

/// In-memory activation catalog.
#[derive(Debug, Default)]
pub struct InMemoryActivations {
    activations: Mutex<HashMap<GrainId, LocalActivation>>,
    deactivations: Mutex<Vec<(GrainId, DeactivationReason)>>,
}

impl InMemoryActivations {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an activation.
    pub fn insert(&self, activation: LocalActivation) {
        self.activations
            .lock()
            .insert(activation.address.grain_id.clone(), activation);
    }

    /// Record the directory's confirmation of a registration.
    ///
    /// Returns `false` if the grain is not hosted here.
    pub fn confirm(&self, address: &GrainAddress) -> bool {
        match self.activations.lock().get_mut(&address.grain_id) {
            Some(activation) if activation.address.matches(Some(address)) => {
                activation.address.membership_version = address.membership_version;
                true
            }
            _ => false,
        }
    }

    /// Remove an activation without recording a deactivation.
    pub fn remove(&self, grain_id: &GrainId) -> Option<LocalActivation> {
        self.activations.lock().remove(grain_id)
    }

    /// The activation of `grain_id`, if hosted here.
    pub fn get(&self, grain_id: &GrainId) -> Option<LocalActivation> {
        self.activations.lock().get(grain_id).cloned()
    }

    /// Every deactivation performed so far, in order.
    pub fn deactivations(&self) -> Vec<(GrainId, DeactivationReason)> {
        self.deactivations.lock().clone()
    }
}

#[async_trait::async_trait]
impl LocalActivations for InMemoryActivations {
    fn activations(&self) -> Vec<LocalActivation> {
        self.activations.lock().values().cloned().collect()
    }

    async fn deactivate(&self, grain_id: &GrainId, reason: DeactivationReason) {
        tokio::task::yield_now().await;
        if self.activations.lock().remove(grain_id).is_some() {
            tracing::debug!(grain = %grain_id, reason = %reason, "deactivated");
            self.deactivations.lock().push((grain_id.clone(), reason));
        }
    }
}
