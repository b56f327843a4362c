//! In-process transport.
//!
//! Routes directory RPCs between silos hosted in the same process. A call
//! resolves its target when it is made, yields once to the scheduler (so
//! the caller observes the same suspension points as over a network), then
//! invokes the target directly.
//!
//! Calls to a silo that never attached, detached, or was killed fail with
//! [`RpcError::Rejected`], which is how the directory observes a dead peer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::directory::{
    ClientRef, DirectoryResult, DirectoryTransport, GrainDirectoryClientRpc,
    GrainDirectoryPartitionRpc, PartitionRef, PartitionSnapshot,
};
use crate::error::RpcError;
use crate::ring::RingRange;
use crate::types::{GrainAddress, GrainId, MembershipVersion, SiloAddress};

#[derive(Debug, Default)]
struct Endpoints {
    silos: HashMap<SiloAddress, SiloEndpoints>,
    killed: HashSet<SiloAddress>,
}

#[derive(Debug)]
struct SiloEndpoints {
    client: ClientRef,
    partitions: Vec<PartitionRef>,
}

impl Endpoints {
    fn partition(&self, silo: &SiloAddress, index: usize) -> Result<PartitionRef, RpcError> {
        if self.killed.contains(silo) {
            return Err(RpcError::Rejected { silo: silo.clone() });
        }
        self.silos
            .get(silo)
            .and_then(|endpoints| endpoints.partitions.get(index))
            .cloned()
            .ok_or_else(|| RpcError::Rejected { silo: silo.clone() })
    }

    fn client(&self, silo: &SiloAddress) -> Result<ClientRef, RpcError> {
        if self.killed.contains(silo) {
            return Err(RpcError::Rejected { silo: silo.clone() });
        }
        self.silos
            .get(silo)
            .map(|endpoints| Arc::clone(&endpoints.client))
            .ok_or_else(|| RpcError::Rejected { silo: silo.clone() })
    }
}

/// Transport connecting silos hosted in one process.
///
/// Cloning yields a handle to the same routing table.
#[derive(Debug, Clone, Default)]
pub struct LocalTransport {
    endpoints: Arc<Mutex<Endpoints>>,
}

impl LocalTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call to `silo` fail as if its process had crashed.
    ///
    /// The silo's own tasks keep running; only inbound calls are rejected.
    pub fn kill(&self, silo: &SiloAddress) {
        tracing::debug!(silo = %silo, "killing silo endpoints");
        self.endpoints.lock().killed.insert(silo.clone());
    }

    /// Whether `silo` currently accepts calls.
    pub fn is_reachable(&self, silo: &SiloAddress) -> bool {
        let endpoints = self.endpoints.lock();
        !endpoints.killed.contains(silo) && endpoints.silos.contains_key(silo)
    }
}

impl DirectoryTransport for LocalTransport {
    fn partition(&self, silo: &SiloAddress, partition_index: usize) -> PartitionRef {
        Arc::new(PartitionProxy {
            endpoints: Arc::clone(&self.endpoints),
            silo: silo.clone(),
            partition_index,
        })
    }

    fn client(&self, silo: &SiloAddress) -> ClientRef {
        Arc::new(ClientProxy {
            endpoints: Arc::clone(&self.endpoints),
            silo: silo.clone(),
        })
    }

    fn attach(&self, silo: &SiloAddress, client: ClientRef, partitions: Vec<PartitionRef>) {
        tracing::debug!(silo = %silo, partitions = partitions.len(), "attaching silo endpoints");
        self.endpoints
            .lock()
            .silos
            .insert(silo.clone(), SiloEndpoints { client, partitions });
    }

    fn detach(&self, silo: &SiloAddress) {
        tracing::debug!(silo = %silo, "detaching silo endpoints");
        self.endpoints.lock().silos.remove(silo);
    }
}

#[derive(Debug)]
struct PartitionProxy {
    endpoints: Arc<Mutex<Endpoints>>,
    silo: SiloAddress,
    partition_index: usize,
}

impl PartitionProxy {
    async fn resolve(&self) -> Result<PartitionRef, RpcError> {
        let target = self
            .endpoints
            .lock()
            .partition(&self.silo, self.partition_index)?;
        tokio::task::yield_now().await;
        Ok(target)
    }
}

#[async_trait::async_trait]
impl GrainDirectoryPartitionRpc for PartitionProxy {
    async fn register(
        &self,
        version: MembershipVersion,
        address: GrainAddress,
        previous: Option<GrainAddress>,
    ) -> Result<DirectoryResult<GrainAddress>, RpcError> {
        self.resolve()
            .await?
            .register(version, address, previous)
            .await
    }

    async fn lookup(
        &self,
        version: MembershipVersion,
        grain_id: GrainId,
    ) -> Result<DirectoryResult<Option<GrainAddress>>, RpcError> {
        self.resolve().await?.lookup(version, grain_id).await
    }

    async fn deregister(
        &self,
        version: MembershipVersion,
        address: GrainAddress,
    ) -> Result<DirectoryResult<bool>, RpcError> {
        self.resolve().await?.deregister(version, address).await
    }

    async fn get_snapshot(
        &self,
        version: MembershipVersion,
        range_version: MembershipVersion,
        range: RingRange,
    ) -> Result<Option<PartitionSnapshot>, RpcError> {
        self.resolve()
            .await?
            .get_snapshot(version, range_version, range)
            .await
    }

    async fn acknowledge_snapshot_transfer(
        &self,
        silo: SiloAddress,
        partition_index: usize,
        version: MembershipVersion,
    ) -> Result<bool, RpcError> {
        self.resolve()
            .await?
            .acknowledge_snapshot_transfer(silo, partition_index, version)
            .await
    }
}

#[derive(Debug)]
struct ClientProxy {
    endpoints: Arc<Mutex<Endpoints>>,
    silo: SiloAddress,
}

impl ClientProxy {
    async fn resolve(&self) -> Result<ClientRef, RpcError> {
        let target = self.endpoints.lock().client(&self.silo)?;
        tokio::task::yield_now().await;
        Ok(target)
    }
}

#[async_trait::async_trait]
impl GrainDirectoryClientRpc for ClientProxy {
    async fn get_registered_activations(
        &self,
        version: MembershipVersion,
        range: RingRange,
        is_validation: bool,
    ) -> Result<Vec<GrainAddress>, RpcError> {
        self.resolve()
            .await?
            .get_registered_activations(version, range, is_validation)
            .await
    }

    async fn recover_registered_activations(
        &self,
        version: MembershipVersion,
        range: RingRange,
        silo: SiloAddress,
        partition_index: usize,
    ) -> Result<Vec<GrainAddress>, RpcError> {
        self.resolve()
            .await?
            .recover_registered_activations(version, range, silo, partition_index)
            .await
    }
}
