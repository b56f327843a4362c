//! Shared infrastructure for multi-silo directory tests.
//!
//! Runs a whole cluster in one process: every silo gets its own
//! [`DistributedGrainDirectory`] and activation catalog, and all of them
//! share one membership table and one in-process transport.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use moonpool_directory::{
    ActivationId, ClientRef, ClusterMembershipSnapshot, DirectoryConfig, DirectoryLifecycle,
    DirectoryMembershipSnapshot,
    DirectoryResult, DirectoryTransport, DistributedGrainDirectory, GrainAddress, GrainDirectory,
    GrainDirectoryPartitionRpc, GrainId, GrainType, InMemoryActivations, LocalActivation,
    LocalTransport, MembershipError, MembershipProvider, MembershipVersion, PartitionRef,
    PartitionSnapshot, RingRange, RpcError, SharedMembership, SiloAddress, SiloStatus,
};

/// Upper bound for any single wait in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Initialise tracing output when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Address of the test silo listening on `port`.
pub fn silo(port: u16) -> SiloAddress {
    SiloAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, 1)
}

/// A directory-managed grain.
pub fn grain(key: &str) -> GrainId {
    GrainId::new(GrainType::new("Counter"), key)
}

/// Directory config with fast retries for tests.
pub fn test_config(partitions_per_silo: usize) -> DirectoryConfig {
    DirectoryConfig::builder()
        .partitions_per_silo(partitions_per_silo)
        .initial_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(20))
        .shutdown_grace(Duration::from_secs(5))
        .build()
        .expect("valid test config")
}

/// Ring view for `cluster`, computed the way every silo computes it.
pub fn view_of(cluster: ClusterMembershipSnapshot, partitions_per_silo: usize) -> DirectoryMembershipSnapshot {
    DirectoryMembershipSnapshot::new(Arc::new(cluster), partitions_per_silo, &LocalTransport::new())
}

/// First key whose owner satisfies `predicate`.
pub fn find_key(predicate: impl Fn(&GrainId) -> bool) -> String {
    (0..100_000)
        .map(|i| format!("grain-{i}"))
        .find(|key| predicate(&grain(key)))
        .expect("a matching key exists")
}

/// One silo of a [`TestCluster`].
pub struct TestSilo {
    /// The silo's address.
    pub address: SiloAddress,
    /// The silo's directory.
    pub directory: Arc<DistributedGrainDirectory>,
    /// Activations hosted by the silo.
    pub activations: Arc<InMemoryActivations>,
}

/// An in-process cluster.
pub struct TestCluster {
    /// Shared membership table.
    pub membership: Arc<SharedMembership>,
    /// Shared transport.
    pub transport: Arc<LocalTransport>,
    /// Config used by every silo.
    pub config: DirectoryConfig,
    /// Silos by port.
    pub silos: BTreeMap<u16, TestSilo>,
    next_activation: AtomicU64,
}

impl TestCluster {
    /// An empty cluster.
    pub fn new(config: DirectoryConfig) -> Self {
        init_tracing();
        Self {
            membership: Arc::new(SharedMembership::new()),
            transport: Arc::new(LocalTransport::new()),
            config,
            silos: BTreeMap::new(),
            next_activation: AtomicU64::new(1),
        }
    }

    /// Start silos on `ports` and wait until all of them see each other.
    pub async fn start(ports: &[u16], config: DirectoryConfig) -> Self {
        let mut cluster = Self::new(config);
        for port in ports {
            cluster.add_silo(*port);
        }
        cluster.converge().await;
        cluster
    }

    /// Start a silo's directory, then admit it into the membership.
    pub fn add_silo(&mut self, port: u16) -> MembershipVersion {
        let membership = self.membership.clone();
        let transport = self.transport.clone();
        self.spawn_directory(port, membership, transport);
        self.membership.add_member(silo(port));
        self.membership.snapshot().version
    }

    /// Start a directory for `port` with its own membership and transport.
    pub fn spawn_directory(
        &mut self,
        port: u16,
        provider: Arc<dyn MembershipProvider>,
        transport: Arc<dyn DirectoryTransport>,
    ) -> Arc<DistributedGrainDirectory> {
        let address = silo(port);
        let activations = Arc::new(InMemoryActivations::new());
        let directory = DistributedGrainDirectory::new(
            address.clone(),
            self.config.clone(),
            provider,
            transport,
            activations.clone(),
        );
        directory.start();
        self.silos.insert(
            port,
            TestSilo {
                address,
                directory: directory.clone(),
                activations,
            },
        );
        directory
    }

    /// Crash a silo: reject its endpoints and declare it dead.
    pub fn kill_silo(&self, port: u16) -> MembershipVersion {
        let address = silo(port);
        self.transport.kill(&address);
        self.membership
            .declare_dead(&address)
            .expect("silo is a member")
    }

    /// Gracefully remove a silo from the cluster.
    pub async fn stop_silo(&self, port: u16) {
        let address = silo(port);
        self.membership
            .update_status(&address, SiloStatus::ShuttingDown)
            .await
            .expect("silo is a member");
        tokio::time::timeout(TEST_TIMEOUT, self.silos[&port].directory.shutdown())
            .await
            .expect("shutdown finished");
    }

    /// Wait until every running silo adopted the latest membership version.
    pub async fn converge(&self) {
        let ports: Vec<u16> = self.silos.keys().copied().collect();
        self.converge_on(&ports).await;
    }

    /// Wait until the running silos among `ports` adopted the latest version.
    pub async fn converge_on(&self, ports: &[u16]) {
        let version = self.membership.snapshot().version;
        for port in ports {
            let directory = &self.silos[port].directory;
            if directory.lifecycle() != DirectoryLifecycle::Active {
                continue;
            }
            for partition in directory.partitions() {
                tokio::time::timeout(TEST_TIMEOUT, partition.wait_adopted(version))
                    .await
                    .expect("partition adopted the latest view");
            }
        }
    }

    /// Ring view of the current membership.
    pub fn view(&self) -> DirectoryMembershipSnapshot {
        view_of((*self.membership.snapshot()).clone(), self.config.partitions_per_silo())
    }

    /// Create an activation of `key` on `port` and register it through that
    /// silo's directory, confirming it if it won.
    pub async fn activate(&self, port: u16, key: &str) -> GrainAddress {
        let host = &self.silos[&port];
        let address = GrainAddress::new(
            grain(key),
            host.address.clone(),
            ActivationId::new(self.next_activation.fetch_add(1, Ordering::SeqCst)),
        );
        host.activations
            .insert(LocalActivation::new(address.clone()));

        let stored = tokio::time::timeout(TEST_TIMEOUT, host.directory.register(address.clone()))
            .await
            .expect("register finished")
            .expect("register succeeded")
            .expect("an owner is available");
        if stored.matches(Some(&address)) {
            host.activations.confirm(&stored);
        } else {
            host.activations.remove(&address.grain_id);
        }
        stored
    }

    /// Look `key` up through silo `port`.
    pub async fn lookup(&self, port: u16, key: &str) -> Option<GrainAddress> {
        tokio::time::timeout(TEST_TIMEOUT, self.silos[&port].directory.lookup(&grain(key)))
            .await
            .expect("lookup finished")
            .expect("lookup succeeded")
    }

    /// A fresh activation id.
    pub fn next_activation_id(&self) -> ActivationId {
        ActivationId::new(self.next_activation.fetch_add(1, Ordering::SeqCst))
    }
}

/// Membership that only catches up with `source` when asked to refresh.
///
/// Lets a test hold one silo on an old view while the rest of the cluster
/// moves on.
#[derive(Debug)]
pub struct LaggingMembership {
    source: Arc<SharedMembership>,
    local: watch::Sender<Arc<ClusterMembershipSnapshot>>,
    refreshes: AtomicUsize,
}

impl LaggingMembership {
    /// Start at `source`'s current snapshot.
    pub fn new(source: Arc<SharedMembership>) -> Self {
        let (local, _) = watch::channel(source.snapshot());
        Self {
            source,
            local,
            refreshes: AtomicUsize::new(0),
        }
    }

    /// Number of refresh requests received.
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MembershipProvider for LaggingMembership {
    fn snapshot(&self) -> Arc<ClusterMembershipSnapshot> {
        self.local.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Arc<ClusterMembershipSnapshot>> {
        self.local.subscribe()
    }

    async fn refresh(&self, _target: Option<MembershipVersion>) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.local.send_replace(self.source.snapshot());
    }

    async fn register_node(
        &self,
        silo: SiloAddress,
        status: SiloStatus,
        name: String,
    ) -> Result<MembershipVersion, MembershipError> {
        self.source.register_node(silo, status, name).await
    }

    async fn update_status(
        &self,
        silo: &SiloAddress,
        status: SiloStatus,
    ) -> Result<MembershipVersion, MembershipError> {
        self.source.update_status(silo, status).await
    }
}

/// What a partition answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A result at the caller's view.
    Ok(MembershipVersion),
    /// The partition asked the caller to refresh.
    RefreshRequired(MembershipVersion),
    /// The call failed.
    Failed,
}

fn outcome<T>(result: &Result<DirectoryResult<T>, RpcError>) -> Outcome {
    match result {
        Ok(DirectoryResult::Ok { version, .. }) => Outcome::Ok(*version),
        Ok(DirectoryResult::RefreshRequired { version }) => Outcome::RefreshRequired(*version),
        Err(_) => Outcome::Failed,
    }
}

/// Transport wrapper recording the outcome of every routed operation.
#[derive(Debug, Clone)]
pub struct RecordingTransport {
    inner: Arc<LocalTransport>,
    log: Arc<Mutex<Vec<Outcome>>>,
}

impl RecordingTransport {
    /// Record calls made through `inner`.
    pub fn new(inner: Arc<LocalTransport>) -> Self {
        Self {
            inner,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Outcomes recorded so far.
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.log.lock().clone()
    }

    /// Forget recorded outcomes.
    pub fn clear(&self) {
        self.log.lock().clear();
    }
}

impl DirectoryTransport for RecordingTransport {
    fn partition(&self, silo: &SiloAddress, partition_index: usize) -> PartitionRef {
        Arc::new(RecordingPartition {
            inner: self.inner.partition(silo, partition_index),
            log: Arc::clone(&self.log),
        })
    }

    fn client(&self, silo: &SiloAddress) -> ClientRef {
        self.inner.client(silo)
    }

    fn attach(&self, silo: &SiloAddress, client: ClientRef, partitions: Vec<PartitionRef>) {
        self.inner.attach(silo, client, partitions);
    }

    fn detach(&self, silo: &SiloAddress) {
        self.inner.detach(silo);
    }
}

#[derive(Debug)]
struct RecordingPartition {
    inner: PartitionRef,
    log: Arc<Mutex<Vec<Outcome>>>,
}

#[async_trait::async_trait]
impl GrainDirectoryPartitionRpc for RecordingPartition {
    async fn register(
        &self,
        version: MembershipVersion,
        address: GrainAddress,
        previous: Option<GrainAddress>,
    ) -> Result<DirectoryResult<GrainAddress>, RpcError> {
        let result = self.inner.register(version, address, previous).await;
        self.log.lock().push(outcome(&result));
        result
    }

    async fn lookup(
        &self,
        version: MembershipVersion,
        grain_id: GrainId,
    ) -> Result<DirectoryResult<Option<GrainAddress>>, RpcError> {
        let result = self.inner.lookup(version, grain_id).await;
        self.log.lock().push(outcome(&result));
        result
    }

    async fn deregister(
        &self,
        version: MembershipVersion,
        address: GrainAddress,
    ) -> Result<DirectoryResult<bool>, RpcError> {
        let result = self.inner.deregister(version, address).await;
        self.log.lock().push(outcome(&result));
        result
    }

    async fn get_snapshot(
        &self,
        version: MembershipVersion,
        range_version: MembershipVersion,
        range: RingRange,
    ) -> Result<Option<PartitionSnapshot>, RpcError> {
        self.inner.get_snapshot(version, range_version, range).await
    }

    async fn acknowledge_snapshot_transfer(
        &self,
        silo: SiloAddress,
        partition_index: usize,
        version: MembershipVersion,
    ) -> Result<bool, RpcError> {
        self.inner
            .acknowledge_snapshot_transfer(silo, partition_index, version)
            .await
    }
}

/// Membership whose snapshot claims one version more than `source` ever
/// publishes.
///
/// A silo shutting down against it waits for a final view that never comes.
#[derive(Debug)]
pub struct AheadMembership {
    source: Arc<SharedMembership>,
}

impl AheadMembership {
    /// Follow `source`, reporting its version plus one.
    pub fn new(source: Arc<SharedMembership>) -> Self {
        Self { source }
    }
}

#[async_trait::async_trait]
impl MembershipProvider for AheadMembership {
    fn snapshot(&self) -> Arc<ClusterMembershipSnapshot> {
        let mut snapshot = (*self.source.snapshot()).clone();
        snapshot.version = snapshot.version.next();
        Arc::new(snapshot)
    }

    fn subscribe(&self) -> watch::Receiver<Arc<ClusterMembershipSnapshot>> {
        self.source.subscribe()
    }

    async fn refresh(&self, _target: Option<MembershipVersion>) {}

    async fn register_node(
        &self,
        silo: SiloAddress,
        status: SiloStatus,
        name: String,
    ) -> Result<MembershipVersion, MembershipError> {
        self.source.register_node(silo, status, name).await
    }

    async fn update_status(
        &self,
        silo: &SiloAddress,
        status: SiloStatus,
    ) -> Result<MembershipVersion, MembershipError> {
        self.source.update_status(silo, status).await
    }
}
