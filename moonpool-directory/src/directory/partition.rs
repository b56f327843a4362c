//! One virtual partition of the grain directory.
//!
//! # Design
//!
//! A partition owns the ring range assigned to its `(silo, index)` slot by
//! the latest view it adopted. Every operation is fenced:
//!
//! 1. If the caller knows a newer view, the partition catches up first.
//! 2. If the grain's hash lies in a range the partition is still acquiring,
//!    the operation waits until the range is populated.
//! 3. If the partition does not own the hash under its latest view, it
//!    answers [`DirectoryResult::RefreshRequired`] instead of acting.
//!
//! Views are applied by a per-partition loop. Applying a view seals the
//! ranges the partition lost (so their new owners can pull them) and locks
//! the ranges it gained until they are filled, either from the previous
//! owner's sealed snapshot or by asking every silo which activations it
//! hosts.
//!
//! # Orleans Reference
//!
//! Mirrors `GrainDirectoryPartition` from Orleans 9's distributed grain
//! directory, including its snapshot hand-off and recovery.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DirectoryConfig;
use crate::directory::membership_service::DirectoryMembershipService;
use crate::directory::rpc::{
    DirectoryResult, DirectoryTransport, GrainDirectoryPartitionRpc, PartitionSnapshot,
};
use crate::directory::snapshot::DirectoryMembershipSnapshot;
use crate::error::RpcError;
use crate::ring::RingRange;
use crate::types::{GrainAddress, GrainId, MembershipVersion, SiloAddress};

/// A gained range that is not populated yet.
struct RangeLock {
    range: RingRange,
    version: MembershipVersion,
    released: CancellationToken,
}

/// Records of a lost range, kept until every new owner pulled them.
struct SealedRange {
    range_version: MembershipVersion,
    version: MembershipVersion,
    range: RingRange,
    entries: Vec<(GrainId, GrainAddress)>,
    partners: HashSet<(SiloAddress, usize)>,
}

struct PartitionState {
    view: Arc<DirectoryMembershipSnapshot>,
    range: RingRange,
    directory: HashMap<GrainId, GrainAddress>,
    range_locks: Vec<RangeLock>,
    sealed: Vec<SealedRange>,
}

impl PartitionState {
    fn is_dead(&self, silo: &SiloAddress) -> bool {
        self.view.cluster().is_dead(silo)
    }

    fn range_lock(&self, hash: u32) -> Option<CancellationToken> {
        self.range_locks
            .iter()
            .find(|lock| lock.range.contains(hash))
            .map(|lock| lock.released.clone())
    }

    /// Insert records pulled from elsewhere, keeping what is already known.
    fn absorb(&mut self, entries: impl IntoIterator<Item = GrainAddress>) -> usize {
        let mut added = 0;
        for address in entries {
            if !self.range.contains(address.grain_id.uniform_hash()) || self.is_dead(&address.silo)
            {
                continue;
            }
            if let std::collections::hash_map::Entry::Vacant(slot) =
                self.directory.entry(address.grain_id.clone())
            {
                slot.insert(address);
                added += 1;
            }
        }
        added
    }

    fn register(&mut self, address: GrainAddress, previous: Option<GrainAddress>) -> GrainAddress {
        if let Some(existing) = self.directory.get(&address.grain_id) {
            if !existing.matches(previous.as_ref()) && !self.is_dead(&existing.silo) {
                return existing.clone();
            }
        }

        let stored = address.with_version(self.view.version());
        self.directory
            .insert(stored.grain_id.clone(), stored.clone());
        stored
    }

    fn lookup(&self, grain_id: &GrainId) -> Option<GrainAddress> {
        self.directory
            .get(grain_id)
            .filter(|address| !self.is_dead(&address.silo))
            .cloned()
    }

    fn deregister(&mut self, address: &GrainAddress) -> bool {
        let removable = match self.directory.get(&address.grain_id) {
            Some(existing) => existing.matches(Some(address)) || self.is_dead(&existing.silo),
            None => false,
        };
        if removable {
            self.directory.remove(&address.grain_id);
        }
        removable
    }
}

/// The directory partition hosted at `(silo, partition_index)`.
pub struct GrainDirectoryPartition {
    silo: SiloAddress,
    partition_index: usize,
    config: DirectoryConfig,
    membership: Arc<DirectoryMembershipService>,
    transport: Arc<dyn DirectoryTransport>,
    state: Mutex<PartitionState>,
    adopted: watch::Sender<Arc<DirectoryMembershipSnapshot>>,
    proposed: watch::Sender<Arc<DirectoryMembershipSnapshot>>,
    pending_snapshots: watch::Sender<usize>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl GrainDirectoryPartition {
    /// Create a partition that owns nothing until it adopts a view.
    pub fn new(
        silo: SiloAddress,
        partition_index: usize,
        config: DirectoryConfig,
        membership: Arc<DirectoryMembershipService>,
        transport: Arc<dyn DirectoryTransport>,
        stop: CancellationToken,
    ) -> Arc<Self> {
        let initial = Arc::new(DirectoryMembershipSnapshot::default());
        let (adopted, _) = watch::channel(Arc::clone(&initial));
        let (proposed, _) = watch::channel(Arc::clone(&initial));
        let (pending_snapshots, _) = watch::channel(0);
        Arc::new(Self {
            silo,
            partition_index,
            config,
            membership,
            transport,
            state: Mutex::new(PartitionState {
                view: initial,
                range: RingRange::EMPTY,
                directory: HashMap::new(),
                range_locks: Vec::new(),
                sealed: Vec::new(),
            }),
            adopted,
            proposed,
            pending_snapshots,
            tasks: Mutex::new(Vec::new()),
            stop,
        })
    }

    /// Silo hosting this partition.
    pub fn silo(&self) -> &SiloAddress {
        &self.silo
    }

    /// Index of this partition on its silo.
    pub fn partition_index(&self) -> usize {
        self.partition_index
    }

    /// Version of the latest adopted view.
    pub fn view_version(&self) -> MembershipVersion {
        self.adopted.borrow().version()
    }

    /// The range owned under the latest adopted view.
    pub fn range(&self) -> RingRange {
        self.state.lock().range
    }

    /// The record held for `grain_id`, ignoring ownership and liveness.
    pub fn local_record(&self, grain_id: &GrainId) -> Option<GrainAddress> {
        self.state.lock().directory.get(grain_id).cloned()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.state.lock().directory.len()
    }

    /// Whether the partition holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sealed ranges still waiting for their new owners.
    pub fn pending_snapshots(&self) -> usize {
        *self.pending_snapshots.borrow()
    }

    /// Wait until a view at or above `version` is adopted, without asking
    /// the membership service to refresh.
    pub async fn wait_adopted(&self, version: MembershipVersion) {
        let mut adopted = self.adopted.subscribe();
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = adopted.wait_for(|view| view.version() >= version) => {}
        }
    }

    /// Queue `view` for adoption. Older views are ignored.
    pub fn propose_view(&self, view: Arc<DirectoryMembershipSnapshot>) {
        self.proposed.send_if_modified(|current| {
            if view.version() >= current.version() {
                *current = view;
                true
            } else {
                false
            }
        });
    }

    /// Adopt proposed views until the directory stops.
    pub async fn run(self: Arc<Self>) {
        let mut proposed = self.proposed.subscribe();
        loop {
            let view = proposed.borrow_and_update().clone();
            self.apply_view(view);

            tokio::select! {
                _ = self.stop.cancelled() => break,
                changed = proposed.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        join_all(tasks).await;
    }

    /// Drop every record pointing at `silo` and stop waiting for it.
    pub fn on_silo_removed_from_cluster(&self, silo: &SiloAddress) {
        let mut state = self.state.lock();
        let before = state.directory.len();
        state.directory.retain(|_, address| &address.silo != silo);
        let removed = before - state.directory.len();

        for sealed in &mut state.sealed {
            sealed.partners.retain(|(partner, _)| partner != silo);
        }
        self.prune_sealed(&mut state);

        if removed > 0 {
            tracing::debug!(
                silo = %self.silo,
                partition = self.partition_index,
                dead = %silo,
                removed,
                "removed records of dead silo"
            );
        }
    }

    /// `silo`'s partition `partition_index` is rebuilding by recovery and
    /// will not pull sealed ranges from here.
    pub fn on_recovering_partition(&self, silo: &SiloAddress, partition_index: usize) {
        let mut state = self.state.lock();
        let partner = (silo.clone(), partition_index);
        for sealed in &mut state.sealed {
            sealed.partners.remove(&partner);
        }
        self.prune_sealed(&mut state);
    }

    /// Wait until `deadline` at most for sealed ranges to be pulled.
    pub async fn on_shutting_down(&self, deadline: Instant) {
        let mut pending = self.pending_snapshots.subscribe();
        let drained = tokio::time::timeout_at(deadline, pending.wait_for(|count| *count == 0))
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                silo = %self.silo,
                partition = self.partition_index,
                pending = self.pending_snapshots(),
                "shutdown grace elapsed with sealed ranges not transferred"
            );
        }
    }

    fn prune_sealed(&self, state: &mut PartitionState) {
        state.sealed.retain(|sealed| !sealed.partners.is_empty());
        self.pending_snapshots.send_replace(state.sealed.len());
    }

    fn rejected(&self) -> RpcError {
        RpcError::Rejected {
            silo: self.silo.clone(),
        }
    }

    fn apply_view(self: &Arc<Self>, view: Arc<DirectoryMembershipSnapshot>) {
        let mut state = self.state.lock();
        let previous = Arc::clone(&state.view);
        if view.version() <= previous.version() {
            return;
        }

        let previous_range = state.range;
        let range = view.partition_range(&self.silo, self.partition_index);
        let removed = previous_range.difference(&range);
        let added = range.difference(&previous_range);
        let self_dead = view.cluster().is_dead(&self.silo);

        for piece in removed {
            let lost: Vec<GrainId> = state
                .directory
                .keys()
                .filter(|grain_id| piece.contains(grain_id.uniform_hash()))
                .cloned()
                .collect();
            let entries: Vec<(GrainId, GrainAddress)> = lost
                .into_iter()
                .filter_map(|grain_id| state.directory.remove_entry(&grain_id))
                .collect();

            // A range still being acquired cannot be handed off complete.
            let incomplete = state.range_locks.iter().any(|lock| lock.range.intersects(&piece));
            if self_dead || incomplete {
                continue;
            }

            let partners: HashSet<(SiloAddress, usize)> = view
                .partition_ranges()
                .filter(|p| p.range.intersects(&piece))
                .filter(|p| !(p.silo == self.silo && p.partition_index == self.partition_index))
                .map(|p| (p.silo, p.partition_index))
                .collect();
            if partners.is_empty() {
                continue;
            }

            tracing::trace!(
                silo = %self.silo,
                partition = self.partition_index,
                range = %piece,
                records = entries.len(),
                "sealed lost range"
            );
            state.sealed.push(SealedRange {
                range_version: previous.version(),
                version: view.version(),
                range: piece,
                entries,
                partners,
            });
        }
        self.pending_snapshots.send_replace(state.sealed.len());

        let mut acquisitions = Vec::new();
        for piece in added {
            let released = CancellationToken::new();
            state.range_locks.push(RangeLock {
                range: piece,
                version: view.version(),
                released: released.clone(),
            });
            acquisitions.push((piece, released));
        }

        if previous_range != range {
            tracing::debug!(
                silo = %self.silo,
                partition = self.partition_index,
                version = %view.version(),
                range = %range,
                "partition range changed"
            );
        }

        state.view = Arc::clone(&view);
        state.range = range;
        drop(state);
        self.adopted.send_replace(Arc::clone(&view));

        if acquisitions.is_empty() {
            return;
        }
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        for (piece, released) in acquisitions {
            let partition = Arc::clone(self);
            let previous = Arc::clone(&previous);
            let current = Arc::clone(&view);
            tasks.push(tokio::spawn(async move {
                partition
                    .acquire_range(previous, current, piece, released)
                    .await;
            }));
        }
    }

    async fn acquire_range(
        &self,
        previous: Arc<DirectoryMembershipSnapshot>,
        current: Arc<DirectoryMembershipSnapshot>,
        range: RingRange,
        released: CancellationToken,
    ) {
        let contiguous = previous.version().next() == current.version();
        let transferred = contiguous
            && !previous.members().is_empty()
            && self.transfer_snapshots(&previous, &current, range).await;
        if !transferred {
            self.recover(&current, range).await;
        }

        let mut state = self.state.lock();
        state
            .range_locks
            .retain(|lock| !(lock.range == range && lock.version == current.version()));
        released.cancel();
    }

    /// Pull `range` from the partitions that owned it in `previous`.
    ///
    /// Returns `false` if any of them cannot provide its part, in which case
    /// the caller falls back to recovery.
    async fn transfer_snapshots(
        &self,
        previous: &DirectoryMembershipSnapshot,
        current: &DirectoryMembershipSnapshot,
        range: RingRange,
    ) -> bool {
        let mut owners = Vec::new();
        for owner in previous.partition_ranges() {
            let pieces = owner.range.intersections(&range);
            if pieces.is_empty() {
                continue;
            }
            if current.cluster().is_dead(&owner.silo) {
                return false;
            }
            let Some(partition) = previous.partition_ref(&owner.silo, owner.partition_index) else {
                return false;
            };
            owners.push((owner, partition, pieces));
        }

        let mut entries = Vec::new();
        for (owner, partition, pieces) in &owners {
            for piece in pieces {
                match partition
                    .get_snapshot(current.version(), previous.version(), *piece)
                    .await
                {
                    Ok(Some(snapshot)) => entries.extend(snapshot.entries),
                    Ok(None) => {
                        tracing::debug!(
                            silo = %self.silo,
                            partition = self.partition_index,
                            owner = %owner.silo,
                            range = %piece,
                            "previous owner has no snapshot, recovering"
                        );
                        return false;
                    }
                    Err(err) => {
                        tracing::debug!(
                            silo = %self.silo,
                            partition = self.partition_index,
                            owner = %owner.silo,
                            error = %err,
                            "snapshot transfer failed, recovering"
                        );
                        return false;
                    }
                }
            }
        }

        let transferred = entries.len();
        let added = self
            .state
            .lock()
            .absorb(entries.into_iter().map(|(_, address)| address));

        for (owner, partition, _) in owners {
            if let Err(err) = partition
                .acknowledge_snapshot_transfer(
                    self.silo.clone(),
                    self.partition_index,
                    current.version(),
                )
                .await
            {
                tracing::debug!(owner = %owner.silo, error = %err, "snapshot acknowledgement failed");
            }
        }

        tracing::debug!(
            silo = %self.silo,
            partition = self.partition_index,
            version = %current.version(),
            range = %range,
            transferred,
            added,
            "acquired range by snapshot transfer"
        );
        true
    }

    /// Rebuild `range` from the activations every active silo hosts.
    async fn recover(&self, current: &DirectoryMembershipSnapshot, range: RingRange) {
        let version = current.version();
        let reports = join_all(
            current
                .members()
                .iter()
                .map(|silo| self.recover_from(silo.clone(), version, range)),
        )
        .await;

        let found: Vec<GrainAddress> = reports.into_iter().flatten().collect();
        let recovered = found.len();
        let added = self.state.lock().absorb(found);
        tracing::debug!(
            silo = %self.silo,
            partition = self.partition_index,
            version = %version,
            range = %range,
            recovered,
            added,
            "recovered range"
        );
    }

    async fn recover_from(
        &self,
        silo: SiloAddress,
        version: MembershipVersion,
        range: RingRange,
    ) -> Vec<GrainAddress> {
        let client = self.transport.client(&silo);
        let mut delay = self.config.initial_backoff();
        loop {
            match client
                .recover_registered_activations(
                    version,
                    range,
                    self.silo.clone(),
                    self.partition_index,
                )
                .await
            {
                Ok(addresses) => return addresses,
                Err(err) => {
                    if self.stop.is_cancelled() || !self.membership.current_view().is_member(&silo)
                    {
                        return Vec::new();
                    }
                    tracing::warn!(
                        silo = %self.silo,
                        partition = self.partition_index,
                        target = %silo,
                        error = %err,
                        "recovery request failed, retrying"
                    );
                }
            }

            tokio::select! {
                _ = self.stop.cancelled() => return Vec::new(),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.config.next_backoff(delay);
        }
    }

    /// Wait until a view at or above `version` is adopted.
    async fn wait_for_view(&self, version: MembershipVersion) -> Result<(), RpcError> {
        self.membership
            .refresh_view(version, &self.stop)
            .await
            .map_err(|_| self.rejected())?;

        let mut adopted = self.adopted.subscribe();
        tokio::select! {
            _ = self.stop.cancelled() => Err(self.rejected()),
            view = adopted.wait_for(|view| view.version() >= version) => {
                view.map(|_| ()).map_err(|_| self.rejected())
            }
        }
    }

    async fn invoke<T, F>(
        &self,
        version: MembershipVersion,
        grain_id: &GrainId,
        operation: F,
    ) -> Result<DirectoryResult<T>, RpcError>
    where
        F: FnOnce(&mut PartitionState) -> T + Send,
    {
        let hash = grain_id.uniform_hash();
        loop {
            if self.view_version() < version {
                self.wait_for_view(version).await?;
            }

            let released = {
                let mut state = self.state.lock();
                match state.range_lock(hash) {
                    Some(released) => released,
                    None => {
                        if !state.range.contains(hash) {
                            return Ok(DirectoryResult::refresh_required(state.view.version()));
                        }
                        let value = operation(&mut state);
                        return Ok(DirectoryResult::ok(value, version));
                    }
                }
            };

            tokio::select! {
                _ = self.stop.cancelled() => return Err(self.rejected()),
                _ = released.cancelled() => {}
            }
        }
    }
}

#[async_trait::async_trait]
impl GrainDirectoryPartitionRpc for GrainDirectoryPartition {
    async fn register(
        &self,
        version: MembershipVersion,
        address: GrainAddress,
        previous: Option<GrainAddress>,
    ) -> Result<DirectoryResult<GrainAddress>, RpcError> {
        let grain_id = address.grain_id.clone();
        self.invoke(version, &grain_id, move |state| {
            state.register(address, previous)
        })
        .await
    }

    async fn lookup(
        &self,
        version: MembershipVersion,
        grain_id: GrainId,
    ) -> Result<DirectoryResult<Option<GrainAddress>>, RpcError> {
        self.invoke(version, &grain_id, |state| state.lookup(&grain_id))
            .await
    }

    async fn deregister(
        &self,
        version: MembershipVersion,
        address: GrainAddress,
    ) -> Result<DirectoryResult<bool>, RpcError> {
        let grain_id = address.grain_id.clone();
        self.invoke(version, &grain_id, move |state| state.deregister(&address))
            .await
    }

    async fn get_snapshot(
        &self,
        version: MembershipVersion,
        range_version: MembershipVersion,
        range: RingRange,
    ) -> Result<Option<PartitionSnapshot>, RpcError> {
        if self.view_version() < version {
            self.wait_for_view(version).await?;
        }

        let state = self.state.lock();
        let mut found = false;
        let mut entries = Vec::new();
        for sealed in &state.sealed {
            if sealed.version != version
                || sealed.range_version != range_version
                || !sealed.range.intersects(&range)
            {
                continue;
            }
            found = true;
            entries.extend(
                sealed
                    .entries
                    .iter()
                    .filter(|(grain_id, _)| range.contains(grain_id.uniform_hash()))
                    .cloned(),
            );
        }
        Ok(found.then_some(PartitionSnapshot { entries }))
    }

    async fn acknowledge_snapshot_transfer(
        &self,
        silo: SiloAddress,
        partition_index: usize,
        version: MembershipVersion,
    ) -> Result<bool, RpcError> {
        let mut state = self.state.lock();
        let partner = (silo, partition_index);
        let mut acknowledged = false;
        for sealed in state.sealed.iter_mut().filter(|s| s.version == version) {
            acknowledged |= sealed.partners.remove(&partner);
        }
        self.prune_sealed(&mut state);
        Ok(acknowledged)
    }
}

impl fmt::Debug for GrainDirectoryPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrainDirectoryPartition")
            .field("silo", &self.silo)
            .field("partition_index", &self.partition_index)
            .field("view_version", &self.view_version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::membership::{MembershipProvider, SharedMembership};
    use crate::transport::LocalTransport;
    use crate::types::{ActivationId, GrainType};

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, 1)
    }

    fn address(key: &str, port: u16, activation: u64) -> GrainAddress {
        GrainAddress::new(
            GrainId::new(GrainType::new("Counter"), key),
            silo(port),
            ActivationId::new(activation),
        )
    }

    struct Fixture {
        membership: Arc<SharedMembership>,
        service: Arc<DirectoryMembershipService>,
        partition: Arc<GrainDirectoryPartition>,
    }

    /// A single-partition silo 1, optionally alongside other members.
    fn fixture(others: &[u16]) -> Fixture {
        let mut members = vec![silo(1)];
        members.extend(others.iter().map(|port| silo(*port)));
        let membership = Arc::new(SharedMembership::with_members(members));
        let transport: Arc<dyn DirectoryTransport> = Arc::new(LocalTransport::new());
        let service = Arc::new(DirectoryMembershipService::new(
            membership.clone(),
            Arc::clone(&transport),
            1,
        ));
        service.publish(membership.snapshot());
        let config = DirectoryConfig::builder()
            .partitions_per_silo(1)
            .build()
            .expect("config");
        let partition = GrainDirectoryPartition::new(
            silo(1),
            0,
            config,
            Arc::clone(&service),
            transport,
            CancellationToken::new(),
        );
        Fixture {
            membership,
            service,
            partition,
        }
    }

    /// Adopt the current view with the range already populated.
    fn adopt(fixture: &Fixture) {
        let view = fixture.service.current_view();
        fixture.partition.apply_view(view);
        let mut state = fixture.partition.state.lock();
        for lock in state.range_locks.drain(..) {
            lock.released.cancel();
        }
    }

    fn owned_key(fixture: &Fixture, owned: bool) -> String {
        let range = fixture.partition.range();
        (0..)
            .map(|i| format!("grain-{i}"))
            .find(|key| {
                let grain = GrainId::new(GrainType::new("Counter"), key.as_str());
                range.contains(grain.uniform_hash()) == owned
            })
            .expect("some key hashes into the range")
    }

    #[tokio::test]
    async fn test_register_lookup_deregister() {
        let fixture = fixture(&[]);
        adopt(&fixture);
        let version = fixture.partition.view_version();
        let addr = address("a", 1, 1);

        let stored = fixture
            .partition
            .register(version, addr.clone(), None)
            .await
            .expect("rpc")
            .try_get_result(version)
            .expect("owner");
        assert!(stored.matches(Some(&addr)));
        assert_eq!(stored.membership_version, version);

        let found = fixture
            .partition
            .lookup(version, addr.grain_id.clone())
            .await
            .expect("rpc")
            .try_get_result(version)
            .expect("owner");
        assert_eq!(found, Some(stored.clone()));

        let removed = fixture
            .partition
            .deregister(version, addr.clone())
            .await
            .expect("rpc")
            .try_get_result(version)
            .expect("owner");
        assert!(removed);
        assert!(fixture.partition.local_record(&addr.grain_id).is_none());
    }

    #[tokio::test]
    async fn test_register_is_idempotent_and_first_writer_wins() {
        let fixture = fixture(&[]);
        adopt(&fixture);
        let version = fixture.partition.view_version();
        let first = address("a", 1, 1);
        let second = address("a", 1, 2);

        let stored = fixture
            .partition
            .register(version, first.clone(), None)
            .await
            .expect("rpc")
            .try_get_result(version)
            .expect("owner");
        let again = fixture
            .partition
            .register(version, first.clone(), None)
            .await
            .expect("rpc")
            .try_get_result(version)
            .expect("owner");
        assert_eq!(again, stored);

        let loser = fixture
            .partition
            .register(version, second.clone(), None)
            .await
            .expect("rpc")
            .try_get_result(version)
            .expect("owner");
        assert!(loser.matches(Some(&first)));

        let replaced = fixture
            .partition
            .register(version, second.clone(), Some(first.clone()))
            .await
            .expect("rpc")
            .try_get_result(version)
            .expect("owner");
        assert!(replaced.matches(Some(&second)));
    }

    #[tokio::test]
    async fn test_stale_previous_is_rejected() {
        let fixture = fixture(&[]);
        adopt(&fixture);
        let version = fixture.partition.view_version();
        let current = address("a", 1, 1);
        let stale = address("a", 1, 9);
        let contender = address("a", 1, 2);

        fixture
            .partition
            .register(version, current.clone(), None)
            .await
            .expect("rpc");
        let stored = fixture
            .partition
            .register(version, contender, Some(stale.clone()))
            .await
            .expect("rpc")
            .try_get_result(version)
            .expect("owner");
        assert!(stored.matches(Some(&current)));

        let removed = fixture
            .partition
            .deregister(version, stale)
            .await
            .expect("rpc")
            .try_get_result(version)
            .expect("owner");
        assert!(!removed);
    }

    #[tokio::test]
    async fn test_not_owner_requires_refresh() {
        let fixture = fixture(&[2, 3]);
        adopt(&fixture);
        let version = fixture.partition.view_version();
        let key = owned_key(&fixture, false);
        let grain = GrainId::new(GrainType::new("Counter"), key);

        let result = fixture
            .partition
            .lookup(version, grain)
            .await
            .expect("rpc");
        assert_eq!(result, DirectoryResult::refresh_required(version));
    }

    #[tokio::test]
    async fn test_dead_silo_entries_are_ignored_and_replaced() {
        let fixture = fixture(&[2]);
        adopt(&fixture);
        let key = owned_key(&fixture, true);
        let version = fixture.partition.view_version();
        let on_two = GrainAddress::new(
            GrainId::new(GrainType::new("Counter"), key.as_str()),
            silo(2),
            ActivationId::new(1),
        );
        fixture
            .partition
            .register(version, on_two.clone(), None)
            .await
            .expect("rpc");

        fixture.membership.declare_dead(&silo(2));
        fixture.service.publish(fixture.membership.snapshot());
        adopt(&fixture);
        let version = fixture.partition.view_version();
        assert!(fixture.partition.range().is_full());

        let found = fixture
            .partition
            .lookup(version, on_two.grain_id.clone())
            .await
            .expect("rpc")
            .try_get_result(version)
            .expect("owner");
        assert_eq!(found, None);
        assert!(fixture.partition.local_record(&on_two.grain_id).is_some());

        let on_one = GrainAddress::new(on_two.grain_id.clone(), silo(1), ActivationId::new(2));
        let stored = fixture
            .partition
            .register(version, on_one.clone(), None)
            .await
            .expect("rpc")
            .try_get_result(version)
            .expect("owner");
        assert!(stored.matches(Some(&on_one)));

        fixture.partition.on_silo_removed_from_cluster(&silo(2));
    }

    #[tokio::test]
    async fn test_lost_range_is_sealed_until_acknowledged() {
        let fixture = fixture(&[]);
        adopt(&fixture);
        let version = fixture.partition.view_version();
        for i in 0..32 {
            fixture
                .partition
                .register(version, address(&format!("g{i}"), 1, i), None)
                .await
                .expect("rpc");
        }
        assert_eq!(fixture.partition.len(), 32);

        fixture.membership.add_member(silo(2));
        fixture.service.publish(fixture.membership.snapshot());
        adopt(&fixture);
        let next = fixture.partition.view_version();
        let kept = fixture.partition.len();
        assert!(!fixture.partition.range().is_full());

        assert_eq!(fixture.partition.pending_snapshots(), 1);
        let view = fixture.service.current_view();
        let gained = view.partition_range(&silo(2), 0);
        let snapshot = fixture
            .partition
            .get_snapshot(next, version, gained)
            .await
            .expect("rpc")
            .expect("sealed");
        assert_eq!(snapshot.entries.len(), 32 - kept);
        assert!(fixture
            .partition
            .get_snapshot(next, MembershipVersion(99), gained)
            .await
            .expect("rpc")
            .is_none());

        assert!(fixture
            .partition
            .acknowledge_snapshot_transfer(silo(2), 0, next)
            .await
            .expect("rpc"));
        assert_eq!(fixture.partition.pending_snapshots(), 0);
        let started = Instant::now();
        fixture
            .partition
            .on_shutting_down(started + std::time::Duration::from_secs(5))
            .await;
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_recovering_partner_releases_sealed_range() {
        let fixture = fixture(&[]);
        adopt(&fixture);
        let version = fixture.partition.view_version();
        for i in 0..32 {
            fixture
                .partition
                .register(version, address(&format!("g{i}"), 1, i), None)
                .await
                .expect("rpc");
        }
        fixture.membership.add_member(silo(2));
        fixture.service.publish(fixture.membership.snapshot());
        adopt(&fixture);
        assert_eq!(fixture.partition.pending_snapshots(), 1);

        fixture.partition.on_recovering_partition(&silo(3), 0);
        assert_eq!(fixture.partition.pending_snapshots(), 1);
        fixture.partition.on_recovering_partition(&silo(2), 0);
        assert_eq!(fixture.partition.pending_snapshots(), 0);
    }
}
