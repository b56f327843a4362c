//! The distributed grain directory hosted by one silo.
//!
//! # Design
//!
//! Every silo hosts `P` [`GrainDirectoryPartition`]s and one
//! [`DistributedGrainDirectory`] that:
//!
//! - routes `lookup`/`register`/`unregister` to the partition owning the
//!   grain under the current ring view, on this silo or another,
//! - retries across view changes (`RefreshRequired`) and unreachable
//!   owners (bounded by the configured attempt budget),
//! - answers recovery requests from partitions that gained ring range, by
//!   reporting the directory-managed activations hosted here.
//!
//! Recovery raises the silo-wide recovery version. A routed operation that
//! observes the recovery version change while it was in flight is retried,
//! so no registration is finalized under a view older than a recovery that
//! may already have scanned past it.
//!
//! # Orleans Reference
//!
//! Mirrors `DistributedGrainDirectory` from Orleans 9.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::activations::{DeactivationReason, LocalActivations};
use crate::config::DirectoryConfig;
use crate::directory::membership_service::DirectoryMembershipService;
use crate::directory::partition::GrainDirectoryPartition;
use crate::directory::rpc::{
    ClientRef, DirectoryResult, DirectoryTransport, GrainDirectoryClientRpc, PartitionRef,
};
use crate::directory::snapshot::DirectoryMembershipSnapshot;
use crate::directory::GrainDirectory;
use crate::error::{DirectoryError, RpcError};
use crate::membership::{MembershipProvider, SiloStatus};
use crate::ring::RingRange;
use crate::types::{GrainAddress, GrainId, MembershipVersion, SiloAddress};

/// Lifecycle state of a [`DistributedGrainDirectory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryLifecycle {
    /// Created but not started.
    Created,
    /// Endpoints attached, loops running.
    Active,
    /// Handing off ranges before stopping.
    Stopping,
    /// Loops stopped, endpoints detached.
    Stopped,
}

impl fmt::Display for DirectoryLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryLifecycle::Created => write!(f, "Created"),
            DirectoryLifecycle::Active => write!(f, "Active"),
            DirectoryLifecycle::Stopping => write!(f, "Stopping"),
            DirectoryLifecycle::Stopped => write!(f, "Stopped"),
        }
    }
}

/// One silo's share of the cluster-wide grain directory.
///
/// # Example
///
/// ```rust,ignore
/// let directory = DistributedGrainDirectory::new(
///     silo.clone(),
///     DirectoryConfig::default(),
///     membership.clone(),
///     transport.clone(),
///     activations.clone(),
/// );
/// directory.start();
///
/// let stored = directory.register(address).await?;
/// let found = directory.lookup(&grain_id).await?;
///
/// directory.shutdown().await;
/// ```
pub struct DistributedGrainDirectory {
    silo: SiloAddress,
    config: DirectoryConfig,
    provider: Arc<dyn MembershipProvider>,
    transport: Arc<dyn DirectoryTransport>,
    activations: Arc<dyn LocalActivations>,
    membership: Arc<DirectoryMembershipService>,
    partitions: Vec<Arc<GrainDirectoryPartition>>,
    recovery_version: AtomicU64,
    lifecycle: Mutex<DirectoryLifecycle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl DistributedGrainDirectory {
    /// Create the directory for `silo`. Nothing runs until [`start`](Self::start).
    pub fn new(
        silo: SiloAddress,
        config: DirectoryConfig,
        provider: Arc<dyn MembershipProvider>,
        transport: Arc<dyn DirectoryTransport>,
        activations: Arc<dyn LocalActivations>,
    ) -> Arc<Self> {
        let stop = CancellationToken::new();
        let membership = Arc::new(DirectoryMembershipService::new(
            Arc::clone(&provider),
            Arc::clone(&transport),
            config.partitions_per_silo(),
        ));
        let partitions = (0..config.partitions_per_silo())
            .map(|index| {
                GrainDirectoryPartition::new(
                    silo.clone(),
                    index,
                    config.clone(),
                    Arc::clone(&membership),
                    Arc::clone(&transport),
                    stop.clone(),
                )
            })
            .collect();

        Arc::new(Self {
            silo,
            config,
            provider,
            transport,
            activations,
            membership,
            partitions,
            recovery_version: AtomicU64::new(MembershipVersion::MIN.0),
            lifecycle: Mutex::new(DirectoryLifecycle::Created),
            tasks: Mutex::new(Vec::new()),
            stop,
        })
    }

    /// The silo hosting this directory.
    pub fn silo(&self) -> &SiloAddress {
        &self.silo
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> DirectoryLifecycle {
        *self.lifecycle.lock()
    }

    /// Highest membership version a recovery scan of this silo ran at.
    pub fn recovery_version(&self) -> MembershipVersion {
        MembershipVersion(self.recovery_version.load(Ordering::SeqCst))
    }

    /// The latest ring view.
    pub fn current_view(&self) -> Arc<DirectoryMembershipSnapshot> {
        self.membership.current_view()
    }

    /// The local partitions, by index.
    pub fn partitions(&self) -> &[Arc<GrainDirectoryPartition>] {
        &self.partitions
    }

    /// Attach the local endpoints and start following membership.
    pub fn start(self: &Arc<Self>) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != DirectoryLifecycle::Created {
                return;
            }
            *lifecycle = DirectoryLifecycle::Active;
        }

        let client: ClientRef = Arc::clone(self) as ClientRef;
        let partitions: Vec<PartitionRef> = self
            .partitions
            .iter()
            .map(|partition| Arc::clone(partition) as PartitionRef)
            .collect();
        self.transport.attach(&self.silo, client, partitions);

        let mut tasks = self.tasks.lock();
        for partition in &self.partitions {
            tasks.push(tokio::spawn(Arc::clone(partition).run()));
        }

        let membership = Arc::clone(&self.membership);
        let stop = self.stop.clone();
        tasks.push(tokio::spawn(async move { membership.run(stop).await }));

        tasks.push(tokio::spawn(process_views(
            self.silo.clone(),
            Arc::clone(&self.membership),
            self.partitions.clone(),
            self.stop.clone(),
        )));

        tracing::info!(
            silo = %self.silo,
            partitions = self.partitions.len(),
            "grain directory started"
        );
    }

    /// Hand off owned ranges and stop.
    ///
    /// The silo should already be leaving the membership, so its ranges
    /// move to other silos; sealed ranges are kept available for up to the
    /// configured grace period.
    pub async fn shutdown(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != DirectoryLifecycle::Active {
                return;
            }
            *lifecycle = DirectoryLifecycle::Stopping;
        }

        // One deadline bounds both adoption of the final view and the drain.
        let deadline = Instant::now() + self.config.shutdown_grace();
        let target = self.provider.snapshot().version;
        let adopted = tokio::time::timeout_at(
            deadline,
            join_all(
                self.partitions
                    .iter()
                    .map(|partition| partition.wait_adopted(target)),
            ),
        )
        .await;
        if adopted.is_err() {
            tracing::warn!(silo = %self.silo, version = %target, "partitions did not adopt final view");
        }
        join_all(
            self.partitions
                .iter()
                .map(|partition| partition.on_shutting_down(deadline)),
        )
        .await;

        self.stop.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for result in join_all(tasks).await {
            if let Err(err) = result {
                tracing::error!(silo = %self.silo, error = %err, "directory task failed");
            }
        }
        self.transport.detach(&self.silo);

        *self.lifecycle.lock() = DirectoryLifecycle::Stopped;
        tracing::info!(silo = %self.silo, "grain directory stopped");
    }

    /// The silo owning `grain_id` under the current view.
    pub fn primary_for_grain(&self, grain_id: &GrainId) -> Option<SiloAddress> {
        self.membership
            .current_view()
            .try_get_owner(grain_id)
            .map(|owner| owner.silo)
    }

    /// The record held here for `grain_id`, if this silo owns it.
    pub fn local_record(&self, grain_id: &GrainId) -> Option<GrainAddress> {
        let owner = self.membership.current_view().try_get_owner(grain_id)?;
        if owner.silo != self.silo {
            return None;
        }
        self.partitions
            .get(owner.partition_index)?
            .local_record(grain_id)
    }

    /// Look up `grain_id`, giving up when `cancel` fires.
    pub async fn lookup_with_cancellation(
        &self,
        grain_id: &GrainId,
        cancel: &CancellationToken,
    ) -> Result<Option<GrainAddress>, DirectoryError> {
        let result = self
            .invoke(grain_id, cancel, |partition, version| {
                let grain_id = grain_id.clone();
                async move { partition.lookup(version, grain_id).await }
            })
            .await?;
        Ok(result.flatten())
    }

    /// Register `address`, replacing `previous` if it is the stored record.
    ///
    /// Returns the record the directory holds afterwards, or `None` when no
    /// silo is available to own the grain.
    pub async fn register_with_cancellation(
        &self,
        address: GrainAddress,
        previous: Option<GrainAddress>,
        cancel: &CancellationToken,
    ) -> Result<Option<GrainAddress>, DirectoryError> {
        let grain_id = address.grain_id.clone();
        self.invoke(&grain_id, cancel, |partition, version| {
            let address = address.clone();
            let previous = previous.clone();
            async move { partition.register(version, address, previous).await }
        })
        .await
    }

    /// Remove `address` if it is the stored record.
    pub async fn unregister_with_cancellation(
        &self,
        address: &GrainAddress,
        cancel: &CancellationToken,
    ) -> Result<bool, DirectoryError> {
        let removed = self
            .invoke(&address.grain_id, cancel, |partition, version| {
                let address = address.clone();
                async move { partition.deregister(version, address).await }
            })
            .await?;
        Ok(removed.unwrap_or(false))
    }

    async fn invoke<T, F, Fut>(
        &self,
        grain_id: &GrainId,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<Option<T>, DirectoryError>
    where
        F: Fn(PartitionRef, MembershipVersion) -> Fut + Send + Sync,
        Fut: Future<Output = Result<DirectoryResult<T>, RpcError>> + Send,
        T: Send,
    {
        if !grain_id.grain_type.is_directory_managed() {
            return Err(DirectoryError::UnsupportedGrainType {
                grain_id: grain_id.clone(),
            });
        }

        let mut view = self.membership.current_view();
        let mut attempts = 0;
        let mut delay = self.config.initial_backoff();
        loop {
            if cancel.is_cancelled() || self.stop.is_cancelled() {
                return Err(DirectoryError::Cancelled);
            }

            let recovery = self.recovery_version();
            let owner = if view.version() < recovery {
                None
            } else {
                view.try_get_owner(grain_id)
            };
            let Some(owner) = owner else {
                if view.members().is_empty() && view.version() > MembershipVersion::MIN {
                    return Ok(None);
                }
                view = self
                    .refresh(view.version().next().max(recovery), cancel)
                    .await?;
                continue;
            };

            tracing::trace!(
                grain = %grain_id,
                owner = %owner.silo,
                partition = owner.partition_index,
                version = %view.version(),
                "routing directory operation"
            );
            let result = match operation(owner.partition, view.version()).await {
                Ok(result) => result,
                Err(err) if err.is_retriable() => {
                    if attempts >= self.config.max_attempts() {
                        return Err(DirectoryError::RemoteUnreachable {
                            silo: owner.silo,
                            attempts,
                        });
                    }
                    attempts += 1;
                    tracing::debug!(
                        grain = %grain_id,
                        target = %owner.silo,
                        error = %err,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "directory partition unreachable, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DirectoryError::Cancelled),
                        _ = self.stop.cancelled() => return Err(DirectoryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = self.config.next_backoff(delay);
                    view = self.membership.current_view();
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if self.recovery_version() != recovery {
                tracing::trace!(grain = %grain_id, "recovery raced operation, retrying");
                view = self.membership.current_view();
                continue;
            }

            match result.try_get_result(view.version()) {
                Ok(value) => return Ok(Some(value)),
                Err(version) => {
                    view = self
                        .refresh(version.max(view.version().next()), cancel)
                        .await?;
                }
            }
        }
    }

    async fn refresh(
        &self,
        target: MembershipVersion,
        cancel: &CancellationToken,
    ) -> Result<Arc<DirectoryMembershipSnapshot>, DirectoryError> {
        tokio::select! {
            _ = self.stop.cancelled() => Err(DirectoryError::Cancelled),
            view = self.membership.refresh_view(target, cancel) => view,
        }
    }
}

/// Push every new ring view to the local partitions.
async fn process_views(
    silo: SiloAddress,
    membership: Arc<DirectoryMembershipService>,
    partitions: Vec<Arc<GrainDirectoryPartition>>,
    stop: CancellationToken,
) {
    let mut views = membership.subscribe();
    let mut previous = Arc::new(DirectoryMembershipSnapshot::default());
    loop {
        let view = views.borrow_and_update().clone();
        if view.version() > previous.version() {
            for change in view.cluster().changes_since(previous.cluster()) {
                if change.status != SiloStatus::Dead {
                    continue;
                }
                for partition in &partitions {
                    partition.on_silo_removed_from_cluster(&change.silo);
                }
            }

            let before = previous.member_ranges(&silo);
            let after = view.member_ranges(&silo);
            tracing::debug!(
                silo = %silo,
                version = %view.version(),
                members = view.members().len(),
                range_percent = after.size_percent(),
                delta_percent = after.size_percent() - before.size_percent(),
                "adopting ring view"
            );

            for partition in &partitions {
                partition.propose_view(Arc::clone(&view));
            }
            previous = view;
        }

        tokio::select! {
            _ = stop.cancelled() => return,
            changed = views.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl GrainDirectory for DistributedGrainDirectory {
    async fn lookup(&self, grain_id: &GrainId) -> Result<Option<GrainAddress>, DirectoryError> {
        self.lookup_with_cancellation(grain_id, &CancellationToken::new())
            .await
    }

    async fn register(&self, address: GrainAddress) -> Result<Option<GrainAddress>, DirectoryError> {
        self.register_with_cancellation(address, None, &CancellationToken::new())
            .await
    }

    async fn register_replacing(
        &self,
        address: GrainAddress,
        previous: Option<GrainAddress>,
    ) -> Result<Option<GrainAddress>, DirectoryError> {
        self.register_with_cancellation(address, previous, &CancellationToken::new())
            .await
    }

    async fn unregister(&self, address: &GrainAddress) -> Result<(), DirectoryError> {
        self.unregister_with_cancellation(address, &CancellationToken::new())
            .await
            .map(|_| ())
    }

    async fn unregister_silos(&self, _silos: &[SiloAddress]) -> Result<(), DirectoryError> {
        // Partitions drop a dead silo's records when membership declares it dead.
        Ok(())
    }
}

#[async_trait::async_trait]
impl GrainDirectoryClientRpc for DistributedGrainDirectory {
    async fn get_registered_activations(
        &self,
        version: MembershipVersion,
        range: RingRange,
        is_validation: bool,
    ) -> Result<Vec<GrainAddress>, RpcError> {
        self.recovery_version.fetch_max(version.0, Ordering::SeqCst);

        let mut found = Vec::new();
        let mut in_doubt = Vec::new();
        for activation in self.activations.activations() {
            if !activation.uses_directory
                || !range.contains(activation.address.grain_id.uniform_hash())
            {
                continue;
            }
            if activation.is_in_doubt() {
                if !is_validation {
                    in_doubt.push(activation.address.grain_id);
                }
                continue;
            }
            found.push(activation.address);
        }

        join_all(in_doubt.iter().map(|grain_id| {
            self.activations
                .deactivate(grain_id, DeactivationReason::DirectoryFailure)
        }))
        .await;

        tracing::debug!(
            silo = %self.silo,
            version = %version,
            range = %range,
            found = found.len(),
            deactivated = in_doubt.len(),
            is_validation,
            "reported registered activations"
        );
        Ok(found)
    }

    async fn recover_registered_activations(
        &self,
        version: MembershipVersion,
        range: RingRange,
        silo: SiloAddress,
        partition_index: usize,
    ) -> Result<Vec<GrainAddress>, RpcError> {
        for partition in &self.partitions {
            partition.on_recovering_partition(&silo, partition_index);
        }
        self.get_registered_activations(version, range, false)
            .await
    }
}

impl fmt::Debug for DistributedGrainDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedGrainDirectory")
            .field("silo", &self.silo)
            .field("lifecycle", &self.lifecycle())
            .field("view_version", &self.membership.current_view().version())
            .field("recovery_version", &self.recovery_version())
            .finish()
    }
}
