//! Publishes ring views as the cluster membership changes.
//!
//! # Design
//!
//! Every membership snapshot from the [`MembershipProvider`] is turned into
//! a [`DirectoryMembershipSnapshot`] and published on a `watch` channel.
//! The channel only ever moves forward: a view replaces the current one
//! only if its version is at least as high, so concurrent publishers cannot
//! roll the view back.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::directory::rpc::DirectoryTransport;
use crate::directory::snapshot::DirectoryMembershipSnapshot;
use crate::error::DirectoryError;
use crate::membership::{ClusterMembershipSnapshot, MembershipProvider};
use crate::types::MembershipVersion;

/// Source of ring views for one silo.
#[derive(Debug)]
pub struct DirectoryMembershipService {
    provider: Arc<dyn MembershipProvider>,
    transport: Arc<dyn DirectoryTransport>,
    partitions_per_silo: usize,
    views: watch::Sender<Arc<DirectoryMembershipSnapshot>>,
}

impl DirectoryMembershipService {
    /// Create a service starting from the empty view.
    pub fn new(
        provider: Arc<dyn MembershipProvider>,
        transport: Arc<dyn DirectoryTransport>,
        partitions_per_silo: usize,
    ) -> Self {
        let (views, _) = watch::channel(Arc::new(DirectoryMembershipSnapshot::default()));
        Self {
            provider,
            transport,
            partitions_per_silo,
            views,
        }
    }

    /// The latest published view.
    pub fn current_view(&self) -> Arc<DirectoryMembershipSnapshot> {
        self.views.borrow().clone()
    }

    /// Subscribe to view updates.
    pub fn subscribe(&self) -> watch::Receiver<Arc<DirectoryMembershipSnapshot>> {
        self.views.subscribe()
    }

    /// Build and publish the view for `cluster`.
    ///
    /// A view replaces the current one if its version is at least as high.
    /// Returns `false` if a newer view was already published.
    pub fn publish(&self, cluster: Arc<ClusterMembershipSnapshot>) -> bool {
        if cluster.version < self.views.borrow().version() {
            return false;
        }
        let view = Arc::new(DirectoryMembershipSnapshot::new(
            cluster,
            self.partitions_per_silo,
            self.transport.as_ref(),
        ));
        self.views.send_if_modified(|current| {
            if view.version() >= current.version() {
                *current = Arc::clone(&view);
                true
            } else {
                false
            }
        })
    }

    /// Follow the provider until `stop` is cancelled.
    pub async fn run(&self, stop: CancellationToken) {
        let mut updates = self.provider.subscribe();
        loop {
            let cluster = updates.borrow_and_update().clone();
            if self.publish(cluster) {
                tracing::trace!(version = %self.views.borrow().version(), "published ring view");
            }

            tokio::select! {
                _ = stop.cancelled() => return,
                changed = updates.changed() => {
                    if changed.is_err() {
                        tracing::debug!("membership provider closed");
                        return;
                    }
                }
            }
        }
    }

    /// Wait until a view at or above `target` is published.
    ///
    /// Hints the provider first, since the caller knows `target` exists.
    pub async fn refresh_view(
        &self,
        target: MembershipVersion,
        cancel: &CancellationToken,
    ) -> Result<Arc<DirectoryMembershipSnapshot>, DirectoryError> {
        let mut views = self.views.subscribe();
        if views.borrow().version() >= target {
            return Ok(self.current_view());
        }

        self.provider.refresh(Some(target)).await;
        tokio::select! {
            _ = cancel.cancelled() => Err(DirectoryError::Cancelled),
            view = views.wait_for(|view| view.version() >= target) => view
                .map(|view| Arc::clone(&*view))
                .map_err(|_| DirectoryError::Cancelled),
        }
    }
}
