//! Tracks the supervisors running on this host.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
};

use tokio::{sync::Mutex, task::JoinSet};
use tracing::{debug, info, warn};

use crate::{
    config::ProcessorConfig,
    feed::ChangeFeed,
    lease::Lease,
    lease_manager::LeaseManager,
    observer::{CloseReason, ObserverFactory},
    store::LeaseStore,
    supervisor::{PartitionSupervisor, SupervisorExit, SupervisorHandle},
    synchronizer::PartitionSynchronizer,
    Error, Result,
};

/// Starts and stops partition supervisors as leases are acquired and given
/// up.
pub trait PartitionController: Clone + Send + Sync + 'static {
    /// Pick up every lease the store already records as owned by this host.
    fn initialize(&self) -> impl Future<Output = Result<()>> + Send;

    /// Acquire the lease and start a supervisor for it, unless one is
    /// already running. Returns whether a supervisor was started.
    fn add_or_update(&self, lease: Lease) -> impl Future<Output = Result<bool>> + Send;

    /// Stop the partition's supervisor, wait for it, and release the lease
    /// unless it was lost in the meantime.
    fn shutdown(
        &self,
        partition_id: &str,
        reason: CloseReason,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Settle a supervisor that stopped on its own.
    fn handle_stopped(&self, exit: SupervisorExit) -> impl Future<Output = Result<()>> + Send;

    /// Stop every supervisor concurrently.
    fn shutdown_all(&self) -> impl Future<Output = Result<()>> + Send;

    /// Partitions with a running supervisor.
    fn running(&self) -> impl Future<Output = HashSet<String>> + Send;

    /// Partitions this host will not pick up again until resumed.
    fn quarantined(&self) -> impl Future<Output = HashSet<String>> + Send;

    /// Allow a quarantined partition to be acquired again. Returns whether
    /// it was quarantined.
    fn resume(&self, partition_id: &str) -> impl Future<Output = bool> + Send;
}

/// Settle every exit already queued on `exits_rx`.
///
/// Exits sent while nothing was receiving, such as after the exit handler
/// was cancelled, would otherwise leave their leases held until expiry.
pub async fn settle_pending_exits<C: PartitionController>(
    controller: &C,
    exits_rx: &flume::Receiver<SupervisorExit>,
) -> usize {
    let mut settled = 0;
    for exit in exits_rx.try_iter() {
        if let Err(e) = controller.handle_stopped(exit).await {
            debug!(err = %e, "supervisor stopped");
        }
        settled += 1;
    }
    settled
}

struct Inner {
    supervisors: HashMap<String, SupervisorHandle>,
    quarantined: HashSet<String>,
    next_supervisor_id: u64,
}

/// The partition controller proper.
///
/// Cheap to clone; clones share the supervisor map, which only the
/// controller mutates. Supervisors report back through the exit channel
/// returned by [`PartitionControllerCore::new`].
pub struct PartitionControllerCore<S, F, OF> {
    inner: Arc<Mutex<Inner>>,
    manager: LeaseManager<S>,
    synchronizer: PartitionSynchronizer<S, F>,
    feed: F,
    factory: OF,
    config: ProcessorConfig,
    exits_tx: flume::Sender<SupervisorExit>,
}

impl<S: Clone, F: Clone, OF: Clone> Clone for PartitionControllerCore<S, F, OF> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            manager: self.manager.clone(),
            synchronizer: self.synchronizer.clone(),
            feed: self.feed.clone(),
            factory: self.factory.clone(),
            config: self.config.clone(),
            exits_tx: self.exits_tx.clone(),
        }
    }
}

impl<S, F, OF> PartitionControllerCore<S, F, OF>
where
    S: LeaseStore,
    F: ChangeFeed,
    OF: ObserverFactory<F::Change>,
{
    pub fn new(
        manager: LeaseManager<S>,
        synchronizer: PartitionSynchronizer<S, F>,
        feed: F,
        factory: OF,
        config: ProcessorConfig,
    ) -> (Self, flume::Receiver<SupervisorExit>) {
        let (exits_tx, exits_rx) = flume::unbounded();
        (
            Self {
                inner: Arc::new(Mutex::new(Inner {
                    supervisors: HashMap::new(),
                    quarantined: HashSet::new(),
                    next_supervisor_id: 0,
                })),
                manager,
                synchronizer,
                feed,
                factory,
                config,
                exits_tx,
            },
            exits_rx,
        )
    }

    pub fn host_id(&self) -> &str {
        self.manager.host_id()
    }

    /// Act on how a supervisor ended, once it is no longer tracked.
    async fn settle(&self, exit: SupervisorExit) -> Result<()> {
        let SupervisorExit {
            partition_id,
            lease,
            reason,
            error,
            ..
        } = exit;
        match reason {
            CloseReason::Shutdown | CloseReason::Rebalance | CloseReason::ReadFailure => {
                self.manager.release(&lease).await?;
            }
            CloseReason::LeaseLost => {
                info!(partition_id, "lease lost");
            }
            CloseReason::ObserverError => {
                warn!(partition_id, "quarantining partition after observer failure");
                self.inner.lock().await.quarantined.insert(partition_id.clone());
                self.manager.release(&lease).await?;
            }
            CloseReason::LeaseGone => {
                let children = match self.synchronizer.handle_partition_gone(&lease).await {
                    Ok(children) => children,
                    Err(e) => {
                        warn!(partition_id, err = %e, "failed to replace gone partition");
                        self.manager.release(&lease).await?;
                        return Err(e);
                    }
                };
                for child in children {
                    let child_id = child.partition_id.clone();
                    if let Err(e) = self.add_or_update(child).await {
                        debug!(partition_id = child_id, err = %e, "did not take over successor");
                    }
                }
            }
        }
        match (reason, error) {
            (_, Some(e)) => Err(e),
            (CloseReason::LeaseLost, None) => Err(Error::LeaseLost(partition_id)),
            _ => Ok(()),
        }
    }
}

impl<S, F, OF> PartitionController for PartitionControllerCore<S, F, OF>
where
    S: LeaseStore,
    F: ChangeFeed,
    OF: ObserverFactory<F::Change>,
{
    #[tracing::instrument(skip_all, fields(host_id = self.host_id()), err)]
    async fn initialize(&self) -> Result<()> {
        let leases = self.manager.store().list().await?;
        for lease in leases.into_iter().filter(|l| l.is_owned_by(self.host_id())) {
            let partition_id = lease.partition_id.clone();
            info!(partition_id, "resuming owned lease");
            if let Err(e) = self.add_or_update(lease).await {
                warn!(partition_id, err = %e, "failed to resume owned lease");
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(partition_id = lease.partition_id.as_str()), err(level = tracing::Level::DEBUG))]
    async fn add_or_update(&self, lease: Lease) -> Result<bool> {
        {
            let inner = self.inner.lock().await;
            if inner.quarantined.contains(&lease.partition_id) {
                debug!("partition is quarantined");
                return Ok(false);
            }
            if inner.supervisors.contains_key(&lease.partition_id) {
                return Ok(false);
            }
        }
        let acquired = self.manager.acquire(&lease).await?;

        let mut inner = self.inner.lock().await;
        if inner.supervisors.contains_key(&lease.partition_id) {
            return Ok(false);
        }
        if inner.quarantined.contains(&lease.partition_id) {
            drop(inner);
            debug!("partition quarantined while acquiring");
            self.manager.release(&acquired).await?;
            return Ok(false);
        }
        inner.next_supervisor_id += 1;
        let supervisor = PartitionSupervisor::new(
            inner.next_supervisor_id,
            acquired,
            self.manager.clone(),
            self.feed.clone(),
            self.factory.create(),
            self.config.clone(),
        );
        let handle = supervisor.start(self.exits_tx.clone());
        inner.supervisors.insert(lease.partition_id.clone(), handle);
        Ok(true)
    }

    #[tracing::instrument(skip_all, fields(partition_id = partition_id, reason = %reason), err(level = tracing::Level::DEBUG))]
    async fn shutdown(&self, partition_id: &str, reason: CloseReason) -> Result<()> {
        let handle = self.inner.lock().await.supervisors.remove(partition_id);
        let Some(handle) = handle else {
            return Ok(());
        };
        match handle.stop(reason).await {
            Some(exit) => self.settle(exit).await,
            None => Ok(()),
        }
    }

    #[tracing::instrument(skip_all, fields(partition_id = exit.partition_id.as_str(), reason = %exit.reason), err(level = tracing::Level::DEBUG))]
    async fn handle_stopped(&self, exit: SupervisorExit) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            match inner.supervisors.get(&exit.partition_id) {
                Some(handle) if handle.id() != exit.supervisor_id => {
                    debug!("exit of a replaced supervisor");
                    return Ok(());
                }
                Some(_) => {
                    inner.supervisors.remove(&exit.partition_id);
                }
                None => {}
            }
        }
        self.settle(exit).await
    }

    #[tracing::instrument(skip_all, fields(host_id = self.host_id()), err)]
    async fn shutdown_all(&self) -> Result<()> {
        let handles: Vec<SupervisorHandle> = {
            let mut inner = self.inner.lock().await;
            inner.supervisors.drain().map(|(_, handle)| handle).collect()
        };
        if handles.is_empty() {
            return Ok(());
        }
        info!(count = handles.len(), "stopping all supervisors");
        let mut tasks = JoinSet::new();
        for handle in handles {
            let controller = self.clone();
            tasks.spawn(async move {
                let partition_id = handle.partition_id().to_owned();
                if let Some(exit) = handle.stop(CloseReason::Shutdown).await {
                    if let Err(e) = controller.settle(exit).await {
                        debug!(partition_id, err = %e, "supervisor stopped with error");
                    }
                }
            });
        }
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!(err = %e, "supervisor shutdown task failed");
            }
        }
        Ok(())
    }

    async fn running(&self) -> HashSet<String> {
        self.inner.lock().await.supervisors.keys().cloned().collect()
    }

    async fn quarantined(&self) -> HashSet<String> {
        self.inner.lock().await.quarantined.clone()
    }

    async fn resume(&self, partition_id: &str) -> bool {
        let resumed = self.inner.lock().await.quarantined.remove(partition_id);
        if resumed {
            info!(partition_id, "partition resumed");
        }
        resumed
    }
}
