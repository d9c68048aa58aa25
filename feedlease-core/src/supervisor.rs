//! The per-partition worker: renews the lease, pumps changes through the
//! observer and checkpoints progress.

use std::time::Duration;

use anyhow::anyhow;
use tokio::{select, sync::watch, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    backoff_retry,
    config::{CheckpointFrequency, ProcessorConfig},
    feed::{ChangeFeed, FeedRead, PartitionDescriptor},
    lease::Lease,
    lease_manager::LeaseManager,
    observer::{CloseReason, Observer, ObserverContext},
    retry::{classify, Retry},
    store::LeaseStore,
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// Report of a supervisor that has stopped.
#[derive(Debug)]
pub struct SupervisorExit {
    pub partition_id: String,
    pub supervisor_id: u64,

    /// Most recent lease snapshot held by the pump.
    pub lease: Lease,

    pub reason: CloseReason,

    /// The failure behind the stop, if any.
    pub error: Option<Error>,
}

/// Drives one owned partition until it is stopped or stops itself.
pub struct PartitionSupervisor<S, F: ChangeFeed, O> {
    id: u64,
    lease: Lease,
    manager: LeaseManager<S>,
    feed: F,
    observer: O,
    config: ProcessorConfig,
}

impl<S, F, O> PartitionSupervisor<S, F, O>
where
    S: LeaseStore,
    F: ChangeFeed,
    O: Observer<F::Change>,
{
    pub fn new(
        id: u64,
        lease: Lease,
        manager: LeaseManager<S>,
        feed: F,
        observer: O,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            id,
            lease,
            manager,
            feed,
            observer,
            config,
        }
    }

    /// Start the supervisor.
    ///
    /// If the supervisor stops on its own, because the lease was lost, the
    /// partition is gone, or the observer or feed failed, its exit is sent
    /// to `exits_tx`. An exit caused by [`SupervisorHandle::stop`] is
    /// returned from `stop` instead.
    pub fn start(self, exits_tx: flume::Sender<SupervisorExit>) -> SupervisorHandle {
        let id = self.id;
        let partition_id = self.lease.partition_id.clone();
        let cancel = CancellationToken::new();
        let (reason_tx, reason_rx) = watch::channel(CloseReason::Shutdown);
        let (state_tx, state_rx) = watch::channel(SupervisorState::NotStarted);

        let fallback_lease = self.lease.clone();
        let inner = self.run(cancel.clone(), reason_rx, state_tx.clone());
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let exit = match tokio::spawn(inner).await {
                Ok(exit) => exit,
                Err(e) => {
                    error!(partition_id = fallback_lease.partition_id, err = %e, "supervisor task failed");
                    SupervisorExit {
                        partition_id: fallback_lease.partition_id.clone(),
                        supervisor_id: id,
                        error: Some(Error::observer(
                            &fallback_lease.partition_id,
                            anyhow!("supervisor task failed: {e}"),
                        )),
                        lease: fallback_lease,
                        reason: CloseReason::ObserverError,
                    }
                }
            };
            state_tx.send_replace(SupervisorState::Stopped);
            if task_cancel.is_cancelled() {
                return Some(exit);
            }
            if exits_tx.send_async(exit).await.is_err() {
                debug!("supervisor exit dropped, controller has stopped");
            }
            None
        });

        SupervisorHandle {
            id,
            partition_id,
            cancel,
            reason_tx,
            state_rx,
            task,
        }
    }

    #[tracing::instrument(skip_all, fields(partition_id = self.lease.partition_id.as_str(), supervisor_id = self.id))]
    async fn run(
        self,
        cancel: CancellationToken,
        reason_rx: watch::Receiver<CloseReason>,
        state_tx: watch::Sender<SupervisorState>,
    ) -> SupervisorExit {
        let PartitionSupervisor {
            id,
            lease,
            manager,
            feed,
            mut observer,
            config,
        } = self;
        let ctx = ObserverContext {
            partition_id: lease.partition_id.clone(),
            host_id: manager.host_id().to_owned(),
        };
        let exit = |lease: Lease, reason: CloseReason, error: Option<Error>| SupervisorExit {
            partition_id: ctx.partition_id.clone(),
            supervisor_id: id,
            lease,
            reason,
            error,
        };
        state_tx.send_replace(SupervisorState::Running);

        if let Err(e) = observer.open(&ctx).await {
            let err = Error::observer(&ctx.partition_id, e);
            warn!(err = %err, "observer failed to open");
            return exit(lease, CloseReason::ObserverError, Some(err));
        }
        info!("processing partition");

        let retry = Retry::with_max_elapsed(config.feed_retry_max_elapsed);
        let mut pump = Pump {
            lease: lease.clone(),
            pending: None,
            batches: 0,
            last_checkpoint: Instant::now(),
        };
        let (reason, error) = select! {
            _ = cancel.cancelled() => {
                let reason = *reason_rx.borrow();
                (reason, None)
            }
            err = renew_loop(&manager, lease, &config) => {
                (CloseReason::LeaseLost, Some(err))
            }
            res = pump.run(&manager, &feed, &mut observer, &ctx, &config, &cancel, &retry) => {
                match res {
                    Ok(reason) => (reason, None),
                    Err(Error::Cancelled) => {
                        let reason = *reason_rx.borrow();
                        (reason, None)
                    }
                    Err(e) if e.is_lease_lost() => (CloseReason::LeaseLost, Some(e)),
                    Err(e) if e.is_observer_failure() => (CloseReason::ObserverError, Some(e)),
                    Err(e) => (CloseReason::ReadFailure, Some(e)),
                }
            }
        };
        state_tx.send_replace(SupervisorState::Stopping);
        debug!(%reason, "stopping");

        // Progress from batches the observer has already accepted is kept,
        // unless the lease now belongs to someone else.
        if reason != CloseReason::LeaseLost {
            if let Err(err) = pump.checkpoint(&manager, &cancel, &retry).await {
                warn!(err = %err, "failed to flush checkpoint");
            }
        }

        let mut error = error;
        if let Err(e) = observer.close(&ctx, reason).await {
            let err = Error::observer(&ctx.partition_id, e);
            warn!(err = %err, "observer failed to close");
            error.get_or_insert(err);
        }
        info!(%reason, "stopped processing partition");
        exit(pump.lease, reason, error)
    }
}

/// Renew the lease until it is lost.
///
/// Transient failures are tolerated while the lease is still valid. The
/// loop gives up no later than the instant other hosts may take the lease,
/// even if a renewal is still pending then.
async fn renew_loop<S: LeaseStore>(
    manager: &LeaseManager<S>,
    mut lease: Lease,
    config: &ProcessorConfig,
) -> Error {
    let period = config.lease_renew_interval;
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    let mut expires_at = Instant::now() + manager.valid_for(&lease);
    loop {
        select! {
            _ = tokio::time::sleep_until(expires_at) => {
                warn!("lease expired before it could be renewed");
                return Error::LeaseLost(lease.partition_id.clone());
            }
            _ = interval.tick() => {}
        }
        // The stored timestamp is taken after this, so the new expiry is
        // never later than the one other hosts see.
        let started = Instant::now();
        match tokio::time::timeout_at(expires_at, manager.renew(&lease)).await {
            Ok(Ok(renewed)) => {
                lease = renewed;
                expires_at = started + config.lease_expiration_interval;
            }
            Ok(Err(e)) if e.is_lease_lost() => return e,
            Ok(Err(e)) => warn!(err = %e, "lease renewal failed, retrying"),
            Err(_) => {
                warn!("lease expired while renewal was pending");
                return Error::LeaseLost(lease.partition_id.clone());
            }
        }
    }
}

/// Feed pump state, kept outside the pump loop so that accepted progress
/// can be flushed after the loop is interrupted.
struct Pump {
    lease: Lease,

    /// Continuation after the last batch the observer accepted, not yet
    /// checkpointed.
    pending: Option<String>,

    batches: u32,
    last_checkpoint: Instant,
}

impl Pump {
    /// Read, process and checkpoint batches until the partition is gone or
    /// something fails.
    #[allow(clippy::too_many_arguments)]
    async fn run<S, F, O>(
        &mut self,
        manager: &LeaseManager<S>,
        feed: &F,
        observer: &mut O,
        ctx: &ObserverContext,
        config: &ProcessorConfig,
        cancel: &CancellationToken,
        retry: &Retry,
    ) -> Result<CloseReason>
    where
        S: LeaseStore,
        F: ChangeFeed,
        O: Observer<F::Change>,
    {
        loop {
            let descriptor = PartitionDescriptor::for_lease(&self.lease);
            let continuation = self
                .pending
                .clone()
                .or_else(|| self.lease.continuation_token.clone());
            let mut read = None;
            backoff_retry!(cancel, retry, {
                let batch = feed
                    .read_changes(&descriptor, continuation.as_deref(), config.max_batch_size)
                    .await
                    .map_err(|e| backoff::Error::transient(Error::feed(e)))?;
                read = Some(batch);
            })?;

            match read {
                Some(FeedRead::Gone) => {
                    info!("partition is gone");
                    self.checkpoint(manager, cancel, retry).await?;
                    return Ok(CloseReason::LeaseGone);
                }
                Some(FeedRead::Changes {
                    changes,
                    continuation,
                }) => {
                    if changes.is_empty() {
                        if self.is_due(config.checkpoint_frequency) {
                            self.checkpoint(manager, cancel, retry).await?;
                        }
                        tokio::time::sleep(config.feed_poll_delay).await;
                        continue;
                    }
                    trace!(count = changes.len(), "processing batch");
                    observer
                        .process_changes(ctx, &changes)
                        .await
                        .map_err(|e| Error::observer(&ctx.partition_id, e))?;
                    self.pending = Some(continuation);
                    self.batches += 1;
                    if self.is_due(config.checkpoint_frequency) {
                        self.checkpoint(manager, cancel, retry).await?;
                    }
                }
                None => continue,
            }
        }
    }

    fn is_due(&self, frequency: CheckpointFrequency) -> bool {
        match frequency {
            CheckpointFrequency::EveryBatch => true,
            CheckpointFrequency::Batches(n) => self.batches >= n,
            CheckpointFrequency::Interval(interval) => self.last_checkpoint.elapsed() >= interval,
        }
    }

    /// Write pending progress to the lease, if there is any.
    async fn checkpoint<S: LeaseStore>(
        &mut self,
        manager: &LeaseManager<S>,
        cancel: &CancellationToken,
        retry: &Retry,
    ) -> Result<()> {
        let Some(continuation) = self.pending.clone() else {
            return Ok(());
        };
        let mut updated = None;
        backoff_retry!(cancel, retry, {
            let lease = manager
                .checkpoint(&self.lease, &continuation)
                .await
                .map_err(classify)?;
            updated = Some(lease);
        })?;
        if let Some(lease) = updated {
            self.lease = lease;
        }
        self.pending = None;
        self.batches = 0;
        self.last_checkpoint = Instant::now();
        Ok(())
    }
}

/// Control over a running supervisor, held by the partition controller.
pub struct SupervisorHandle {
    id: u64,
    partition_id: String,
    cancel: CancellationToken,
    reason_tx: watch::Sender<CloseReason>,
    state_rx: watch::Receiver<SupervisorState>,
    task: JoinHandle<Option<SupervisorExit>>,
}

impl SupervisorHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    /// Stop the supervisor and wait for it to finish.
    ///
    /// Returns `None` if the supervisor had already stopped on its own, in
    /// which case its exit went to the controller's exit channel.
    pub async fn stop(self, reason: CloseReason) -> Option<SupervisorExit> {
        self.reason_tx.send_replace(reason);
        self.cancel.cancel();
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(partition_id = self.partition_id, err = %e, "supervisor join failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        clock::{Clock, SharedClock, SystemClock},
        memory::{InMemoryFeed, InMemoryLeaseStore},
        tests::{eventually, FailingStore, ObserverEvent, RecordingObserver},
    };

    struct Setup {
        store: InMemoryLeaseStore,
        feed: InMemoryFeed<u32>,
        manager: LeaseManager<InMemoryLeaseStore>,
        config: ProcessorConfig,
        lease: Lease,
    }

    async fn setup(config: ProcessorConfig) -> Setup {
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::<u32>::with_partitions(1).await;
        let manager = LeaseManager::new(
            store.clone(),
            "host-a",
            Arc::new(SystemClock),
            config.lease_expiration_interval,
            config.checkpoint_retry_attempts,
        );
        let lease = store.create(&Lease::new("p0", SystemClock.now())).await.unwrap();
        let lease = manager.acquire(&lease).await.unwrap();
        Setup {
            store,
            feed,
            manager,
            config,
            lease,
        }
    }

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig {
            lease_expiration_interval: Duration::from_millis(400),
            lease_renew_interval: Duration::from_millis(50),
            feed_poll_delay: Duration::from_millis(5),
            feed_retry_max_elapsed: Duration::from_millis(100),
            max_batch_size: 3,
            ..Default::default()
        }
    }

    fn supervisor(
        s: &Setup,
        observer: RecordingObserver,
    ) -> PartitionSupervisor<InMemoryLeaseStore, InMemoryFeed<u32>, RecordingObserver> {
        PartitionSupervisor::new(
            1,
            s.lease.clone(),
            s.manager.clone(),
            s.feed.clone(),
            observer,
            s.config.clone(),
        )
    }

    async fn stored_continuation(store: &InMemoryLeaseStore) -> Option<String> {
        store.read("p0").await.unwrap().unwrap().continuation_token
    }

    #[tokio::test]
    async fn test_delivers_in_order_and_checkpoints_every_batch() {
        let s = setup(fast_config()).await;
        for i in 1..=10 {
            s.feed.push("p0", i).await.unwrap();
        }
        let observer = RecordingObserver::new();
        let (exits_tx, _exits_rx) = flume::unbounded();
        let handle = supervisor(&s, observer.clone()).start(exits_tx);

        let store = &s.store;
        assert!(eventually(Duration::from_secs(2), || async move {
            stored_continuation(store).await.as_deref() == Some("10")
        })
        .await);
        assert_eq!(observer.processed("p0"), (1..=10).collect::<Vec<u32>>());
        assert_eq!(handle.state(), SupervisorState::Running);

        let exit = handle.stop(CloseReason::Shutdown).await.unwrap();
        assert_eq!(exit.reason, CloseReason::Shutdown);
        assert!(exit.error.is_none());
        assert_eq!(observer.closed("p0"), vec![CloseReason::Shutdown]);
        assert_eq!(stored_continuation(&s.store).await.as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_graceful_stop_flushes_uncheckpointed_batches() {
        let s = setup(ProcessorConfig {
            checkpoint_frequency: CheckpointFrequency::Batches(100),
            ..fast_config()
        })
        .await;
        for i in 1..=7 {
            s.feed.push("p0", i).await.unwrap();
        }
        let observer = RecordingObserver::new();
        let (exits_tx, _exits_rx) = flume::unbounded();
        let handle = supervisor(&s, observer.clone()).start(exits_tx);

        let recorded = &observer;
        assert!(eventually(Duration::from_secs(2), || async move {
            recorded.processed("p0").len() == 7
        })
        .await);
        assert_eq!(stored_continuation(&s.store).await, None);

        handle.stop(CloseReason::Rebalance).await.unwrap();
        assert_eq!(stored_continuation(&s.store).await.as_deref(), Some("7"));
        assert_eq!(observer.closed("p0"), vec![CloseReason::Rebalance]);
    }

    #[tokio::test]
    async fn test_observer_failure_stops_without_checkpointing_failed_batch() {
        let s = setup(fast_config()).await;
        for i in 1..=6 {
            s.feed.push("p0", i).await.unwrap();
        }
        let observer = RecordingObserver::failing_on(5);
        let (exits_tx, exits_rx) = flume::unbounded();
        let _handle = supervisor(&s, observer.clone()).start(exits_tx);

        let exit = exits_rx.recv_async().await.unwrap();
        assert_eq!(exit.reason, CloseReason::ObserverError);
        assert!(exit.error.unwrap().is_observer_failure());
        assert_eq!(observer.processed("p0"), vec![1, 2, 3]);
        assert_eq!(stored_continuation(&s.store).await.as_deref(), Some("3"));
        assert_eq!(observer.closed("p0"), vec![CloseReason::ObserverError]);
    }

    #[tokio::test]
    async fn test_lease_taken_by_another_host_stops_supervisor() {
        let s = setup(fast_config()).await;
        let observer = RecordingObserver::new();
        let (exits_tx, exits_rx) = flume::unbounded();
        let _handle = supervisor(&s, observer.clone()).start(exits_tx);

        let mut stolen = s.store.read("p0").await.unwrap().unwrap();
        stolen.owner = Some("host-b".to_owned());
        s.store.replace(&stolen).await.unwrap();

        let exit = exits_rx.recv_async().await.unwrap();
        assert_eq!(exit.reason, CloseReason::LeaseLost);
        assert!(exit.error.unwrap().is_lease_lost());
        assert_eq!(observer.closed("p0"), vec![CloseReason::LeaseLost]);
        let stored = s.store.read("p0").await.unwrap().unwrap();
        assert_eq!(stored.owner.as_deref(), Some("host-b"));
    }

    #[tokio::test]
    async fn test_gone_partition_checkpoints_and_reports_lease_gone() {
        let s = setup(fast_config()).await;
        s.feed.push("p0", 1).await.unwrap();
        s.feed.push("p0", 2).await.unwrap();
        s.feed.split("p0", &["p0a", "p0b"]).await.unwrap();

        let observer = RecordingObserver::new();
        let (exits_tx, exits_rx) = flume::unbounded();
        let _handle = supervisor(&s, observer.clone()).start(exits_tx);

        let exit = exits_rx.recv_async().await.unwrap();
        assert_eq!(exit.reason, CloseReason::LeaseGone);
        assert!(exit.error.is_none());
        assert_eq!(exit.lease.continuation_token.as_deref(), Some("2"));
        assert_eq!(observer.processed("p0"), vec![1, 2]);
        assert_eq!(
            observer.events().last(),
            Some(&ObserverEvent::Closed("p0".to_owned(), CloseReason::LeaseGone))
        );
    }

    #[tokio::test]
    async fn test_empty_batches_are_not_delivered() {
        let s = setup(fast_config()).await;
        let observer = RecordingObserver::new();
        let (exits_tx, _exits_rx) = flume::unbounded();
        let handle = supervisor(&s, observer.clone()).start(exits_tx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        s.feed.push("p0", 1).await.unwrap();
        let recorded = &observer;
        assert!(eventually(Duration::from_secs(2), || async move {
            recorded.processed("p0") == vec![1]
        })
        .await);
        handle.stop(CloseReason::Shutdown).await.unwrap();

        let batches = observer
            .events()
            .into_iter()
            .filter(|e| matches!(e, ObserverEvent::Batch(..)))
            .count();
        assert_eq!(batches, 1);
    }

    #[tokio::test]
    async fn test_interval_checkpoint_written_while_feed_is_quiet() {
        let s = setup(ProcessorConfig {
            checkpoint_frequency: CheckpointFrequency::Interval(Duration::from_millis(100)),
            ..fast_config()
        })
        .await;
        let observer = RecordingObserver::new();
        let (exits_tx, _exits_rx) = flume::unbounded();
        let handle = supervisor(&s, observer.clone()).start(exits_tx);

        s.feed.push("p0", 1).await.unwrap();
        let store = &s.store;
        assert!(eventually(Duration::from_secs(2), || async move {
            stored_continuation(store).await.as_deref() == Some("1")
        })
        .await);
        assert_eq!(observer.processed("p0"), vec![1]);
        assert_eq!(handle.state(), SupervisorState::Running);
        handle.stop(CloseReason::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_by_expiry_when_store_is_unreachable() {
        let config = ProcessorConfig {
            lease_expiration_interval: Duration::from_millis(600),
            lease_renew_interval: Duration::from_millis(250),
            ..fast_config()
        };
        let store = InMemoryLeaseStore::new();
        let flaky = FailingStore::new(store.clone());
        let feed = InMemoryFeed::<u32>::with_partitions(1).await;
        let clock: SharedClock = Arc::new(SystemClock);
        let manager_a = LeaseManager::new(
            flaky.clone(),
            "host-a",
            clock.clone(),
            config.lease_expiration_interval,
            config.checkpoint_retry_attempts,
        );
        let manager_b = LeaseManager::new(
            store.clone(),
            "host-b",
            clock,
            config.lease_expiration_interval,
            config.checkpoint_retry_attempts,
        );
        let lease = store.create(&Lease::new("p0", SystemClock.now())).await.unwrap();
        let lease = manager_a.acquire(&lease).await.unwrap();
        let (exits_tx, exits_rx) = flume::unbounded();
        let handle = PartitionSupervisor::new(
            1,
            lease,
            manager_a,
            feed,
            RecordingObserver::new(),
            config,
        )
        .start(exits_tx);

        // One renewal goes through, then host-a loses the store.
        tokio::time::sleep(Duration::from_millis(300)).await;
        flaky.set_down(true);

        loop {
            let current = store.read("p0").await.unwrap().unwrap();
            if manager_b.acquire(&current).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let handle = &handle;
        assert!(
            eventually(Duration::from_millis(30), || async move {
                handle.state() != SupervisorState::Running
            })
            .await,
            "host-a still processing after host-b took the lease"
        );
        let exit = exits_rx.recv_async().await.unwrap();
        assert_eq!(exit.reason, CloseReason::LeaseLost);
    }
}
