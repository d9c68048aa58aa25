//! One-time, fleet-wide creation of the initial lease set.

use std::time::Duration;

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    clock::SharedClock,
    config::ProcessorConfig,
    feed::ChangeFeed,
    lease::LockRecord,
    store::{BootstrapStore, LeaseStore},
    synchronizer::PartitionSynchronizer,
    Error, Result,
};

/// Makes sure every partition has a lease before any host starts
/// processing.
///
/// Hosts starting together contend for a lock record; the winner runs the
/// synchronizer and marks the store initialized, the others poll until that
/// marker appears. A lock left behind by a crashed host expires after the
/// configured lock duration.
pub struct Bootstrapper<S, F> {
    store: S,
    synchronizer: PartitionSynchronizer<S, F>,
    host_id: String,
    clock: SharedClock,
    lock_duration: Duration,
    sleep_interval: Duration,
    timeout: Option<Duration>,
}

impl<S, F> Bootstrapper<S, F>
where
    S: LeaseStore + BootstrapStore,
    F: ChangeFeed,
{
    pub fn new(
        store: S,
        synchronizer: PartitionSynchronizer<S, F>,
        host_id: &str,
        clock: SharedClock,
        config: &ProcessorConfig,
    ) -> Self {
        Self {
            store,
            synchronizer,
            host_id: host_id.to_owned(),
            clock,
            lock_duration: config.bootstrap_lock_duration,
            sleep_interval: config.bootstrap_sleep_interval,
            timeout: config.bootstrap_timeout,
        }
    }

    #[tracing::instrument(skip_all, fields(host_id = self.host_id.as_str()), err)]
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        let started = tokio::time::Instant::now();
        loop {
            if self.store.is_initialized().await? {
                debug!("lease store already initialized");
                return Ok(());
            }
            if let Some(lock) = self.try_lock().await? {
                info!("holding bootstrap lock, creating leases");
                let res = self.bootstrap().await;
                self.unlock(&lock).await;
                match res {
                    Ok(()) => {
                        info!("bootstrap complete");
                        return Ok(());
                    }
                    Err(e) if e.is_transient() => {
                        warn!(err = %e, "bootstrap failed, will retry");
                    }
                    Err(e) => return Err(e),
                }
            } else {
                debug!("another host is bootstrapping");
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    return Err(Error::BootstrapLockTimeout);
                }
            }
            select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(self.sleep_interval) => {}
            }
        }
    }

    async fn bootstrap(&self) -> Result<()> {
        self.synchronizer.create_missing_leases().await?;
        self.store.mark_initialized().await
    }

    /// Take the bootstrap lock if it is free, expired or already ours.
    async fn try_lock(&self) -> Result<Option<LockRecord>> {
        let now = self.clock.now();
        let res = match self.store.read_lock().await? {
            None => self.store.create_lock(&LockRecord::new(&self.host_id, now)).await,
            Some(lock) if lock.owner == self.host_id || lock.is_expired(now, self.lock_duration) => {
                if lock.owner != self.host_id {
                    info!(previous_owner = lock.owner, "breaking expired bootstrap lock");
                }
                let mut claimed = LockRecord::new(&self.host_id, now);
                claimed.concurrency_token = lock.concurrency_token;
                self.store.replace_lock(&claimed).await
            }
            Some(lock) => {
                debug!(owner = lock.owner, "bootstrap lock is held");
                return Ok(None);
            }
        };
        match res {
            Ok(lock) => Ok(Some(lock)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn unlock(&self, lock: &LockRecord) {
        if let Err(err) = self.store.delete_lock(lock).await {
            warn!(?err, "failed to release bootstrap lock; it will expire");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        memory::{InMemoryFeed, InMemoryLeaseStore},
    };

    fn config() -> ProcessorConfig {
        ProcessorConfig {
            bootstrap_lock_duration: Duration::from_secs(30),
            bootstrap_sleep_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn bootstrapper(
        store: &InMemoryLeaseStore,
        feed: &InMemoryFeed<u32>,
        clock: &ManualClock,
        host: &str,
        config: &ProcessorConfig,
    ) -> Bootstrapper<InMemoryLeaseStore, InMemoryFeed<u32>> {
        let clock: SharedClock = Arc::new(clock.clone());
        let sync = PartitionSynchronizer::new(store.clone(), feed.clone(), clock.clone(), config);
        Bootstrapper::new(store.clone(), sync, host, clock, config)
    }

    #[tokio::test]
    async fn test_concurrent_bootstrap_creates_each_lease_once() {
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::<u32>::with_partitions(6).await;
        let clock = ManualClock::default();
        let config = config();
        let a = bootstrapper(&store, &feed, &clock, "a", &config);
        let b = bootstrapper(&store, &feed, &clock, "b", &config);
        let cancel = CancellationToken::new();

        let (res_a, res_b) = tokio::join!(a.initialize(&cancel), b.initialize(&cancel));
        res_a.unwrap();
        res_b.unwrap();

        assert!(store.is_initialized().await.unwrap());
        assert!(store.read_lock().await.unwrap().is_none());
        let leases = store.list().await.unwrap();
        assert_eq!(leases.len(), 6);

        // A later start skips bootstrap entirely, even if partitions appear.
        feed.add_partition("p6").await;
        a.initialize(&cancel).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_expired_lock_of_crashed_host_is_broken() {
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::<u32>::with_partitions(2).await;
        let clock = ManualClock::default();
        store
            .create_lock(&LockRecord::new("crashed", clock.now()))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(31));

        let a = bootstrapper(&store, &feed, &clock, "a", &config());
        a.initialize(&CancellationToken::new()).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_held_lock_times_out() {
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::<u32>::with_partitions(2).await;
        let clock = ManualClock::default();
        store
            .create_lock(&LockRecord::new("other", clock.now()))
            .await
            .unwrap();

        let config = ProcessorConfig {
            bootstrap_timeout: Some(Duration::from_millis(30)),
            ..config()
        };
        let a = bootstrapper(&store, &feed, &clock, "a", &config);
        let err = a.initialize(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::BootstrapLockTimeout));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::<u32>::with_partitions(1).await;
        let clock = ManualClock::default();
        store
            .create_lock(&LockRecord::new("other", clock.now()))
            .await
            .unwrap();
        let a = bootstrapper(&store, &feed, &clock, "a", &config());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(a.initialize(&cancel).await.unwrap_err().is_cancelled());
    }
}
