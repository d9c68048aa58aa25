//! Reconciles the live partition set of the feed against the lease records.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use tokio::{select, sync::Semaphore, task::JoinSet, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    clock::SharedClock,
    config::ProcessorConfig,
    feed::{ChangeFeed, FeedRead, PartitionDescriptor},
    lease::Lease,
    store::LeaseStore,
    Error, Result,
};

/// Creates leases for new partitions and retires leases of partitions that
/// have been split or merged away.
///
/// Every operation is safe to repeat: creating a lease that already exists
/// and deleting one that is already gone both count as done.
#[derive(Clone)]
pub struct PartitionSynchronizer<S, F> {
    store: S,
    feed: F,
    clock: SharedClock,
    expiration: Duration,
    degree_of_parallelism: usize,
}

impl<S: LeaseStore, F: ChangeFeed> PartitionSynchronizer<S, F> {
    pub fn new(store: S, feed: F, clock: SharedClock, config: &ProcessorConfig) -> Self {
        Self {
            store,
            feed,
            clock,
            expiration: config.lease_expiration_interval,
            degree_of_parallelism: config.degree_of_parallelism,
        }
    }

    /// Bring the lease set in line with the feed's partitions.
    ///
    /// Creates a lease for every live partition without one, then deletes
    /// leases of retired partitions that nobody holds and whose remaining
    /// changes have all been consumed. Retired leases still being drained by
    /// an owner are left to that owner's supervisor.
    #[tracing::instrument(skip_all, err(level = tracing::Level::DEBUG))]
    pub async fn create_missing_leases(&self) -> Result<()> {
        let partitions = self.feed.list_partitions().await.map_err(Error::feed)?;
        let leases = self.store.list().await?;
        let by_id: HashMap<&str, &Lease> = leases
            .iter()
            .map(|lease| (lease.partition_id.as_str(), lease))
            .collect();

        let missing: Vec<Lease> = partitions
            .iter()
            .filter(|p| !by_id.contains_key(p.id.as_str()))
            .map(|p| self.lease_for(p, &by_id))
            .collect();
        if !missing.is_empty() {
            info!(count = missing.len(), "creating leases for new partitions");
        }
        let store = self.store.clone();
        bounded(
            self.degree_of_parallelism,
            missing.into_iter().map(|lease| {
                let store = store.clone();
                async move { create_or_read(&store, &lease).await }
            }),
        )
        .await?;

        let live: HashSet<&str> = partitions.iter().map(|p| p.id.as_str()).collect();
        let now = self.clock.now();
        let mut retire = vec![];
        for lease in leases.iter().filter(|l| !live.contains(l.partition_id.as_str())) {
            if !lease.is_expired(now, self.expiration) {
                debug!(partition_id = lease.partition_id, "retired partition still owned");
                continue;
            }
            match self
                .feed
                .read_changes(
                    &PartitionDescriptor::for_lease(lease),
                    lease.continuation_token.as_deref(),
                    1,
                )
                .await
            {
                Ok(FeedRead::Gone) => retire.push(lease.clone()),
                Ok(FeedRead::Changes { .. }) => {
                    debug!(partition_id = lease.partition_id, "retired partition not yet drained");
                }
                Err(err) => {
                    warn!(partition_id = lease.partition_id, ?err, "failed to probe retired partition");
                }
            }
        }
        if !retire.is_empty() {
            info!(count = retire.len(), "deleting leases of retired partitions");
        }
        bounded(
            self.degree_of_parallelism,
            retire.into_iter().map(|lease| {
                let store = store.clone();
                async move { delete_unless_changed(&store, &lease).await }
            }),
        )
        .await?;
        Ok(())
    }

    /// Replace the lease of a partition the feed reports as gone with leases
    /// for its successors, then delete it.
    ///
    /// Returns the successor leases so the caller can pick them up right
    /// away.
    #[tracing::instrument(skip_all, fields(partition_id = lease.partition_id.as_str()), err(level = tracing::Level::DEBUG))]
    pub async fn handle_partition_gone(&self, lease: &Lease) -> Result<Vec<Lease>> {
        let partitions = self.feed.list_partitions().await.map_err(Error::feed)?;
        let successors: Vec<&PartitionDescriptor> = partitions
            .iter()
            .filter(|p| p.parents.iter().any(|parent| *parent == lease.partition_id))
            .collect();
        if successors.is_empty() {
            return Err(Error::feed(anyhow!(
                "no successors found for partition {}",
                lease.partition_id
            )));
        }

        // Successors that were merged from several parents need to see every
        // parent lease that still exists.
        let leases = self.store.list().await?;
        let mut by_id: HashMap<&str, &Lease> = leases
            .iter()
            .map(|lease| (lease.partition_id.as_str(), lease))
            .collect();
        by_id.insert(lease.partition_id.as_str(), lease);

        let children: Vec<Lease> = successors
            .iter()
            .map(|p| self.lease_for(p, &by_id))
            .collect();
        let store = self.store.clone();
        let children = bounded(
            self.degree_of_parallelism,
            children.into_iter().map(|child| {
                let store = store.clone();
                async move { create_or_read(&store, &child).await }
            }),
        )
        .await?;

        if let Some(current) = self.store.read(&lease.partition_id).await? {
            delete_unless_changed(&self.store, &current).await?;
        }
        info!(
            successors = ?children.iter().map(|l| l.partition_id.as_str()).collect::<Vec<_>>(),
            "retired lease of gone partition"
        );
        Ok(children)
    }

    /// Periodically reconcile until cancelled. Failures are logged and left
    /// for the next run.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken, period: Duration) {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = cancel.cancelled() => {
                    return;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.create_missing_leases().await {
                        warn!(?err, "partition synchronization failed");
                    }
                }
            }
        }
    }

    /// An unowned lease for a partition, carrying lineage from any parent
    /// leases in `existing`.
    ///
    /// A partition split from a single parent resumes from the parent's
    /// continuation. A partition merged from several parents starts at its
    /// own beginning and records each parent's continuation as a property.
    fn lease_for(&self, partition: &PartitionDescriptor, existing: &HashMap<&str, &Lease>) -> Lease {
        let mut lease = Lease::new(partition.id.clone(), self.clock.now());
        lease.set_parents(&partition.parents);
        match partition.parents.as_slice() {
            [] => {}
            [parent] => {
                lease.continuation_token = existing
                    .get(parent.as_str())
                    .and_then(|p| p.continuation_token.clone());
            }
            parents => {
                for parent in parents {
                    if let Some(continuation) = existing
                        .get(parent.as_str())
                        .and_then(|p| p.continuation_token.as_deref())
                    {
                        lease.set_parent_continuation(parent, continuation);
                    }
                }
            }
        }
        lease
    }
}

/// Create `lease`, or return the record another host created first.
async fn create_or_read<S: LeaseStore>(store: &S, lease: &Lease) -> Result<Lease> {
    match store.create(lease).await {
        Ok(created) => Ok(created),
        Err(e) if e.is_conflict() => store
            .read(&lease.partition_id)
            .await?
            .ok_or_else(|| Error::ConcurrencyConflict(lease.partition_id.clone())),
        Err(e) => Err(e),
    }
}

/// Delete `lease` if it has not been written since it was read. A lease
/// that changed in the meantime is left for the next synchronization.
async fn delete_unless_changed<S: LeaseStore>(store: &S, lease: &Lease) -> Result<()> {
    match store.delete(lease).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_conflict() => {
            debug!(partition_id = lease.partition_id, "lease changed before delete");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Run `ops` with at most `limit` in flight. Every op runs to completion;
/// the first failure is returned.
async fn bounded<T, Fut>(limit: usize, ops: impl IntoIterator<Item = Fut>) -> Result<Vec<T>>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();
    for op in ops {
        let permits = permits.clone();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(Error::store)?;
            op.await
        });
    }
    let mut done = vec![];
    let mut first_err = None;
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(value)) => done.push(value),
            Ok(Err(e)) => {
                warn!(err = %e, "synchronization step failed");
                first_err.get_or_insert(e);
            }
            Err(e) => {
                first_err.get_or_insert(Error::store(e));
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(done),
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

    fn synchronizer(
        store: &InMemoryLeaseStore,
        feed: &InMemoryFeed<u32>,
        clock: &ManualClock,
    ) -> PartitionSynchronizer<InMemoryLeaseStore, InMemoryFeed<u32>> {
        let config = ProcessorConfig {
            lease_expiration_interval: Duration::from_secs(10),
            lease_renew_interval: Duration::from_secs(3),
            degree_of_parallelism: 2,
            ..Default::default()
        };
        PartitionSynchronizer::new(store.clone(), feed.clone(), Arc::new(clock.clone()), &config)
    }

    fn ids(leases: &[Lease]) -> Vec<String> {
        let mut ids: Vec<String> = leases.iter().map(|l| l.partition_id.clone()).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_creates_one_lease_per_partition() {
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::<u32>::with_partitions(5).await;
        let clock = ManualClock::default();
        let sync = synchronizer(&store, &feed, &clock);

        sync.create_missing_leases().await.unwrap();
        let first = store.list().await.unwrap();
        assert_eq!(ids(&first), vec!["p0", "p1", "p2", "p3", "p4"]);
        assert!(first.iter().all(|l| l.owner.is_none() && l.continuation_token.is_none()));

        // Already consistent: nothing is written.
        sync.create_missing_leases().await.unwrap();
        assert_eq!(store.list().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_concurrent_runs_do_not_duplicate() {
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::<u32>::with_partitions(8).await;
        let clock = ManualClock::default();
        let a = synchronizer(&store, &feed, &clock);
        let b = synchronizer(&store, &feed, &clock);

        let (res_a, res_b) = tokio::join!(a.create_missing_leases(), b.create_missing_leases());
        res_a.unwrap();
        res_b.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_split_children_inherit_parent_continuation() {
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::<u32>::with_partitions(1).await;
        let clock = ManualClock::default();
        let sync = synchronizer(&store, &feed, &clock);
        sync.create_missing_leases().await.unwrap();

        let mut parent = store.read("p0").await.unwrap().unwrap();
        parent.continuation_token = Some("12".to_owned());
        let parent = store.replace(&parent).await.unwrap();

        feed.split("p0", &["p0a", "p0b"]).await.unwrap();
        let children = sync.handle_partition_gone(&parent).await.unwrap();
        assert_eq!(ids(&children), vec!["p0a", "p0b"]);
        for child in &children {
            assert_eq!(child.continuation_token.as_deref(), Some("12"));
            assert_eq!(child.parents(), vec!["p0".to_owned()]);
        }
        assert_eq!(ids(&store.list().await.unwrap()), vec!["p0a", "p0b"]);

        // A second report of the same split changes nothing.
        let again = sync.handle_partition_gone(&parent).await.unwrap();
        assert_eq!(ids(&again), vec!["p0a", "p0b"]);
    }

    #[tokio::test]
    async fn test_merge_records_each_parent_continuation() {
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::<u32>::with_partitions(2).await;
        let clock = ManualClock::default();
        let sync = synchronizer(&store, &feed, &clock);
        sync.create_missing_leases().await.unwrap();
        for (id, continuation) in [("p0", "3"), ("p1", "5")] {
            let mut lease = store.read(id).await.unwrap().unwrap();
            lease.continuation_token = Some(continuation.to_owned());
            store.replace(&lease).await.unwrap();
        }

        feed.merge(&["p0", "p1"], "p01").await.unwrap();
        sync.create_missing_leases().await.unwrap();

        let merged = store.read("p01").await.unwrap().unwrap();
        assert_eq!(merged.continuation_token, None);
        assert_eq!(merged.parent_continuation("p0"), Some("3"));
        assert_eq!(merged.parent_continuation("p1"), Some("5"));
        // Both parents are unowned and drained, so they are retired.
        assert_eq!(ids(&store.list().await.unwrap()), vec!["p01"]);
    }

    #[tokio::test]
    async fn test_undrained_or_owned_parent_is_kept() {
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::<u32>::with_partitions(2).await;
        let clock = ManualClock::default();
        let sync = synchronizer(&store, &feed, &clock);
        sync.create_missing_leases().await.unwrap();

        feed.push("p0", 1).await.unwrap();
        let mut p1 = store.read("p1").await.unwrap().unwrap();
        p1.owner = Some("a".to_owned());
        p1.timestamp = clock.now();
        store.replace(&p1).await.unwrap();

        feed.split("p0", &["p0a"]).await.unwrap();
        feed.split("p1", &["p1a"]).await.unwrap();
        sync.create_missing_leases().await.unwrap();
        assert_eq!(
            ids(&store.list().await.unwrap()),
            vec!["p0", "p0a", "p1", "p1a"]
        );

        // Once the owner's claim lapses and the parent is empty, it goes.
        clock.advance(Duration::from_secs(11));
        sync.create_missing_leases().await.unwrap();
        assert_eq!(ids(&store.list().await.unwrap()), vec!["p0", "p0a", "p1a"]);
    }

    #[tokio::test]
    async fn test_gone_without_successors_is_an_error() {
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::<u32>::with_partitions(1).await;
        let clock = ManualClock::default();
        let sync = synchronizer(&store, &feed, &clock);
        sync.create_missing_leases().await.unwrap();

        let orphan = Lease::new("p9", clock.now());
        let err = sync.handle_partition_gone(&orphan).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_run_picks_up_new_partitions_until_cancelled() {
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::<u32>::with_partitions(1).await;
        let clock = ManualClock::default();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            synchronizer(&store, &feed, &clock).run(cancel.clone(), Duration::from_millis(10)),
        );

        feed.add_partition("p1").await;
        let s = &store;
        assert!(
            crate::tests::eventually(Duration::from_secs(2), || async move {
                ids(&s.list().await.unwrap()) == ["p0", "p1"]
            })
            .await
        );

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
