//! In-process lease store and change feed.
//!
//! Both are cheap to clone; clones share state, so several processors in
//! one process can coordinate through the same store the way separate hosts
//! coordinate through a database.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    feed::{ChangeFeed, FeedRead, PartitionDescriptor},
    lease::{HostPresence, Lease, LockRecord},
    store::{BootstrapStore, LeaseStore},
    Error, Result,
};

#[derive(Default)]
struct StoreState {
    leases: BTreeMap<String, Lease>,
    hosts: BTreeMap<String, HostPresence>,
    lock: Option<LockRecord>,
    initialized: bool,
    next_etag: u64,
}

impl StoreState {
    fn next_etag(&mut self) -> String {
        self.next_etag += 1;
        format!("\"{:08x}\"", self.next_etag)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryLeaseStore {
    inner: Arc<Mutex<StoreState>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases currently owned by each host, for inspection.
    pub async fn ownership(&self) -> BTreeMap<String, Vec<String>> {
        let inner = self.inner.lock().await;
        let mut owners: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for lease in inner.leases.values() {
            if let Some(owner) = &lease.owner {
                owners
                    .entry(owner.clone())
                    .or_default()
                    .push(lease.partition_id.clone());
            }
        }
        owners
    }
}

impl LeaseStore for InMemoryLeaseStore {
    async fn list(&self) -> Result<Vec<Lease>> {
        let inner = self.inner.lock().await;
        Ok(inner.leases.values().cloned().collect())
    }

    async fn read(&self, partition_id: &str) -> Result<Option<Lease>> {
        let inner = self.inner.lock().await;
        Ok(inner.leases.get(partition_id).cloned())
    }

    async fn create(&self, lease: &Lease) -> Result<Lease> {
        let mut inner = self.inner.lock().await;
        if inner.leases.contains_key(&lease.partition_id) {
            return Err(Error::ConcurrencyConflict(lease.partition_id.clone()));
        }
        let mut stored = lease.clone();
        stored.concurrency_token = Some(inner.next_etag());
        inner
            .leases
            .insert(stored.partition_id.clone(), stored.clone());
        debug!(partition_id = stored.partition_id, "created lease");
        Ok(stored)
    }

    async fn replace(&self, lease: &Lease) -> Result<Lease> {
        let mut inner = self.inner.lock().await;
        let etag = inner.next_etag();
        let current = inner
            .leases
            .get_mut(&lease.partition_id)
            .ok_or_else(|| Error::LeaseNotFound(lease.partition_id.clone()))?;
        if current.concurrency_token != lease.concurrency_token {
            return Err(Error::ConcurrencyConflict(lease.partition_id.clone()));
        }
        let mut stored = lease.clone();
        stored.concurrency_token = Some(etag);
        *current = stored.clone();
        Ok(stored)
    }

    async fn delete(&self, lease: &Lease) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.leases.get(&lease.partition_id) {
            None => Ok(()),
            Some(current) if current.concurrency_token != lease.concurrency_token => {
                Err(Error::ConcurrencyConflict(lease.partition_id.clone()))
            }
            Some(_) => {
                inner.leases.remove(&lease.partition_id);
                debug!(partition_id = lease.partition_id, "deleted lease");
                Ok(())
            }
        }
    }

    async fn announce(&self, host_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.hosts.insert(
            host_id.to_owned(),
            HostPresence {
                host_id: host_id.to_owned(),
                last_seen: now,
            },
        );
        Ok(())
    }

    async fn withdraw(&self, host_id: &str) -> Result<()> {
        self.inner.lock().await.hosts.remove(host_id);
        Ok(())
    }

    async fn list_hosts(&self) -> Result<Vec<HostPresence>> {
        let inner = self.inner.lock().await;
        Ok(inner.hosts.values().cloned().collect())
    }
}

const LOCK_ID: &str = "bootstrap lock";

impl BootstrapStore for InMemoryLeaseStore {
    async fn is_initialized(&self) -> Result<bool> {
        Ok(self.inner.lock().await.initialized)
    }

    async fn mark_initialized(&self) -> Result<()> {
        self.inner.lock().await.initialized = true;
        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<LockRecord>> {
        Ok(self.inner.lock().await.lock.clone())
    }

    async fn create_lock(&self, lock: &LockRecord) -> Result<LockRecord> {
        let mut inner = self.inner.lock().await;
        if inner.lock.is_some() {
            return Err(Error::ConcurrencyConflict(LOCK_ID.to_owned()));
        }
        let mut stored = lock.clone();
        stored.concurrency_token = Some(inner.next_etag());
        inner.lock = Some(stored.clone());
        Ok(stored)
    }

    async fn replace_lock(&self, lock: &LockRecord) -> Result<LockRecord> {
        let mut inner = self.inner.lock().await;
        match &inner.lock {
            Some(current) if current.concurrency_token == lock.concurrency_token => {}
            _ => return Err(Error::ConcurrencyConflict(LOCK_ID.to_owned())),
        }
        let mut stored = lock.clone();
        stored.concurrency_token = Some(inner.next_etag());
        inner.lock = Some(stored.clone());
        Ok(stored)
    }

    async fn delete_lock(&self, lock: &LockRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match &inner.lock {
            None => Ok(()),
            Some(current) if current.concurrency_token != lock.concurrency_token => {
                Err(Error::ConcurrencyConflict(LOCK_ID.to_owned()))
            }
            Some(_) => {
                inner.lock = None;
                Ok(())
            }
        }
    }
}

struct PartitionLog<C> {
    descriptor: PartitionDescriptor,
    entries: Vec<(u64, C)>,
    retired: bool,
}

struct FeedState<C> {
    partitions: BTreeMap<String, PartitionLog<C>>,
    next_seq: u64,
}

/// A change feed held in memory.
///
/// Every change gets a feed-wide sequence number; continuation tokens are
/// the last sequence number delivered, so a partition split from a parent
/// can resume from the parent's continuation.
pub struct InMemoryFeed<C> {
    inner: Arc<Mutex<FeedState<C>>>,
}

impl<C> Clone for InMemoryFeed<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> Default for InMemoryFeed<C> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FeedState {
                partitions: BTreeMap::new(),
                next_seq: 0,
            })),
        }
    }
}

impl<C: Clone + Send + Sync + 'static> InMemoryFeed<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A feed with partitions `p0`..`p{n-1}`.
    pub async fn with_partitions(n: usize) -> Self {
        let feed = Self::new();
        for i in 0..n {
            feed.add_partition(&format!("p{i}")).await;
        }
        feed
    }

    pub async fn add_partition(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        inner.partitions.insert(
            id.to_owned(),
            PartitionLog {
                descriptor: PartitionDescriptor::new(id),
                entries: vec![],
                retired: false,
            },
        );
    }

    /// Append a change to a live partition.
    pub async fn push(&self, partition_id: &str, change: C) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let log = inner
            .partitions
            .get_mut(partition_id)
            .filter(|log| !log.retired)
            .ok_or_else(|| anyhow!("no live partition {partition_id}"))?;
        log.entries.push((seq, change));
        Ok(())
    }

    /// Retire `parent` and replace it with `children`.
    pub async fn split(&self, parent: &str, children: &[&str]) -> anyhow::Result<()> {
        self.replace_partitions(&[parent], children).await
    }

    /// Retire `parents` and replace them with a single `child`.
    pub async fn merge(&self, parents: &[&str], child: &str) -> anyhow::Result<()> {
        self.replace_partitions(parents, &[child]).await
    }

    async fn replace_partitions(&self, retire: &[&str], create: &[&str]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        for id in retire {
            let log = inner
                .partitions
                .get_mut(*id)
                .filter(|log| !log.retired)
                .ok_or_else(|| anyhow!("no live partition {id}"))?;
            log.retired = true;
        }
        let parents: Vec<String> = retire.iter().map(|id| id.to_string()).collect();
        for id in create {
            inner.partitions.insert(
                id.to_string(),
                PartitionLog {
                    descriptor: PartitionDescriptor::with_parents(*id, parents.clone()),
                    entries: vec![],
                    retired: false,
                },
            );
        }
        Ok(())
    }

    /// Number of changes appended per partition, including retired ones.
    pub async fn lengths(&self) -> HashMap<String, usize> {
        let inner = self.inner.lock().await;
        inner
            .partitions
            .iter()
            .map(|(id, log)| (id.clone(), log.entries.len()))
            .collect()
    }
}

impl<C: Clone + Send + Sync + 'static> ChangeFeed for InMemoryFeed<C> {
    type Change = C;

    async fn list_partitions(&self) -> anyhow::Result<Vec<PartitionDescriptor>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .partitions
            .values()
            .filter(|log| !log.retired)
            .map(|log| log.descriptor.clone())
            .collect())
    }

    async fn read_changes(
        &self,
        partition: &PartitionDescriptor,
        continuation: Option<&str>,
        max_batch_size: usize,
    ) -> anyhow::Result<FeedRead<C>> {
        let after = match continuation {
            None => 0,
            Some(token) => token
                .parse::<u64>()
                .map_err(|e| anyhow!("malformed continuation {token:?}: {e}"))?,
        };
        let inner = self.inner.lock().await;
        let log = inner
            .partitions
            .get(&partition.id)
            .ok_or_else(|| anyhow!("unknown partition {}", partition.id))?;
        let batch: Vec<&(u64, C)> = log
            .entries
            .iter()
            .filter(|(seq, _)| *seq > after)
            .take(max_batch_size)
            .collect();
        if batch.is_empty() && log.retired {
            return Ok(FeedRead::Gone);
        }
        let last = batch.last().map(|(seq, _)| *seq).unwrap_or(after);
        Ok(FeedRead::Changes {
            changes: batch.into_iter().map(|(_, change)| change.clone()).collect(),
            continuation: last.to_string(),
        })
    }
}
