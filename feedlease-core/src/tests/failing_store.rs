use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::anyhow;
use chrono::{DateTime, Utc};

use crate::{
    lease::{HostPresence, Lease, LockRecord},
    memory::InMemoryLeaseStore,
    store::{BootstrapStore, LeaseStore},
    Error, Result,
};

/// Lease store that can be switched off, as seen from one host.
///
/// While down, every operation fails with a transient store error. The
/// underlying store stays available to other hosts sharing it. Lease
/// writes can also be slowed down.
#[derive(Clone)]
pub struct FailingStore {
    inner: InMemoryLeaseStore,
    down: Arc<AtomicBool>,
    write_latency_ms: Arc<AtomicU64>,
}

impl FailingStore {
    pub fn new(inner: InMemoryLeaseStore) -> Self {
        Self {
            inner,
            down: Arc::new(AtomicBool::new(false)),
            write_latency_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_write_latency(&self, latency: Duration) {
        self.write_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::store(anyhow!("store unreachable")));
        }
        Ok(())
    }
}

impl LeaseStore for FailingStore {
    async fn list(&self) -> Result<Vec<Lease>> {
        self.check()?;
        self.inner.list().await
    }

    async fn read(&self, partition_id: &str) -> Result<Option<Lease>> {
        self.check()?;
        self.inner.read(partition_id).await
    }

    async fn create(&self, lease: &Lease) -> Result<Lease> {
        self.check()?;
        self.inner.create(lease).await
    }

    async fn replace(&self, lease: &Lease) -> Result<Lease> {
        let latency = self.write_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.check()?;
        self.inner.replace(lease).await
    }

    async fn delete(&self, lease: &Lease) -> Result<()> {
        self.check()?;
        self.inner.delete(lease).await
    }

    async fn announce(&self, host_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.check()?;
        self.inner.announce(host_id, now).await
    }

    async fn withdraw(&self, host_id: &str) -> Result<()> {
        self.check()?;
        self.inner.withdraw(host_id).await
    }

    async fn list_hosts(&self) -> Result<Vec<HostPresence>> {
        self.check()?;
        self.inner.list_hosts().await
    }
}

impl BootstrapStore for FailingStore {
    async fn is_initialized(&self) -> Result<bool> {
        self.check()?;
        self.inner.is_initialized().await
    }

    async fn mark_initialized(&self) -> Result<()> {
        self.check()?;
        self.inner.mark_initialized().await
    }

    async fn read_lock(&self) -> Result<Option<LockRecord>> {
        self.check()?;
        self.inner.read_lock().await
    }

    async fn create_lock(&self, lock: &LockRecord) -> Result<LockRecord> {
        self.check()?;
        self.inner.create_lock(lock).await
    }

    async fn replace_lock(&self, lock: &LockRecord) -> Result<LockRecord> {
        self.check()?;
        self.inner.replace_lock(lock).await
    }

    async fn delete_lock(&self, lock: &LockRecord) -> Result<()> {
        self.check()?;
        self.inner.delete_lock(lock).await
    }
}
