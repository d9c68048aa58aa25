//! Ownership operations on leases, built on conditional store writes.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, trace};

use crate::{
    clock::SharedClock,
    lease::{elapsed, Lease},
    store::LeaseStore,
    Error, Result,
};

/// Acquires, renews, releases and checkpoints leases on behalf of one host.
///
/// Cheap to clone; clones act for the same host.
#[derive(Clone)]
pub struct LeaseManager<S> {
    store: S,
    host_id: Arc<str>,
    clock: SharedClock,
    expiration: Duration,
    retry_attempts: u32,
}

impl<S: LeaseStore> LeaseManager<S> {
    pub fn new(
        store: S,
        host_id: &str,
        clock: SharedClock,
        expiration: Duration,
        retry_attempts: u32,
    ) -> Self {
        Self {
            store,
            host_id: host_id.into(),
            clock,
            expiration,
            retry_attempts,
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Time left before other hosts may take the lease, judging by its
    /// stored timestamp.
    pub fn valid_for(&self, lease: &Lease) -> Duration {
        self.expiration
            .saturating_sub(elapsed(lease.timestamp, self.clock.now()))
    }

    /// Take ownership of a lease that is unowned, expired, or already ours.
    ///
    /// Fails with `LeaseLost` if another host validly owns the lease or wins
    /// the race to write it; the caller must not assume ownership then.
    #[tracing::instrument(skip_all, fields(partition_id = lease.partition_id.as_str()), err(level = tracing::Level::DEBUG))]
    pub async fn acquire(&self, lease: &Lease) -> Result<Lease> {
        let now = self.clock.now();
        if !lease.is_acquirable_by(&self.host_id, now, self.expiration) {
            debug!(owner = ?lease.owner, "lease is held by another host");
            return Err(Error::LeaseLost(lease.partition_id.clone()));
        }
        let mut claimed = lease.clone();
        claimed.owner = Some(self.host_id.to_string());
        claimed.timestamp = now;
        match self.store.replace(&claimed).await {
            Ok(acquired) => {
                info!(previous_owner = ?lease.owner, "acquired lease");
                Ok(acquired)
            }
            Err(Error::ConcurrencyConflict(_)) | Err(Error::LeaseNotFound(_)) => {
                debug!("lost the race to acquire");
                Err(Error::LeaseLost(lease.partition_id.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh the timestamp of a lease this host owns.
    #[tracing::instrument(skip_all, fields(partition_id = lease.partition_id.as_str()), err(level = tracing::Level::DEBUG))]
    pub async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let renewed = self
            .update_properties(lease, |lease, now| lease.timestamp = now)
            .await?;
        trace!("renewed lease");
        Ok(renewed)
    }

    /// Give up ownership of a lease.
    ///
    /// If another host has already taken the lease, or it no longer exists,
    /// there is nothing to release and this succeeds.
    #[tracing::instrument(skip_all, fields(partition_id = lease.partition_id.as_str()), err(level = tracing::Level::DEBUG))]
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        match self
            .update_properties(lease, |lease, now| {
                lease.owner = None;
                lease.timestamp = now;
            })
            .await
        {
            Ok(_) => {
                info!("released lease");
                Ok(())
            }
            Err(Error::LeaseLost(_)) => {
                debug!("lease already transferred, nothing to release");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Persist the continuation reached after successfully processing a
    /// batch.
    #[tracing::instrument(skip_all, fields(partition_id = lease.partition_id.as_str(), continuation = continuation), err(level = tracing::Level::DEBUG))]
    pub async fn checkpoint(&self, lease: &Lease, continuation: &str) -> Result<Lease> {
        let updated = self
            .update_properties(lease, |lease, _| {
                lease.continuation_token = Some(continuation.to_owned())
            })
            .await?;
        debug!("checkpointed");
        Ok(updated)
    }

    /// Apply `mutate` to the lease and write it conditionally, re-reading
    /// and re-applying after each conflicting write.
    ///
    /// Fails with `LeaseLost` once the lease is owned by someone else, has
    /// been deleted, or keeps conflicting past the retry budget.
    pub async fn update_properties<F>(&self, lease: &Lease, mut mutate: F) -> Result<Lease>
    where
        F: FnMut(&mut Lease, chrono::DateTime<chrono::Utc>) + Send,
    {
        let lost = || Error::LeaseLost(lease.partition_id.clone());
        let mut current = lease.clone();
        for attempt in 0..=self.retry_attempts {
            if !current.is_owned_by(&self.host_id) {
                debug!(owner = ?current.owner, "lease owned by another host");
                return Err(lost());
            }
            let mut updated = current.clone();
            mutate(&mut updated, self.clock.now());
            match self.store.replace(&updated).await {
                Ok(stored) => return Ok(stored),
                Err(Error::ConcurrencyConflict(_)) => {
                    trace!(attempt, "conflicting lease write, re-reading");
                    current = self.store.read(&lease.partition_id).await?.ok_or_else(lost)?;
                }
                Err(Error::LeaseNotFound(_)) => return Err(lost()),
                Err(e) => return Err(e),
            }
        }
        debug!("too many conflicting writes");
        Err(lost())
    }
}
