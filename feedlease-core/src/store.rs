//! Persistence capabilities consumed by the coordination core.
//!
//! Every mutation is conditional: writes carry the concurrency token of the
//! record they were derived from, and fail with
//! [`Error::ConcurrencyConflict`](crate::Error::ConcurrencyConflict) if the
//! stored record has moved on. Transport failures are reported as
//! [`Error::Store`](crate::Error::Store).

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::{
    lease::{HostPresence, Lease, LockRecord},
    Result,
};

/// Storage for lease records.
pub trait LeaseStore: Clone + Send + Sync + 'static {
    /// All lease records.
    fn list(&self) -> impl Future<Output = Result<Vec<Lease>>> + Send;

    /// The current lease record for a partition, if any.
    fn read(&self, partition_id: &str) -> impl Future<Output = Result<Option<Lease>>> + Send;

    /// Create a lease. Fails with `ConcurrencyConflict` if a record for the
    /// partition already exists. Returns the stored record with its new
    /// concurrency token.
    fn create(&self, lease: &Lease) -> impl Future<Output = Result<Lease>> + Send;

    /// Replace a lease if the stored concurrency token still equals
    /// `lease.concurrency_token`. Fails with `LeaseNotFound` if the record
    /// is gone.
    fn replace(&self, lease: &Lease) -> impl Future<Output = Result<Lease>> + Send;

    /// Delete a lease if the stored concurrency token still equals
    /// `lease.concurrency_token`. Deleting a missing record succeeds.
    fn delete(&self, lease: &Lease) -> impl Future<Output = Result<()>> + Send;

    /// Record that `host_id` is alive as of `now`. Each host only writes its
    /// own presence record, so this is an unconditional upsert.
    fn announce(&self, host_id: &str, now: DateTime<Utc>)
        -> impl Future<Output = Result<()>> + Send;

    /// Remove the presence record of a host leaving the fleet.
    fn withdraw(&self, host_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Presence records of every host that has announced itself.
    fn list_hosts(&self) -> impl Future<Output = Result<Vec<HostPresence>>> + Send;
}

/// Storage for the markers that make bootstrap a one-time, fleet-wide step.
pub trait BootstrapStore: Clone + Send + Sync + 'static {
    fn is_initialized(&self) -> impl Future<Output = Result<bool>> + Send;

    fn mark_initialized(&self) -> impl Future<Output = Result<()>> + Send;

    fn read_lock(&self) -> impl Future<Output = Result<Option<LockRecord>>> + Send;

    /// Create the lock record. Fails with `ConcurrencyConflict` if it exists.
    fn create_lock(&self, lock: &LockRecord) -> impl Future<Output = Result<LockRecord>> + Send;

    /// Conditionally replace the lock record.
    fn replace_lock(&self, lock: &LockRecord) -> impl Future<Output = Result<LockRecord>> + Send;

    /// Conditionally delete the lock record. Deleting a missing record succeeds.
    fn delete_lock(&self, lock: &LockRecord) -> impl Future<Output = Result<()>> + Send;
}
