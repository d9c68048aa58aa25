//! Lease records persisted in the lease store.

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};

/// Property key listing the partitions this lease's partition was split or
/// merged from, comma separated.
pub const PARENTS_PROPERTY: &str = "parents";

const PARENT_CONTINUATION_PREFIX: &str = "parent_continuation.";

/// Ownership record for one partition of the monitored feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Stable identifier of the partition.
    pub partition_id: String,

    /// Host currently holding the lease, `None` if unowned.
    pub owner: Option<String>,

    /// How far the partition's feed has been consumed. `None` is the start
    /// of the feed.
    pub continuation_token: Option<String>,

    /// Last time the lease was acquired, renewed or released.
    pub timestamp: DateTime<Utc>,

    /// Version stamp assigned by the store on every write. `None` until the
    /// lease has been persisted.
    pub concurrency_token: Option<String>,

    /// Auxiliary metadata, such as partition lineage.
    pub properties: BTreeMap<String, String>,
}

impl Lease {
    /// An unowned lease starting at the beginning of the feed.
    pub fn new(partition_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            partition_id: partition_id.into(),
            owner: None,
            continuation_token: None,
            timestamp: now,
            concurrency_token: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn is_owned_by(&self, host_id: &str) -> bool {
        self.owner.as_deref() == Some(host_id)
    }

    /// Whether the owner's claim has lapsed. Unowned leases are always
    /// considered expired.
    pub fn is_expired(&self, now: DateTime<Utc>, expiration: Duration) -> bool {
        match self.owner {
            None => true,
            Some(_) => elapsed(self.timestamp, now) > expiration,
        }
    }

    /// Whether `host_id` may take this lease right now.
    pub fn is_acquirable_by(&self, host_id: &str, now: DateTime<Utc>, expiration: Duration) -> bool {
        self.is_owned_by(host_id) || self.is_expired(now, expiration)
    }

    pub fn parents(&self) -> Vec<String> {
        self.properties
            .get(PARENTS_PROPERTY)
            .map(|parents| {
                parents
                    .split(',')
                    .filter(|p| !p.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_parents(&mut self, parents: &[String]) {
        if parents.is_empty() {
            self.properties.remove(PARENTS_PROPERTY);
        } else {
            self.properties
                .insert(PARENTS_PROPERTY.to_owned(), parents.join(","));
        }
    }

    /// Continuation the given parent partition had reached when this lease
    /// was derived from it.
    pub fn parent_continuation(&self, parent_id: &str) -> Option<&str> {
        self.properties
            .get(&format!("{PARENT_CONTINUATION_PREFIX}{parent_id}"))
            .map(String::as_str)
    }

    pub fn set_parent_continuation(&mut self, parent_id: &str, continuation: &str) {
        self.properties.insert(
            format!("{PARENT_CONTINUATION_PREFIX}{parent_id}"),
            continuation.to_owned(),
        );
    }
}

/// Record guarding one-time initialization of the lease set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub concurrency_token: Option<String>,
}

impl LockRecord {
    pub fn new(owner: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            owner: owner.into(),
            acquired_at: now,
            concurrency_token: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, lock_duration: Duration) -> bool {
        elapsed(self.acquired_at, now) > lock_duration
    }
}

/// Heartbeat a host leaves in the store so peers count it as active before
/// it owns any lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPresence {
    pub host_id: String,
    pub last_seen: DateTime<Utc>,
}

impl HostPresence {
    pub fn is_expired(&self, now: DateTime<Utc>, expiration: Duration) -> bool {
        elapsed(self.last_seen, now) > expiration
    }
}

/// Time from `then` until `now`, zero if `then` is in the future.
pub(crate) fn elapsed(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}
