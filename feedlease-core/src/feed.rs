//! The monitored change feed, consumed by the core.

use std::future::Future;

use crate::lease::Lease;

/// A disjoint, independently consumable slice of the feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionDescriptor {
    pub id: String,

    /// Partitions this one was split or merged from. Empty for partitions
    /// that existed from the start.
    pub parents: Vec<String>,
}

impl PartitionDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parents: vec![],
        }
    }

    pub fn with_parents(id: impl Into<String>, parents: Vec<String>) -> Self {
        Self {
            id: id.into(),
            parents,
        }
    }

    pub fn for_lease(lease: &Lease) -> Self {
        Self {
            id: lease.partition_id.clone(),
            parents: lease.parents(),
        }
    }
}

/// Outcome of reading one batch from a partition.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedRead<C> {
    /// Changes after the requested continuation, in feed order, with the
    /// continuation to resume from once they are processed. `changes` may be
    /// empty when nothing new has arrived.
    Changes { changes: Vec<C>, continuation: String },

    /// The partition has been split or merged away and will yield no more
    /// changes.
    Gone,
}

pub trait ChangeFeed: Clone + Send + Sync + 'static {
    type Change: Send + Sync + 'static;

    fn list_partitions(
        &self,
    ) -> impl Future<Output = anyhow::Result<Vec<PartitionDescriptor>>> + Send;

    fn read_changes(
        &self,
        partition: &PartitionDescriptor,
        continuation: Option<&str>,
        max_batch_size: usize,
    ) -> impl Future<Output = anyhow::Result<FeedRead<Self::Change>>> + Send;
}
