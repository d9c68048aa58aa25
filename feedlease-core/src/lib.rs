//! Partition lease coordination and load balancing for a fleet of hosts
//! consuming a partitioned change feed.
//!
//! Hosts coordinate only through a shared [`LeaseStore`]: each partition has
//! a lease record, at most one host processes a partition while its lease is
//! valid, and leases left behind by crashed hosts expire and are picked up
//! by the others.

mod error;
mod retry;

pub mod balancer;
pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod controller;
pub mod feed;
pub mod health;
pub mod lease;
pub mod lease_manager;
pub mod memory;
pub mod observer;
pub mod processor;
pub mod store;
pub mod supervisor;
pub mod synchronizer;

pub use config::{CheckpointFrequency, ProcessorConfig};
pub use error::{Error, Result};
pub use feed::{ChangeFeed, FeedRead, PartitionDescriptor};
pub use lease::{HostPresence, Lease, LockRecord};
pub use observer::{CloseReason, Observer, ObserverContext, ObserverFactory};
pub use processor::{Processor, ProcessorBuilder, ProcessorState};
pub use retry::Retry;
pub use store::{BootstrapStore, LeaseStore};

#[cfg(test)]
pub mod tests;
