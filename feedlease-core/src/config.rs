use std::time::Duration;

use crate::{Error, Result};

/// How often processed progress is written back to the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFrequency {
    /// After every successfully processed batch.
    EveryBatch,

    /// After every n successfully processed batches.
    Batches(u32),

    /// After a processed batch once this much time has passed since the
    /// last checkpoint.
    Interval(Duration),
}

/// Configuration for a change feed processor host.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// A lease not renewed for this long may be taken by another host.
    pub lease_expiration_interval: Duration,

    /// How often an owned lease is renewed. Must be shorter than the
    /// expiration interval.
    pub lease_renew_interval: Duration,

    /// How often the balancer looks for leases to acquire.
    pub lease_acquire_interval: Duration,

    /// How often the partition set is reconciled against the leases.
    pub partition_sync_interval: Duration,

    /// Delay before reading again after an empty batch.
    pub feed_poll_delay: Duration,

    /// Maximum number of changes requested per feed read.
    pub max_batch_size: usize,

    pub checkpoint_frequency: CheckpointFrequency,

    /// Minimum number of leases this host aims to hold.
    pub min_leases_per_host: usize,

    /// Maximum number of leases this host may hold, unlimited if `None`.
    pub max_leases_per_host: Option<usize>,

    /// Maximum concurrent lease creations or deletions while synchronizing.
    pub degree_of_parallelism: usize,

    /// How long the bootstrap lock is held before other hosts may break it.
    pub bootstrap_lock_duration: Duration,

    /// Wait between checks while another host is bootstrapping.
    pub bootstrap_sleep_interval: Duration,

    /// Give up waiting for bootstrap after this long, never if `None`.
    pub bootstrap_timeout: Option<Duration>,

    /// Conditional write retries when a checkpoint or renewal races with
    /// another write to the same lease.
    pub checkpoint_retry_attempts: u32,

    /// How long transient feed read failures are retried before the
    /// partition is given up.
    pub feed_retry_max_elapsed: Duration,

    /// Consecutive failed lease listings after which the lease store is
    /// considered unavailable and the processor stops.
    pub store_failure_threshold: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            lease_expiration_interval: Duration::from_secs(60),
            lease_renew_interval: Duration::from_secs(17),
            lease_acquire_interval: Duration::from_secs(13),
            partition_sync_interval: Duration::from_secs(60),
            feed_poll_delay: Duration::from_secs(5),
            max_batch_size: 100,
            checkpoint_frequency: CheckpointFrequency::EveryBatch,
            min_leases_per_host: 0,
            max_leases_per_host: None,
            degree_of_parallelism: 25,
            bootstrap_lock_duration: Duration::from_secs(30),
            bootstrap_sleep_interval: Duration::from_secs(15),
            bootstrap_timeout: None,
            checkpoint_retry_attempts: 5,
            feed_retry_max_elapsed: Duration::from_secs(15),
            store_failure_threshold: 10,
        }
    }
}

impl ProcessorConfig {
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: &str) -> Result<()> {
            Err(Error::InvalidConfig(msg.to_owned()))
        }
        if self.lease_expiration_interval.is_zero() {
            return invalid("lease expiration interval must be positive");
        }
        if self.lease_renew_interval.is_zero()
            || self.lease_renew_interval >= self.lease_expiration_interval
        {
            return invalid("lease renew interval must be positive and shorter than the expiration interval");
        }
        if self.lease_acquire_interval.is_zero() || self.partition_sync_interval.is_zero() {
            return invalid("acquire and synchronization intervals must be positive");
        }
        if self.max_batch_size == 0 {
            return invalid("max batch size must be positive");
        }
        if let CheckpointFrequency::Batches(0) = self.checkpoint_frequency {
            return invalid("checkpoint batch count must be positive");
        }
        if let Some(max) = self.max_leases_per_host {
            if max == 0 || max < self.min_leases_per_host {
                return invalid("max leases per host must be positive and at least the minimum");
            }
        }
        if self.degree_of_parallelism == 0 {
            return invalid("degree of parallelism must be positive");
        }
        if self.bootstrap_lock_duration.is_zero() || self.bootstrap_sleep_interval.is_zero() {
            return invalid("bootstrap lock duration and sleep interval must be positive");
        }
        if self.store_failure_threshold == 0 {
            return invalid("store failure threshold must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        ProcessorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_renew_must_be_shorter_than_expiration() {
        let config = ProcessorConfig {
            lease_expiration_interval: Duration::from_secs(10),
            lease_renew_interval: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_lease_bounds() {
        let config = ProcessorConfig {
            min_leases_per_host: 3,
            max_leases_per_host: Some(2),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ProcessorConfig {
            min_leases_per_host: 2,
            max_leases_per_host: Some(2),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_checkpoint_batches_rejected() {
        let config = ProcessorConfig {
            checkpoint_frequency: CheckpointFrequency::Batches(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
