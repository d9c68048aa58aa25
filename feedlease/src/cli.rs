use std::time::Duration;

use anyhow::{Error, Result};
use clap::{Args, Parser, Subcommand};
use feedlease_core::ProcessorConfig;

#[derive(Parser, Debug)]
#[command(name = "feedlease")]
#[command(bin_name = "feedlease")]
pub struct Cli {
    #[command(subcommand)]
    pub commands: Commands,
}

impl Cli {
    pub fn version(&self) -> bool {
        matches!(self.commands, Commands::Version)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a fleet of processors sharing one in-memory lease store and feed.
    Simulate(SimulateArgs),
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of processor hosts.
    #[arg(long, short = 'n', env, default_value = "3")]
    pub hosts: usize,

    /// Number of feed partitions at start.
    #[arg(long, short = 'p', env, default_value = "8")]
    pub partitions: usize,

    /// Changes appended to the feed per second, across all partitions.
    #[arg(long, env, default_value = "20")]
    pub changes_per_sec: u32,

    /// Split one partition in two after this many seconds.
    #[arg(long, env)]
    pub split_after_secs: Option<u64>,

    /// Stop one host after this many seconds, leaving its leases to the
    /// others.
    #[arg(long, env)]
    pub stop_host_after_secs: Option<u64>,

    /// Exit after this many seconds instead of waiting for ctrl-c.
    #[arg(long, env)]
    pub run_secs: Option<u64>,

    /// Log the lease ownership table this often.
    #[arg(long, env, default_value = "5")]
    pub report_secs: u64,

    #[arg(long, env, default_value = "10")]
    pub lease_expiration_secs: u64,

    #[arg(long, env, default_value = "3")]
    pub lease_renew_secs: u64,

    #[arg(long, env, default_value = "2")]
    pub lease_acquire_secs: u64,

    #[arg(long, env, default_value = "5")]
    pub partition_sync_secs: u64,

    #[arg(long, env, default_value = "250")]
    pub feed_poll_delay_ms: u64,

    #[arg(long, env, default_value = "100")]
    pub max_batch_size: usize,
}

impl SimulateArgs {
    pub fn processor_config(&self) -> Result<ProcessorConfig> {
        if self.hosts == 0 || self.partitions == 0 {
            return Err(Error::msg("at least one host and one partition are required"));
        }
        if self.report_secs == 0 {
            return Err(Error::msg("report interval must be positive"));
        }
        let config = ProcessorConfig {
            lease_expiration_interval: Duration::from_secs(self.lease_expiration_secs),
            lease_renew_interval: Duration::from_secs(self.lease_renew_secs),
            lease_acquire_interval: Duration::from_secs(self.lease_acquire_secs),
            partition_sync_interval: Duration::from_secs(self.partition_sync_secs),
            feed_poll_delay: Duration::from_millis(self.feed_poll_delay_ms),
            max_batch_size: self.max_batch_size,
            bootstrap_sleep_interval: Duration::from_millis(500),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulate_defaults() {
        let cli = Cli::try_parse_from(["feedlease", "simulate"]).unwrap();
        let Commands::Simulate(args) = cli.commands else {
            panic!("expected simulate");
        };
        assert_eq!(args.hosts, 3);
        assert_eq!(args.partitions, 8);
        let config = args.processor_config().unwrap();
        assert_eq!(config.lease_expiration_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_renew_not_shorter_than_expiration_rejected() {
        let cli = Cli::try_parse_from([
            "feedlease",
            "simulate",
            "--lease-renew-secs",
            "10",
            "--lease-expiration-secs",
            "10",
        ])
        .unwrap();
        let Commands::Simulate(args) = cli.commands else {
            panic!("expected simulate");
        };
        assert!(args.processor_config().is_err());
    }

    #[test]
    fn test_version() {
        assert!(Cli::try_parse_from(["feedlease", "version"]).unwrap().version());
    }
}
