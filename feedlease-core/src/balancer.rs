//! Spreads leases evenly across the hosts of a fleet.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{select, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    clock::SharedClock,
    config::ProcessorConfig,
    controller::PartitionController,
    lease::{HostPresence, Lease},
    observer::CloseReason,
    store::LeaseStore,
    Error, Result,
};

/// What the strategy wants this host to do on one balancer tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BalanceDecision {
    /// Unowned or expired leases to try to acquire, oldest first.
    pub acquire: Vec<Lease>,

    /// A lease this host holds beyond its share and should give up.
    pub release: Option<Lease>,
}

/// Aims for every active host to hold `ceil(leases / hosts)` leases,
/// clamped to the configured per-host bounds.
///
/// A host is active if it owns a lease that has not expired, has announced
/// its presence within the expiration interval, or is this host.
///
/// Only unowned or expired leases are ever selected for acquisition. A
/// host releases one lease per tick when it holds more than its target, or
/// more than `floor(leases / hosts)` while some active host holds fewer.
/// The released lease becomes unowned for an under-loaded host to pick up,
/// and while such a host exists, hosts already at the floor stop acquiring.
#[derive(Debug, Clone)]
pub struct EqualPartitionsBalancingStrategy {
    host_id: String,
    min_leases: usize,
    max_leases: Option<usize>,
    expiration: Duration,
}

impl EqualPartitionsBalancingStrategy {
    pub fn new(host_id: &str, config: &ProcessorConfig) -> Self {
        Self {
            host_id: host_id.to_owned(),
            min_leases: config.min_leases_per_host,
            max_leases: config.max_leases_per_host,
            expiration: config.lease_expiration_interval,
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Decide which leases to acquire or release. Leases in `excluded` are
    /// never selected for acquisition.
    pub fn select_leases(
        &self,
        leases: &[Lease],
        presence: &[HostPresence],
        excluded: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> BalanceDecision {
        let mut load: HashMap<&str, usize> = HashMap::new();
        for owner in leases
            .iter()
            .filter(|l| !l.is_expired(now, self.expiration))
            .filter_map(|l| l.owner.as_deref())
        {
            *load.entry(owner).or_default() += 1;
        }
        for p in presence.iter().filter(|p| !p.is_expired(now, self.expiration)) {
            load.entry(p.host_id.as_str()).or_default();
        }
        load.entry(self.host_id.as_str()).or_default();
        let hosts = load.len();

        let target = self.target(leases.len(), hosts);
        let floor = (leases.len() / hosts).min(target);
        let starved = load
            .iter()
            .any(|(host, owned)| *host != self.host_id && *owned < floor);
        let mut mine: Vec<&Lease> = leases
            .iter()
            .filter(|l| l.is_owned_by(&self.host_id))
            .collect();
        trace!(
            total = leases.len(),
            hosts,
            target,
            floor,
            starved,
            owned = mine.len(),
            "balancing"
        );

        let mut decision = BalanceDecision::default();
        let wanted = if starved { floor } else { target };
        if mine.len() < wanted {
            let mut candidates: Vec<&Lease> = leases
                .iter()
                .filter(|l| !l.is_owned_by(&self.host_id))
                .filter(|l| l.is_expired(now, self.expiration))
                .filter(|l| !excluded.contains(&l.partition_id))
                .collect();
            candidates.sort_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.partition_id.cmp(&b.partition_id))
            });
            // Taking one lease per tick while others are around keeps
            // concurrently starting hosts from grabbing everything.
            let take = if hosts > 1 { 1 } else { wanted - mine.len() };
            decision.acquire = candidates.into_iter().take(take).cloned().collect();
        } else if mine.len() > wanted {
            mine.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
            decision.release = mine.last().map(|l| (*l).clone());
        }
        decision
    }

    fn target(&self, total: usize, hosts: usize) -> usize {
        let target = total.div_ceil(hosts.max(1)).max(self.min_leases);
        match self.max_leases {
            Some(max) => target.min(max),
            None => target,
        }
    }
}

/// Periodically applies the balancing strategy through the controller.
pub struct PartitionLoadBalancer<C, S> {
    controller: C,
    store: S,
    strategy: EqualPartitionsBalancingStrategy,
    clock: SharedClock,
    interval: Duration,
    failure_threshold: u32,
}

impl<C: PartitionController, S: LeaseStore> PartitionLoadBalancer<C, S> {
    pub fn new(
        controller: C,
        store: S,
        strategy: EqualPartitionsBalancingStrategy,
        clock: SharedClock,
        config: &ProcessorConfig,
    ) -> Self {
        Self {
            controller,
            store,
            strategy,
            clock,
            interval: config.lease_acquire_interval,
            failure_threshold: config.store_failure_threshold,
        }
    }

    /// Balance on every acquire interval until cancelled.
    ///
    /// Fails with `StoreUnavailable` once the lease store has been
    /// unreachable for `store_failure_threshold` passes in a row.
    #[tracing::instrument(skip_all, err)]
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;
        loop {
            select! {
                _ = cancel.cancelled() => {
                    return Ok(());
                }
                _ = interval.tick() => {
                    match self.balance_once().await {
                        Ok(()) => failures = 0,
                        Err(e) => {
                            failures += 1;
                            warn!(err = %e, failures, "lease store unreachable");
                            if failures >= self.failure_threshold {
                                return Err(Error::StoreUnavailable(failures));
                            }
                        }
                    }
                }
            }
        }
    }

    /// One balancing pass. Only failures to reach the lease store are
    /// returned; failures acting on individual leases are left for the next
    /// pass.
    pub async fn balance_once(&self) -> Result<()> {
        let now = self.clock.now();
        self.store.announce(self.strategy.host_id(), now).await?;
        let leases = self.store.list().await?;
        let presence = self.store.list_hosts().await?;
        let excluded = self.controller.quarantined().await;
        let decision = self
            .strategy
            .select_leases(&leases, &presence, &excluded, now);

        if let Some(lease) = decision.release {
            info!(partition_id = lease.partition_id, "releasing lease to rebalance");
            if let Err(e) = self
                .controller
                .shutdown(&lease.partition_id, CloseReason::Rebalance)
                .await
            {
                debug!(partition_id = lease.partition_id, err = %e, "rebalance release failed");
            }
        }
        for lease in decision.acquire {
            let partition_id = lease.partition_id.clone();
            match self.controller.add_or_update(lease).await {
                Ok(_) => {}
                Err(e) if e.is_lease_lost() => {
                    debug!(partition_id, "lease taken by another host first");
                }
                Err(e) => {
                    warn!(partition_id, err = %e, "failed to take lease");
                }
            }
        }
        Ok(())
    }
}
