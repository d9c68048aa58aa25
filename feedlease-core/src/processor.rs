//! Lifecycle of a change feed processor host.

use std::{fmt, sync::Arc};

use tokio::{
    select,
    sync::{watch, Mutex},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    balancer::{EqualPartitionsBalancingStrategy, PartitionLoadBalancer},
    bootstrap::Bootstrapper,
    clock::{SharedClock, SystemClock},
    config::ProcessorConfig,
    controller::{settle_pending_exits, PartitionController, PartitionControllerCore},
    feed::ChangeFeed,
    health::{
        HealthMonitor, HealthMonitoringController, HealthRecord, MonitoredOperation,
        TraceHealthMonitor,
    },
    lease_manager::LeaseManager,
    observer::ObserverFactory,
    store::{BootstrapStore, LeaseStore},
    supervisor::SupervisorExit,
    synchronizer::PartitionSynchronizer,
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Built but not started.
    Configured,
    Running,
    Stopped,

    /// Stopped because the lease store became unavailable.
    Failed,
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessorState::Configured => "configured",
            ProcessorState::Running => "running",
            ProcessorState::Stopped => "stopped",
            ProcessorState::Failed => "failed",
        })
    }
}

/// Configures a [`Processor`].
pub struct ProcessorBuilder<S, F, OF, H = TraceHealthMonitor> {
    host_id: String,
    store: S,
    feed: F,
    factory: OF,
    monitor: H,
    clock: SharedClock,
    config: ProcessorConfig,
}

impl<S, F, OF> ProcessorBuilder<S, F, OF, TraceHealthMonitor> {
    pub fn new(host_id: impl Into<String>, store: S, feed: F, factory: OF) -> Self {
        Self {
            host_id: host_id.into(),
            store,
            feed,
            factory,
            monitor: TraceHealthMonitor,
            clock: Arc::new(SystemClock),
            config: ProcessorConfig::default(),
        }
    }
}

impl<S, F, OF, H> ProcessorBuilder<S, F, OF, H> {
    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_health_monitor<H2>(self, monitor: H2) -> ProcessorBuilder<S, F, OF, H2> {
        ProcessorBuilder {
            host_id: self.host_id,
            store: self.store,
            feed: self.feed,
            factory: self.factory,
            monitor,
            clock: self.clock,
            config: self.config,
        }
    }
}

impl<S, F, OF, H> ProcessorBuilder<S, F, OF, H>
where
    S: LeaseStore + BootstrapStore,
    F: ChangeFeed,
    OF: ObserverFactory<F::Change>,
    H: HealthMonitor,
{
    pub fn build(self) -> Result<Processor<S, F, OF, H>> {
        if self.host_id.is_empty() {
            return Err(Error::InvalidConfig("host id must not be empty".to_owned()));
        }
        self.config.validate()?;
        let (state_tx, _) = watch::channel(ProcessorState::Configured);
        Ok(Processor {
            host_id: self.host_id,
            store: self.store,
            feed: self.feed,
            factory: self.factory,
            monitor: self.monitor,
            clock: self.clock,
            config: self.config,
            state_tx: Arc::new(state_tx),
            stopping: CancellationToken::new(),
            running: Mutex::new(None),
        })
    }
}

type Controller<S, F, OF, H> = HealthMonitoringController<PartitionControllerCore<S, F, OF>, H>;

struct Running<C> {
    cancel: CancellationToken,
    controller: C,
    exits_rx: flume::Receiver<SupervisorExit>,
    tasks: JoinSet<()>,
}

/// One host of a fleet consuming a partitioned change feed.
///
/// `start` bootstraps the lease set if needed and starts balancing;
/// `stop` stops every supervisor and releases their leases. A processor is
/// started at most once.
pub struct Processor<S, F, OF, H> {
    host_id: String,
    store: S,
    feed: F,
    factory: OF,
    monitor: H,
    clock: SharedClock,
    config: ProcessorConfig,
    state_tx: Arc<watch::Sender<ProcessorState>>,
    stopping: CancellationToken,
    running: Mutex<Option<Running<Controller<S, F, OF, H>>>>,
}

impl<S, F, OF, H> Processor<S, F, OF, H>
where
    S: LeaseStore + BootstrapStore,
    F: ChangeFeed,
    OF: ObserverFactory<F::Change>,
    H: HealthMonitor,
{
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn state(&self) -> ProcessorState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessorState> {
        self.state_tx.subscribe()
    }

    /// Start processing. Does nothing if already running.
    #[tracing::instrument(skip_all, fields(host_id = self.host_id.as_str()), err)]
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let state = self.state();
        match state {
            ProcessorState::Running => return Ok(()),
            ProcessorState::Stopped | ProcessorState::Failed => {
                return Err(Error::InvalidState { op: "start", state })
            }
            ProcessorState::Configured => {}
        }

        let cancel = self.stopping.child_token();
        let synchronizer = PartitionSynchronizer::new(
            self.store.clone(),
            self.feed.clone(),
            self.clock.clone(),
            &self.config,
        );
        Bootstrapper::new(
            self.store.clone(),
            synchronizer.clone(),
            &self.host_id,
            self.clock.clone(),
            &self.config,
        )
        .initialize(&cancel)
        .await?;

        let manager = LeaseManager::new(
            self.store.clone(),
            &self.host_id,
            self.clock.clone(),
            self.config.lease_expiration_interval,
            self.config.checkpoint_retry_attempts,
        );
        let (core, exits_rx) = PartitionControllerCore::new(
            manager,
            synchronizer.clone(),
            self.feed.clone(),
            self.factory.clone(),
            self.config.clone(),
        );
        let controller = HealthMonitoringController::new(core, self.monitor.clone());
        if let Err(e) = controller.initialize().await {
            if let Err(err) = controller.shutdown_all().await {
                warn!(err = %err, "failed to stop supervisors");
            }
            return Err(e);
        }

        let mut tasks = JoinSet::new();
        tasks.spawn(handle_exits(controller.clone(), exits_rx.clone(), cancel.clone()));
        let balancer = PartitionLoadBalancer::new(
            controller.clone(),
            self.store.clone(),
            EqualPartitionsBalancingStrategy::new(&self.host_id, &self.config),
            self.clock.clone(),
            &self.config,
        );
        tasks.spawn(run_balancer(
            balancer,
            controller.clone(),
            self.monitor.clone(),
            self.state_tx.clone(),
            cancel.clone(),
        ));
        tasks.spawn(synchronizer.run(cancel.clone(), self.config.partition_sync_interval));

        self.state_tx.send_replace(ProcessorState::Running);
        info!("processor started");
        *running = Some(Running {
            cancel,
            controller,
            exits_rx,
            tasks,
        });
        Ok(())
    }

    /// Stop processing and release every lease held. Idempotent.
    #[tracing::instrument(skip_all, fields(host_id = self.host_id.as_str()), err)]
    pub async fn stop(&self) -> Result<()> {
        // Interrupts a start that is still waiting on bootstrap.
        self.stopping.cancel();
        let mut running = self.running.lock().await;
        if let Some(Running {
            cancel,
            controller,
            exits_rx,
            mut tasks,
        }) = running.take()
        {
            cancel.cancel();
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    warn!(err = %e, "processor task failed");
                }
            }
            if let Err(e) = controller.shutdown_all().await {
                warn!(err = %e, "failed to stop supervisors");
            }
            // Supervisors that stopped on their own once the exit handler
            // was gone.
            let settled = settle_pending_exits(&controller, &exits_rx).await;
            if settled > 0 {
                debug!(settled, "settled late supervisor exits");
            }
            if let Err(e) = self.store.withdraw(&self.host_id).await {
                debug!(err = %e, "failed to withdraw host presence");
            }
        }
        self.state_tx.send_if_modified(|state| match state {
            ProcessorState::Failed | ProcessorState::Stopped => false,
            _ => {
                *state = ProcessorState::Stopped;
                true
            }
        });
        info!(state = %self.state(), "processor stopped");
        Ok(())
    }

    /// Allow a partition quarantined after an observer failure to be
    /// processed again. Returns whether it was quarantined.
    pub async fn resume_partition(&self, partition_id: &str) -> bool {
        match &*self.running.lock().await {
            Some(running) => running.controller.resume(partition_id).await,
            None => false,
        }
    }

    /// Partitions this host is currently processing.
    pub async fn running_partitions(&self) -> Vec<String> {
        let mut partitions: Vec<String> = match &*self.running.lock().await {
            Some(running) => running.controller.running().await.into_iter().collect(),
            None => vec![],
        };
        partitions.sort();
        partitions
    }
}

/// Settle supervisors that stopped on their own until cancelled.
async fn handle_exits<C: PartitionController>(
    controller: C,
    exits_rx: flume::Receiver<SupervisorExit>,
    cancel: CancellationToken,
) {
    loop {
        select! {
            _ = cancel.cancelled() => {
                return;
            }
            res = exits_rx.recv_async() => {
                let Ok(exit) = res else {
                    return;
                };
                if let Err(e) = controller.handle_stopped(exit).await {
                    debug!(err = %e, "supervisor stopped");
                }
            }
        }
    }
}

/// Run the balancer. A balancer that gives up means the lease store is
/// unreachable, and the whole processor fails.
async fn run_balancer<C: PartitionController, S: LeaseStore, H: HealthMonitor>(
    balancer: PartitionLoadBalancer<C, S>,
    controller: C,
    monitor: H,
    state_tx: Arc<watch::Sender<ProcessorState>>,
    cancel: CancellationToken,
) {
    if let Err(e) = balancer.run(cancel.clone()).await {
        error!(err = %e, "lease store unavailable, processor failing");
        monitor.inspect(&HealthRecord::from_result::<()>(
            MonitoredOperation::Balance,
            None,
            &Err(e),
        ));
        state_tx.send_replace(ProcessorState::Failed);
        cancel.cancel();
        if let Err(e) = controller.shutdown_all().await {
            warn!(err = %e, "failed to stop supervisors");
        }
    }
}
