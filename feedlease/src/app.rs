use std::time::Duration;

use anyhow::{Error, Result};
use feedlease_core::{
    health::TraceHealthMonitor,
    memory::{InMemoryFeed, InMemoryLeaseStore},
    ChangeFeed, Processor, ProcessorBuilder,
};
use rand::Rng;
use tokio::{select, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    cli::{Commands, SimulateArgs},
    initialize_stdout_logging,
    observer::{Change, LoggingObserverFactory},
    Cli,
};

type Host =
    Processor<InMemoryLeaseStore, InMemoryFeed<Change>, LoggingObserverFactory, TraceHealthMonitor>;

pub struct App {
    cli: Cli,
}

impl App {
    pub fn new(cli: Cli) -> Result<App> {
        Ok(App { cli })
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(&mut self) -> Result<()> {
        println!("feedlease {}", env!("CARGO_PKG_VERSION"));
        if self.cli.version() {
            return Ok(());
        }

        initialize_stdout_logging();
        let res = match &self.cli.commands {
            Commands::Simulate(args) => self.simulate(args.clone()).await,
            Commands::Version => Ok(()),
        };
        if let Err(e) = res {
            error!(err = e.to_string());
            return Err(e);
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, err)]
    async fn simulate(&self, args: SimulateArgs) -> Result<()> {
        let config = args.processor_config()?;
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::<Change>::with_partitions(args.partitions).await;

        let mut hosts = vec![];
        for _ in 0..args.hosts {
            let host_id = format!("host-{}", hex::encode(rand::random::<[u8; 4]>()));
            let factory = LoggingObserverFactory::default();
            let processor =
                ProcessorBuilder::new(&host_id, store.clone(), feed.clone(), factory.clone())
                    .with_config(config.clone())
                    .build()?;
            hosts.push((processor, factory));
        }
        for (processor, _) in hosts.iter() {
            processor.start().await?;
        }

        let mut tasks = JoinSet::new();
        let cancel = CancellationToken::new();

        // Set up ctrl-c handler
        let ctrl_c_cancel = cancel.clone();
        tasks.spawn(async move {
            select! {
                _ = ctrl_c_cancel.cancelled() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Received ctrl-c, shutting down...");
                    ctrl_c_cancel.cancel();
                }
            }
            Ok::<(), Error>(())
        });

        if let Some(secs) = args.run_secs {
            let run_cancel = cancel.clone();
            tasks.spawn(async move {
                select! {
                    _ = run_cancel.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        info!("run time elapsed, shutting down");
                        run_cancel.cancel();
                    }
                }
                Ok(())
            });
        }

        tasks.spawn(produce(feed.clone(), args.changes_per_sec, cancel.clone()));

        if let Some(secs) = args.split_after_secs {
            let split_feed = feed.clone();
            let split_cancel = cancel.clone();
            tasks.spawn(async move {
                select! {
                    _ = split_cancel.cancelled() => Ok(()),
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        split_feed.split("p0", &["p0.0", "p0.1"]).await?;
                        info!(parent = "p0", "split partition");
                        Ok(())
                    }
                }
            });
        }

        let report_store = store.clone();
        let report_interval = Duration::from_secs(args.report_secs);
        let report_cancel = cancel.clone();
        tasks.spawn(async move {
            let mut interval = tokio::time::interval(report_interval);
            loop {
                select! {
                    _ = report_cancel.cancelled() => return Ok(()),
                    _ = interval.tick() => {
                        for (host_id, partitions) in report_store.ownership().await {
                            info!(
                                host_id,
                                count = partitions.len(),
                                partitions = partitions.join(","),
                                "ownership"
                            );
                        }
                    }
                }
            }
        });

        let mut stopped_early = None;
        if let Some(secs) = args.stop_host_after_secs {
            select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    if let Some((processor, _)) = hosts.last() {
                        info!(host_id = processor.host_id(), "stopping one host");
                        processor.stop().await?;
                        stopped_early = Some(hosts.len() - 1);
                    }
                }
            }
        }

        cancel.cancelled().await;
        let mut res = Ok(());
        while let Some(join_res) = tasks.join_next().await {
            match join_res {
                Ok(Err(e)) => {
                    warn!(err = %e, "simulation task failed");
                    res = Err(e);
                }
                Err(e) => warn!(err = %e, "simulation task panicked"),
                Ok(Ok(())) => {}
            }
        }
        for (i, (processor, factory)) in hosts.iter().enumerate() {
            if stopped_early != Some(i) {
                shutdown(processor).await;
            }
            info!(
                host_id = processor.host_id(),
                state = %processor.state(),
                processed = factory.processed(),
                "host summary"
            );
        }
        let appended: usize = feed.lengths().await.values().sum();
        info!(appended, "simulation finished");
        res
    }
}

async fn shutdown(processor: &Host) {
    if let Err(e) = processor.stop().await {
        warn!(host_id = processor.host_id(), err = %e, "failed to stop host");
    }
}

/// Append synthetic changes to random live partitions until cancelled.
async fn produce(
    feed: InMemoryFeed<Change>,
    changes_per_sec: u32,
    cancel: CancellationToken,
) -> Result<()> {
    if changes_per_sec == 0 {
        return Ok(());
    }
    let mut interval = tokio::time::interval(Duration::from_secs(1) / changes_per_sec);
    let mut seq = 0u64;
    loop {
        select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = interval.tick() => {
                let partitions = feed.list_partitions().await?;
                if partitions.is_empty() {
                    continue;
                }
                let index = rand::thread_rng().gen_range(0..partitions.len());
                seq += 1;
                let change = Change {
                    seq,
                    payload: hex::encode(rand::random::<[u8; 8]>()),
                };
                feed.push(&partitions[index].id, change).await?;
            }
        }
    }
}
