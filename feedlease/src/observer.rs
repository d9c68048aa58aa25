use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use feedlease_core::{CloseReason, Observer, ObserverContext, ObserverFactory};
use tracing::{debug, info};

/// A synthetic change appended by the simulated producer.
#[derive(Debug, Clone)]
pub struct Change {
    pub seq: u64,
    pub payload: String,
}

/// Observer that logs what it processes and counts changes per host.
pub struct LoggingObserver {
    processed: Arc<AtomicU64>,
}

impl Observer<Change> for LoggingObserver {
    async fn open(&mut self, ctx: &ObserverContext) -> anyhow::Result<()> {
        info!(host_id = ctx.host_id, partition_id = ctx.partition_id, "observer opened");
        Ok(())
    }

    async fn process_changes(
        &mut self,
        ctx: &ObserverContext,
        changes: &[Change],
    ) -> anyhow::Result<()> {
        let (Some(first), Some(last)) = (changes.first(), changes.last()) else {
            return Ok(());
        };
        debug!(
            host_id = ctx.host_id,
            partition_id = ctx.partition_id,
            count = changes.len(),
            first = first.seq,
            last = last.seq,
            payload = last.payload,
            "processed batch"
        );
        self.processed
            .fetch_add(changes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&mut self, ctx: &ObserverContext, reason: CloseReason) -> anyhow::Result<()> {
        info!(
            host_id = ctx.host_id,
            partition_id = ctx.partition_id,
            %reason,
            "observer closed"
        );
        Ok(())
    }
}

/// Creates the observers of one host; they share its change counter.
#[derive(Clone, Default)]
pub struct LoggingObserverFactory {
    processed: Arc<AtomicU64>,
}

impl LoggingObserverFactory {
    /// Changes processed by every observer this factory created.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

impl ObserverFactory<Change> for LoggingObserverFactory {
    type Observer = LoggingObserver;

    fn create(&self) -> LoggingObserver {
        LoggingObserver {
            processed: self.processed.clone(),
        }
    }
}
