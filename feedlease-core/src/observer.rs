//! User-supplied processing of partition changes.

use std::{fmt, future::Future};

/// Identifies the partition an observer is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverContext {
    pub partition_id: String,
    pub host_id: String,
}

/// Why an observer is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The processor is stopping.
    Shutdown,

    /// The lease was given up so another host can balance the load.
    Rebalance,

    /// Another host took the lease, or it could not be renewed in time.
    LeaseLost,

    /// The partition was split or merged and its lease retired.
    LeaseGone,

    /// The observer itself failed.
    ObserverError,

    /// The feed could not be read within the retry budget.
    ReadFailure,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::Shutdown => "shutdown",
            CloseReason::Rebalance => "rebalance",
            CloseReason::LeaseLost => "lease lost",
            CloseReason::LeaseGone => "lease gone",
            CloseReason::ObserverError => "observer error",
            CloseReason::ReadFailure => "read failure",
        })
    }
}

/// Processes the changes of one partition.
///
/// A new observer is created for every partition a host starts processing.
/// Batches arrive in feed order; a batch is checkpointed only after
/// `process_changes` returns `Ok`.
pub trait Observer<C>: Send + 'static {
    fn open(&mut self, _ctx: &ObserverContext) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    fn process_changes(
        &mut self,
        ctx: &ObserverContext,
        changes: &[C],
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn close(
        &mut self,
        _ctx: &ObserverContext,
        _reason: CloseReason,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }
}

pub trait ObserverFactory<C>: Clone + Send + Sync + 'static {
    type Observer: Observer<C>;

    fn create(&self) -> Self::Observer;
}

impl<C, O, F> ObserverFactory<C> for F
where
    F: Fn() -> O + Clone + Send + Sync + 'static,
    O: Observer<C>,
{
    type Observer = O;

    fn create(&self) -> O {
        self()
    }
}
