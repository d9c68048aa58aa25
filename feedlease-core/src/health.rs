//! Diagnostics around partition controller operations.

use std::{collections::HashSet, fmt};

use tracing::{error, info, warn};

use crate::{
    controller::PartitionController, lease::Lease, observer::CloseReason,
    supervisor::SupervisorExit, Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthSeverity {
    Informational,
    Error,
    Critical,
}

/// Whether a failure came from user code or from the coordination layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSource {
    Observer,
    Infrastructure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoredOperation {
    Initialize,
    AcquireLease,
    ReleaseLease,
    SupervisorStopped,
    Shutdown,
    Balance,
}

impl fmt::Display for MonitoredOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MonitoredOperation::Initialize => "initialize",
            MonitoredOperation::AcquireLease => "acquire lease",
            MonitoredOperation::ReleaseLease => "release lease",
            MonitoredOperation::SupervisorStopped => "supervisor stopped",
            MonitoredOperation::Shutdown => "shutdown",
            MonitoredOperation::Balance => "balance",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthRecord {
    pub severity: HealthSeverity,
    pub operation: MonitoredOperation,
    pub partition_id: Option<String>,
    pub source: HealthSource,
    pub message: String,
}

impl HealthRecord {
    /// Classify the outcome of an operation.
    ///
    /// Losing a lease to another host is part of normal operation and is
    /// informational. Observer failures are errors attributed to the
    /// observer, and a store outage is critical.
    pub fn from_result<T>(
        operation: MonitoredOperation,
        partition_id: Option<&str>,
        res: &Result<T>,
    ) -> HealthRecord {
        let (severity, source, message) = match res {
            Ok(_) => (
                HealthSeverity::Informational,
                HealthSource::Infrastructure,
                "ok".to_owned(),
            ),
            Err(e) => (severity_of(e), source_of(e), e.to_string()),
        };
        HealthRecord {
            severity,
            operation,
            partition_id: partition_id.map(str::to_owned),
            source,
            message,
        }
    }
}

fn severity_of(err: &Error) -> HealthSeverity {
    match err {
        Error::LeaseLost(_) | Error::ConcurrencyConflict(_) | Error::Cancelled => {
            HealthSeverity::Informational
        }
        Error::StoreUnavailable(_) => HealthSeverity::Critical,
        _ => HealthSeverity::Error,
    }
}

fn source_of(err: &Error) -> HealthSource {
    if err.is_observer_failure() {
        HealthSource::Observer
    } else {
        HealthSource::Infrastructure
    }
}

/// Sink for health records. Must not block; it is called inline with the
/// monitored operation.
pub trait HealthMonitor: Clone + Send + Sync + 'static {
    fn inspect(&self, record: &HealthRecord);
}

/// Reports health records as log events.
#[derive(Debug, Clone, Default)]
pub struct TraceHealthMonitor;

impl HealthMonitor for TraceHealthMonitor {
    fn inspect(&self, record: &HealthRecord) {
        let partition_id = record.partition_id.as_deref().unwrap_or("-");
        match record.severity {
            HealthSeverity::Informational => info!(
                operation = %record.operation,
                partition_id,
                detail = record.message,
                "health"
            ),
            HealthSeverity::Error => warn!(
                operation = %record.operation,
                partition_id,
                source = ?record.source,
                detail = record.message,
                "health"
            ),
            HealthSeverity::Critical => error!(
                operation = %record.operation,
                partition_id,
                source = ?record.source,
                detail = record.message,
                "health"
            ),
        }
    }
}

/// Wraps a partition controller and reports the outcome of each operation
/// to a health monitor. Results pass through unchanged.
#[derive(Clone)]
pub struct HealthMonitoringController<C, H> {
    inner: C,
    monitor: H,
}

impl<C: PartitionController, H: HealthMonitor> HealthMonitoringController<C, H> {
    pub fn new(inner: C, monitor: H) -> Self {
        Self { inner, monitor }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn record<T>(&self, operation: MonitoredOperation, partition_id: Option<&str>, res: &Result<T>) {
        self.monitor
            .inspect(&HealthRecord::from_result(operation, partition_id, res));
    }
}

impl<C: PartitionController, H: HealthMonitor> PartitionController
    for HealthMonitoringController<C, H>
{
    async fn initialize(&self) -> Result<()> {
        let res = self.inner.initialize().await;
        self.record(MonitoredOperation::Initialize, None, &res);
        res
    }

    async fn add_or_update(&self, lease: Lease) -> Result<bool> {
        let partition_id = lease.partition_id.clone();
        let res = self.inner.add_or_update(lease).await;
        self.record(MonitoredOperation::AcquireLease, Some(&partition_id), &res);
        res
    }

    async fn shutdown(&self, partition_id: &str, reason: CloseReason) -> Result<()> {
        let res = self.inner.shutdown(partition_id, reason).await;
        self.record(MonitoredOperation::ReleaseLease, Some(partition_id), &res);
        res
    }

    async fn handle_stopped(&self, exit: SupervisorExit) -> Result<()> {
        let partition_id = exit.partition_id.clone();
        let res = self.inner.handle_stopped(exit).await;
        self.record(MonitoredOperation::SupervisorStopped, Some(&partition_id), &res);
        res
    }

    async fn shutdown_all(&self) -> Result<()> {
        let res = self.inner.shutdown_all().await;
        self.record(MonitoredOperation::Shutdown, None, &res);
        res
    }

    async fn running(&self) -> HashSet<String> {
        self.inner.running().await
    }

    async fn quarantined(&self) -> HashSet<String> {
        self.inner.quarantined().await
    }

    async fn resume(&self, partition_id: &str) -> bool {
        self.inner.resume(partition_id).await
    }
}
