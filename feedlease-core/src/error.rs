use crate::processor::ProcessorState;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by lease coordination.
///
/// Store implementations report races as [`Error::ConcurrencyConflict`];
/// the lease manager reinterprets those as [`Error::LeaseLost`] wherever
/// ownership can no longer be assumed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A conditional write lost to a concurrent writer.
    #[error("concurrency conflict writing {0}")]
    ConcurrencyConflict(String),

    /// This host no longer owns the lease for the partition.
    #[error("lease lost for partition {0}")]
    LeaseLost(String),

    /// No lease record exists for the partition.
    #[error("no lease found for partition {0}")]
    LeaseNotFound(String),

    /// The user-supplied observer returned an error.
    #[error("observer failed on partition {partition_id}: {source:#}")]
    ObserverFailure {
        partition_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("timed out waiting for the bootstrap lock")]
    BootstrapLockTimeout,

    /// Transient lease store failure.
    #[error("lease store: {0:#}")]
    Store(#[source] anyhow::Error),

    /// Transient change feed failure.
    #[error("change feed: {0:#}")]
    Feed(#[source] anyhow::Error),

    /// The lease store failed every operation for longer than tolerated.
    #[error("lease store unavailable after {0} consecutive failures")]
    StoreUnavailable(u32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot {op} a processor that is {state}")]
    InvalidState {
        op: &'static str,
        state: ProcessorState,
    },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn store<E: Into<anyhow::Error>>(err: E) -> Error {
        Error::Store(err.into())
    }

    pub fn feed<E: Into<anyhow::Error>>(err: E) -> Error {
        Error::Feed(err.into())
    }

    pub fn observer<E: Into<anyhow::Error>>(partition_id: &str, err: E) -> Error {
        Error::ObserverFailure {
            partition_id: partition_id.to_owned(),
            source: err.into(),
        }
    }

    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Error::LeaseLost(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict(_))
    }

    pub fn is_observer_failure(&self) -> bool {
        matches!(self, Error::ObserverFailure { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ConcurrencyConflict(_)
                | Error::Store(_)
                | Error::Feed(_)
                | Error::BootstrapLockTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer_failure_is_distinct_from_infrastructure() {
        let err = Error::observer("p0", anyhow::anyhow!("bad document"));
        assert!(err.is_observer_failure());
        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "observer failed on partition p0: bad document"
        );

        let err = Error::store(anyhow::anyhow!("connection reset"));
        assert!(!err.is_observer_failure());
        assert!(err.is_transient());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = Error::InvalidState {
            op: "start",
            state: ProcessorState::Stopped,
        };
        assert_eq!(err.to_string(), "cannot start a processor that is stopped");
    }
}
