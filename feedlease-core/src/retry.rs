use std::{sync::Arc, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff};
use tokio::sync::Mutex;

/// Shared backoff state for retrying transient collaborator failures.
#[derive(Clone)]
pub struct Retry(pub Arc<Mutex<dyn Backoff + Send + Sync>>);

impl Retry {
    /// Exponential backoff that gives up once `max_elapsed` has passed
    /// without a success.
    pub fn with_max_elapsed(max_elapsed: Duration) -> Retry {
        let mut backoff = ExponentialBackoff::default();
        backoff.max_elapsed_time = Some(max_elapsed);
        Self(Arc::new(Mutex::new(backoff)))
    }
}

impl Default for Retry {
    fn default() -> Retry {
        Self(Arc::new(Mutex::new(ExponentialBackoff::default())))
    }
}

/// Retry transient errors, give up on the rest.
pub(crate) fn classify(err: crate::Error) -> backoff::Error<crate::Error> {
    if err.is_transient() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

/// Run `$attempt` until it succeeds, fails permanently, the backoff is
/// exhausted or `$cancel` fires.
///
/// `$attempt` is a block using `?` on `Result<_, backoff::Error<crate::Error>>`.
#[macro_export]
macro_rules! backoff_retry {
    ($cancel:expr, $retry:expr, $attempt:block, $exhausted:block) => {
        {
            let mut _final_result: $crate::Result<()> = Ok(());
            let mut _attempt = 0u32;
            loop {
                let _result = async {
                    $attempt
                    Ok::<(), backoff::Error<$crate::Error>>(())
                }.await;
                match _result {
                    Ok(()) => {
                        if _attempt > 0 {
                            tracing::info!(attempt = _attempt, "retry successful");
                            backoff::backoff::Backoff::reset(&mut *$retry.0.lock().await);
                        }
                        _final_result = Ok(());
                        break;
                    }
                    Err(backoff::Error::Permanent(err)) => {
                        _final_result = Err(err);
                        break;
                    }
                    Err(backoff::Error::Transient { err, retry_after }) => {
                        let mut _retry = $retry.0.lock().await;
                        if _attempt == 0 {
                            // Elapsed time counts from the first failure.
                            backoff::backoff::Backoff::reset(&mut *_retry);
                        }
                        match retry_after.or(backoff::backoff::Backoff::next_backoff(&mut *_retry)) {
                            Some(delay) => {
                                _attempt += 1;
                                tracing::warn!(?delay, attempt = _attempt, err = %err, "retrying");
                                tokio::select! {
                                    _ = $cancel.cancelled() => {
                                        _final_result = Err($crate::Error::Cancelled);
                                        break;
                                    }
                                    _ = tokio::time::sleep(delay) => {}
                                };
                            }
                            None => {
                                $exhausted
                                _final_result = Err(err);
                                backoff::backoff::Backoff::reset(&mut *_retry);
                                break;
                            }
                        }
                    }
                }
            }
            _final_result
        }
    };
    ($cancel:expr, $retry:expr, $attempt:block) => {
        $crate::backoff_retry!($cancel, $retry, $attempt, {})
    }
}
