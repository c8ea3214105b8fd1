//! Bounded exponential backoff for log I/O.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::primitives::io::is_transient;
use crate::types::{Result, TaskError};

/// Retry schedule for transient I/O failures.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Growth factor applied after each retry.
    pub multiplier: f64,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Adds up to 20% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let base = self.initial_delay.as_secs_f64() * exp;
        let capped = base.min(self.max_delay.as_secs_f64());
        let with_jitter = if self.jitter && capped > 0.0 {
            capped * (1.0 + rand::thread_rng().gen_range(0.0..0.2))
        } else {
            capped
        };
        Duration::from_secs_f64(with_jitter.min(self.max_delay.as_secs_f64()))
    }
}

/// How a failed attempt should be handled.
#[derive(Debug)]
pub(crate) enum Failure {
    Retry(TaskError),
    Fatal(TaskError),
}

/// Sorts an error into retryable or fatal. Data-shape I/O errors are corruption.
pub(crate) fn classify(err: TaskError, operation: &'static str) -> Failure {
    match err {
        TaskError::Io(io_err) if is_transient(&io_err) => Failure::Retry(TaskError::TransientIo {
            operation,
            source: io_err,
        }),
        TaskError::Io(io_err)
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof
            ) =>
        {
            Failure::Fatal(TaskError::Corruption(format!("{operation}: {io_err}")))
        }
        err @ TaskError::TransientIo { .. } => Failure::Retry(err),
        other => Failure::Fatal(other),
    }
}

/// Runs `attempt` until it succeeds, fails fatally, or the policy is exhausted, in which
/// case the last transient error is escalated to [`TaskError::System`].
pub(crate) fn with_retry<T, F>(policy: &RetryPolicy, operation: &'static str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut tries = 0u32;
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(err) => match classify(err, operation) {
                Failure::Fatal(err) => return Err(err),
                Failure::Retry(err) => {
                    if tries >= policy.max_retries {
                        error!(operation, attempts = tries + 1, error = %err, "retry.exhausted");
                        return Err(TaskError::System(format!(
                            "{operation} failed after {} attempts: {err}",
                            tries + 1
                        )));
                    }
                    tries += 1;
                    let delay = policy.delay_for(tries);
                    warn!(
                        operation,
                        attempt = tries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retry.backoff"
                    );
                    thread::sleep(delay);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, ErrorKind};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            jitter: false,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = fast();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4));
        assert_eq!(policy.delay_for(6), Duration::from_millis(4));
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let mut calls = 0;
        let value = with_retry(&fast(), "wal.append", || {
            calls += 1;
            if calls < 3 {
                Err(TaskError::Io(io::Error::new(ErrorKind::TimedOut, "slow disk")))
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn exhausted_retries_escalate_to_system() {
        let mut calls = 0;
        let err = with_retry(&fast(), "wal.append", || -> Result<()> {
            calls += 1;
            Err(TaskError::Io(io::Error::new(ErrorKind::Interrupted, "eintr")))
        })
        .unwrap_err();
        assert_eq!(calls, 4);
        assert!(matches!(err, TaskError::System(_)));
    }

    #[test]
    fn corruption_is_not_retried() {
        let mut calls = 0;
        let err = with_retry(&fast(), "wal.append", || -> Result<()> {
            calls += 1;
            Err(TaskError::Io(io::Error::new(ErrorKind::InvalidData, "garbled")))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, TaskError::Corruption(_)));
    }
}
