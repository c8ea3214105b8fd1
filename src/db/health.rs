use serde::{Deserialize, Serialize};

/// Overall verdict of a [`HealthCheck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every check passed.
    Healthy,
    /// Some checks failed but the store still accepts writes.
    Degraded,
    /// The write-ahead log is halted.
    Unhealthy,
}

/// One probe contributing to a [`HealthCheck`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Check {
    /// Cache effectiveness. Passes until enough lookups were made to judge.
    CacheHitRate {
        /// Observed hit rate.
        current: f64,
        /// Minimum acceptable rate.
        threshold: f64,
        /// Verdict.
        healthy: bool,
    },
    /// Bytes held by live WAL segments.
    WalSize {
        /// Current size.
        bytes: u64,
        /// Largest acceptable size.
        threshold: u64,
        /// Verdict.
        healthy: bool,
    },
    /// Corruption that halted the log.
    WalHalted {
        /// Halt reason, if any.
        reason: Option<String>,
        /// Verdict.
        healthy: bool,
    },
    /// Time since the last checkpoint.
    LastCheckpoint {
        /// Seconds since the last checkpoint or since open.
        seconds_ago: u64,
        /// Longest acceptable gap.
        threshold: u64,
        /// Verdict.
        healthy: bool,
    },
    /// Callers queued on the connection pool.
    PoolPressure {
        /// Current waiters.
        waiting: usize,
        /// Configured waiter ceiling.
        max_waiting: usize,
        /// Verdict.
        healthy: bool,
    },
}

impl Check {
    /// Whether this check passed.
    pub fn healthy(&self) -> bool {
        match self {
            Check::CacheHitRate { healthy, .. }
            | Check::WalSize { healthy, .. }
            | Check::WalHalted { healthy, .. }
            | Check::LastCheckpoint { healthy, .. }
            | Check::PoolPressure { healthy, .. } => *healthy,
        }
    }

    fn is_fatal(&self) -> bool {
        matches!(self, Check::WalHalted { healthy: false, .. })
    }
}

/// Aggregated health of a store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Worst verdict across checks.
    pub status: HealthStatus,
    /// Individual probes in evaluation order.
    pub checks: Vec<Check>,
}

impl HealthCheck {
    /// Empty, healthy report.
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: Vec::new(),
        }
    }

    /// Records `check` and downgrades the status if it failed.
    pub fn add_check(&mut self, check: Check) {
        if check.is_fatal() {
            self.status = HealthStatus::Unhealthy;
        } else if !check.healthy() && self.status == HealthStatus::Healthy {
            self.status = HealthStatus::Degraded;
        }
        self.checks.push(check);
    }

    /// True when no check failed.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_checks_degrade_and_halt_is_fatal() {
        let mut health = HealthCheck::new();
        health.add_check(Check::WalSize {
            bytes: 10,
            threshold: 100,
            healthy: true,
        });
        assert!(health.is_healthy());
        health.add_check(Check::PoolPressure {
            waiting: 9,
            max_waiting: 8,
            healthy: false,
        });
        assert_eq!(health.status, HealthStatus::Degraded);
        health.add_check(Check::WalHalted {
            reason: Some("bad crc".into()),
            healthy: false,
        });
        assert_eq!(health.status, HealthStatus::Unhealthy);
        health.add_check(Check::CacheHitRate {
            current: 0.0,
            threshold: 0.5,
            healthy: false,
        });
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }
}
