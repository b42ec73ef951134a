//! Health state of one backend server.
//!
//! Counts consecutive failed checks; the server is reported down after
//! `failure_threshold` of them and up again after a single success.

use std::time::Instant;

/// Health status of a backend server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    /// No check has finished yet
    #[default]
    Unknown,
    Up,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Up => "up",
            HealthStatus::Down => "down",
        }
    }
}

/// Result of a single health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Ok,
    Failed,
    TimedOut,
}

impl CheckResult {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckResult::Ok => "ok",
            CheckResult::Failed => "failed",
            CheckResult::TimedOut => "timeout",
        }
    }

    fn is_ok(&self) -> bool {
        matches!(self, CheckResult::Ok)
    }
}

#[derive(Debug)]
pub struct TargetHealth {
    pub status: HealthStatus,
    consecutive_failures: u32,
    failure_threshold: u32,
    pub last_success: Option<Instant>,
}

impl TargetHealth {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            last_success: None,
        }
    }

    /// Record a check result. Returns the new status when it changed.
    pub fn record(&mut self, result: CheckResult) -> Option<HealthStatus> {
        let status = if result.is_ok() {
            self.consecutive_failures = 0;
            self.last_success = Some(Instant::now());
            HealthStatus::Up
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures >= self.failure_threshold {
                HealthStatus::Down
            } else {
                self.status
            }
        };

        if status == self.status {
            return None;
        }
        self.status = status;
        Some(status)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_success_is_a_change() {
        let mut health = TargetHealth::new(3);
        assert_eq!(health.status, HealthStatus::Unknown);
        assert_eq!(health.record(CheckResult::Ok), Some(HealthStatus::Up));
        assert_eq!(health.record(CheckResult::Ok), None);
        assert!(health.last_success.is_some());
    }

    #[test]
    fn test_down_after_threshold() {
        let mut health = TargetHealth::new(3);
        health.record(CheckResult::Ok);

        assert_eq!(health.record(CheckResult::Failed), None);
        assert_eq!(health.record(CheckResult::TimedOut), None);
        assert_eq!(health.status, HealthStatus::Up);
        assert_eq!(health.record(CheckResult::Failed), Some(HealthStatus::Down));
        assert_eq!(health.consecutive_failures(), 3);

        // Stays down without reporting again
        assert_eq!(health.record(CheckResult::Failed), None);
    }

    #[test]
    fn test_success_resets_failures() {
        let mut health = TargetHealth::new(2);
        health.record(CheckResult::Ok);
        health.record(CheckResult::Failed);
        health.record(CheckResult::Ok);
        assert_eq!(health.consecutive_failures(), 0);
        assert_eq!(health.record(CheckResult::Failed), None);
        assert_eq!(health.status, HealthStatus::Up);
    }

    #[test]
    fn test_one_success_brings_it_back() {
        let mut health = TargetHealth::new(1);
        assert_eq!(health.record(CheckResult::Failed), Some(HealthStatus::Down));
        assert_eq!(health.record(CheckResult::Ok), Some(HealthStatus::Up));
    }

    #[test]
    fn test_zero_threshold_acts_as_one() {
        let mut health = TargetHealth::new(0);
        assert_eq!(health.record(CheckResult::TimedOut), Some(HealthStatus::Down));
    }
}
