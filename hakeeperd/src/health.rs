use hakeeper_api::OpTime;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    Degraded { failures: u32 },
    Recovered,
}

/// Counts consecutive failed engine health checks
///
/// Degraded after `failure_threshold` failures in a row, healthy again
/// after the first success.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    failure_threshold: u32,
    failures: u32,
    is_degraded: bool,
}

impl HealthMonitor {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            failures: 0,
            is_degraded: false,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.is_degraded
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record<T, E: std::fmt::Display>(&mut self, res: &Result<T, E>) -> Option<HealthEvent> {
        match res {
            Ok(_) => self.record_success(),
            Err(e) => {
                info!(%e, failures = self.failures + 1, "Engine health check failed");
                self.record_failure()
            }
        }
    }

    pub fn record_success(&mut self) -> Option<HealthEvent> {
        self.failures = 0;
        if self.is_degraded {
            self.is_degraded = false;
            info!("Engine healthy again");
            return Some(HealthEvent::Recovered);
        }
        None
    }

    pub fn record_failure(&mut self) -> Option<HealthEvent> {
        self.failures = self.failures.saturating_add(1);
        if !self.is_degraded && self.failure_threshold <= self.failures {
            self.is_degraded = true;
            warn!(failures = self.failures, "Engine degraded");
            return Some(HealthEvent::Degraded {
                failures: self.failures,
            });
        }
        None
    }
}

/// How far `local` is behind the leader's last reported position
pub fn lag(leader: OpTime, local: OpTime) -> i64 {
    leader - local
}

pub fn is_lagging(lag: i64, max_lag: i64) -> bool {
    max_lag < lag
}

#[test]
fn degrade_and_recover() {
    let mut monitor = HealthMonitor::new(3);
    assert_eq!(monitor.record_failure(), None);
    assert_eq!(monitor.record_failure(), None);
    assert_eq!(
        monitor.record_failure(),
        Some(HealthEvent::Degraded { failures: 3 })
    );
    assert_eq!(monitor.record_failure(), None);
    assert!(monitor.is_degraded());

    assert_eq!(monitor.record::<(), &str>(&Ok(())), Some(HealthEvent::Recovered));
    assert_eq!(monitor.failures(), 0);
    assert_eq!(monitor.record::<(), &str>(&Err("down")), None);
}

#[test]
fn lag_threshold() {
    assert_eq!(lag(OpTime(100), OpTime(90)), 10);
    assert!(!is_lagging(10, 10));
    assert!(is_lagging(11, 10));
    // ahead of the leader's last renew is not lagging
    assert!(!is_lagging(lag(OpTime(100), OpTime(105)), 0));
}
