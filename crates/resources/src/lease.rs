//! Execution leases.
//!
//! A lease is a renewable claim on one execution slot. It expires when its
//! total age passes the execution time limit or when it has not been renewed
//! within the heartbeat timeout.

use probekit_core::{ExecutionId, Time};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Expiry thresholds for leases.
#[derive(Debug, Clone, Copy)]
pub struct LeasePolicy {
    /// Maximum total lease age
    pub max_age: Duration,
    /// Maximum time between heartbeats
    pub heartbeat_timeout: Duration,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(300),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

/// Why a lease expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseExpiry {
    /// Total age exceeded the execution time limit
    Timeout,
    /// No heartbeat within the heartbeat timeout
    HeartbeatLost,
}

/// An admitted, running execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveLease {
    /// Execution holding the lease
    pub execution_id: ExecutionId,
    /// Test case name
    pub name: String,
    /// When the lease was granted
    pub start_time: Time,
    /// Last heartbeat received
    pub last_heartbeat: Time,
    /// Host memory in MiB when the lease was granted
    pub memory_at_start: f64,
}

impl ActiveLease {
    /// Grant a lease at `now`.
    pub fn new(execution_id: ExecutionId, name: impl Into<String>, memory_at_start: f64, now: Time) -> Self {
        Self {
            execution_id,
            name: name.into(),
            start_time: now,
            last_heartbeat: now,
            memory_at_start,
        }
    }

    /// Renew the heartbeat.
    pub fn renew(&mut self, now: Time) {
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
    }

    /// Total age at `now`.
    pub fn age(&self, now: Time) -> Duration {
        (now - self.start_time).to_std().unwrap_or_default()
    }

    /// Time since the last heartbeat at `now`.
    pub fn heartbeat_age(&self, now: Time) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or_default()
    }

    /// Whether the lease has expired at `now`, and why.
    pub fn expiry(&self, now: Time, policy: &LeasePolicy) -> Option<LeaseExpiry> {
        if self.age(now) > policy.max_age {
            Some(LeaseExpiry::Timeout)
        } else if self.heartbeat_age(now) > policy.heartbeat_timeout {
            Some(LeaseExpiry::HeartbeatLost)
        } else {
            None
        }
    }
}

/// How a lease ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseOutcome {
    /// Released by its holder
    Completed,
    /// Reclaimed as stale
    Reclaimed(LeaseExpiry),
}

/// History entry for an ended lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Execution that held the lease
    pub execution_id: ExecutionId,
    /// Test case name
    pub name: String,
    /// How long the lease was held
    pub duration_secs: f64,
    /// Host memory in MiB when the lease was granted
    pub memory_at_start: f64,
    /// When the lease ended
    pub ended_at: Time,
    /// How it ended
    pub outcome: LeaseOutcome,
}

impl LeaseRecord {
    /// Close a lease at `now`.
    pub fn close(lease: &ActiveLease, outcome: LeaseOutcome, now: Time) -> Self {
        Self {
            execution_id: lease.execution_id,
            name: lease.name.clone(),
            duration_secs: lease.age(now).as_secs_f64(),
            memory_at_start: lease.memory_at_start,
            ended_at: now,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_fresh_lease_not_expired() {
        let now = Utc::now();
        let lease = ActiveLease::new(ExecutionId::new(), "t", 100.0, now);
        assert_eq!(lease.expiry(now + secs(59), &LeasePolicy::default()), None);
    }

    #[test]
    fn test_heartbeat_lost_before_timeout() {
        let now = Utc::now();
        let lease = ActiveLease::new(ExecutionId::new(), "t", 100.0, now);
        assert_eq!(
            lease.expiry(now + secs(61), &LeasePolicy::default()),
            Some(LeaseExpiry::HeartbeatLost)
        );
    }

    #[test]
    fn test_renewed_lease_times_out() {
        let now = Utc::now();
        let mut lease = ActiveLease::new(ExecutionId::new(), "t", 100.0, now);
        lease.renew(now + secs(290));
        assert_eq!(lease.expiry(now + secs(299), &LeasePolicy::default()), None);
        assert_eq!(
            lease.expiry(now + secs(301), &LeasePolicy::default()),
            Some(LeaseExpiry::Timeout)
        );
    }

    #[test]
    fn test_renew_never_moves_backwards() {
        let now = Utc::now();
        let mut lease = ActiveLease::new(ExecutionId::new(), "t", 100.0, now);
        lease.renew(now - secs(10));
        assert_eq!(lease.last_heartbeat, now);
    }

    #[test]
    fn test_close_records_duration() {
        let now = Utc::now();
        let lease = ActiveLease::new(ExecutionId::new(), "t", 120.0, now);
        let record = LeaseRecord::close(&lease, LeaseOutcome::Completed, now + secs(42));
        assert_eq!(record.duration_secs, 42.0);
        assert_eq!(record.memory_at_start, 120.0);
    }
}
