//! Admission control and lease bookkeeping.

use chrono::Utc;
use parking_lot::Mutex;
use probekit_core::{
    ExecutionId, FallbackStrategy, Heartbeat, OptimizationConfig, ResourceLimits,
    ResourceSnapshot, Time,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::lease::{ActiveLease, LeaseExpiry, LeaseOutcome, LeasePolicy, LeaseRecord};
use crate::sampler::{ResourceSampler, SystemSampler};

/// Why admission was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    /// Host memory above the budget
    MemoryLimit {
        /// Memory in use, MiB
        used_mb: f64,
        /// Configured budget, MiB
        limit_mb: u64,
    },
    /// CPU above the limit
    CpuLimit {
        /// Current CPU usage
        percent: f64,
        /// Configured limit
        limit: f64,
    },
    /// All execution slots taken
    ConcurrencyLimit {
        /// Leases held
        active: usize,
        /// Configured maximum
        max: usize,
    },
    /// Execution id already holds a lease
    AlreadyRegistered,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::MemoryLimit { used_mb, limit_mb } => {
                write!(f, "memory usage {:.0}MB exceeds limit {}MB", used_mb, limit_mb)
            }
            DenyReason::CpuLimit { percent, limit } => {
                write!(f, "cpu usage {:.1}% exceeds limit {:.0}%", percent, limit)
            }
            DenyReason::ConcurrencyLimit { active, max } => {
                write!(f, "concurrent executions at limit ({}/{})", active, max)
            }
            DenyReason::AlreadyRegistered => write!(f, "execution already registered"),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Resources are available
    Granted,
    /// Resources are not available
    Denied(DenyReason),
}

impl Admission {
    /// Whether admission was granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }

    /// Human readable reason.
    pub fn reason(&self) -> String {
        match self {
            Admission::Granted => "resources available".to_string(),
            Admission::Denied(reason) => reason.to_string(),
        }
    }
}

/// A lease removed by the stale sweep.
#[derive(Debug, Clone)]
pub struct ReclaimedLease {
    /// The lease as it was when removed
    pub lease: ActiveLease,
    /// Why it was reclaimed
    pub cause: LeaseExpiry,
}

/// Per-limit checks for a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitChecks {
    /// Memory within budget
    pub memory_ok: bool,
    /// CPU within limit
    pub cpu_ok: bool,
    /// Disk within limit
    pub disk_ok: bool,
    /// A slot is free
    pub concurrent_ok: bool,
}

/// Point-in-time resource report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceReport {
    /// Latest sample
    pub current: ResourceSnapshot,
    /// Leases held
    pub active_executions: usize,
    /// Per-limit checks
    pub limits: LimitChecks,
    /// Tuning for the current tier
    pub optimization: OptimizationConfig,
    /// Strategy a new execution would get
    pub strategy: FallbackStrategy,
    /// Ended leases in history
    pub history_count: usize,
    /// Mean duration of the last 10 finished leases
    pub average_duration_secs: f64,
}

#[derive(Default)]
struct LeaseTable {
    active: HashMap<ExecutionId, ActiveLease>,
    history: VecDeque<LeaseRecord>,
}

/// Samples the host, gates admission and tracks execution leases.
///
/// The lease table sits behind one mutex; `register` evaluates the admission
/// predicate and inserts the lease inside the same critical section.
pub struct ResourceManager {
    limits: ResourceLimits,
    policy: LeasePolicy,
    sampler: Arc<dyn ResourceSampler>,
    leases: Mutex<LeaseTable>,
}

impl ResourceManager {
    /// Create a manager with a custom sampler.
    pub fn new(limits: ResourceLimits, sampler: Arc<dyn ResourceSampler>) -> Self {
        let policy = LeasePolicy {
            max_age: limits.max_execution_time(),
            heartbeat_timeout: limits.heartbeat_timeout(),
        };
        Self {
            limits,
            policy,
            sampler,
            leases: Mutex::new(LeaseTable::default()),
        }
    }

    /// Create a manager sampling the local host.
    pub fn with_system_sampler(limits: ResourceLimits) -> Self {
        Self::new(limits, Arc::new(SystemSampler::new()))
    }

    /// Configured limits.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Current host usage. A failed sample yields the zero snapshot.
    pub fn snapshot(&self) -> ResourceSnapshot {
        match self.sampler.sample() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Resource sampling failed, assuming idle host: {}", e);
                ResourceSnapshot::default()
            }
        }
    }

    /// Number of active leases.
    pub fn active_count(&self) -> usize {
        self.leases.lock().active.len()
    }

    /// Copy of the active leases.
    pub fn active_leases(&self) -> Vec<ActiveLease> {
        self.leases.lock().active.values().cloned().collect()
    }

    /// Whether a lease is held for `execution_id`.
    pub fn is_active(&self, execution_id: &ExecutionId) -> bool {
        self.leases.lock().active.contains_key(execution_id)
    }

    /// Check whether a new execution could start now.
    ///
    /// Disk usage is reported but not part of the predicate.
    pub fn can_admit(&self) -> Admission {
        let snapshot = self.snapshot();
        let active = self.active_count();
        self.evaluate(&snapshot, active)
    }

    fn evaluate(&self, snapshot: &ResourceSnapshot, active: usize) -> Admission {
        if snapshot.memory_used_mb >= self.limits.max_memory_mb as f64 {
            return Admission::Denied(DenyReason::MemoryLimit {
                used_mb: snapshot.memory_used_mb,
                limit_mb: self.limits.max_memory_mb,
            });
        }
        if snapshot.cpu_percent >= self.limits.cpu_limit_percent {
            return Admission::Denied(DenyReason::CpuLimit {
                percent: snapshot.cpu_percent,
                limit: self.limits.cpu_limit_percent,
            });
        }
        if active >= self.limits.max_concurrent_executions {
            return Admission::Denied(DenyReason::ConcurrencyLimit {
                active,
                max: self.limits.max_concurrent_executions,
            });
        }
        Admission::Granted
    }

    /// Atomically re-check admission and grant a lease.
    pub fn try_register(&self, execution_id: ExecutionId, name: &str) -> Admission {
        let snapshot = self.snapshot();
        let now = Utc::now();

        let mut table = self.leases.lock();
        if table.active.contains_key(&execution_id) {
            return Admission::Denied(DenyReason::AlreadyRegistered);
        }
        let admission = self.evaluate(&snapshot, table.active.len());
        match &admission {
            Admission::Granted => {
                table.active.insert(
                    execution_id,
                    ActiveLease::new(execution_id, name, snapshot.memory_used_mb, now),
                );
                info!("Registered execution {} - {}", execution_id, name);
            }
            Admission::Denied(reason) => {
                warn!("Cannot start execution {}: {}", execution_id, reason);
            }
        }
        admission
    }

    /// Grant a lease; false leaves the lease table untouched.
    pub fn register(&self, execution_id: ExecutionId, name: &str) -> bool {
        self.try_register(execution_id, name).is_granted()
    }

    /// Grant a lease released automatically when the guard drops.
    pub fn acquire(
        self: &Arc<Self>,
        execution_id: ExecutionId,
        name: &str,
    ) -> Result<LeaseGuard, DenyReason> {
        match self.try_register(execution_id, name) {
            Admission::Granted => Ok(LeaseGuard {
                manager: Arc::clone(self),
                execution_id,
                released: false,
            }),
            Admission::Denied(reason) => Err(reason),
        }
    }

    /// Renew a lease heartbeat.
    pub fn heartbeat(&self, execution_id: &ExecutionId) -> bool {
        self.heartbeat_at(execution_id, Utc::now())
    }

    /// Renew a lease heartbeat as of `now`.
    pub fn heartbeat_at(&self, execution_id: &ExecutionId, now: Time) -> bool {
        match self.leases.lock().active.get_mut(execution_id) {
            Some(lease) => {
                lease.renew(now);
                true
            }
            None => false,
        }
    }

    /// Release a lease and record it in the history.
    pub fn unregister(&self, execution_id: &ExecutionId) -> Option<ActiveLease> {
        let now = Utc::now();
        let mut table = self.leases.lock();
        let lease = table.active.remove(execution_id)?;
        self.push_history(&mut table, LeaseRecord::close(&lease, LeaseOutcome::Completed, now));
        info!("Unregistered execution {}", execution_id);
        Some(lease)
    }

    fn push_history(&self, table: &mut LeaseTable, record: LeaseRecord) {
        table.history.push_back(record);
        while table.history.len() > self.limits.history_limit {
            table.history.pop_front();
        }
    }

    /// Reclaim leases that timed out or lost their heartbeat.
    pub fn reclaim_stale(&self) -> Vec<ReclaimedLease> {
        self.reclaim_stale_at(Utc::now())
    }

    /// Reclaim leases stale as of `now`.
    pub fn reclaim_stale_at(&self, now: Time) -> Vec<ReclaimedLease> {
        let mut table = self.leases.lock();
        let stale: Vec<(ExecutionId, LeaseExpiry)> = table
            .active
            .iter()
            .filter_map(|(id, lease)| lease.expiry(now, &self.policy).map(|cause| (*id, cause)))
            .collect();

        let mut reclaimed = Vec::with_capacity(stale.len());
        for (id, cause) in stale {
            if let Some(lease) = table.active.remove(&id) {
                match cause {
                    LeaseExpiry::Timeout => warn!("Execution timed out: {}", id),
                    LeaseExpiry::HeartbeatLost => warn!("Execution heartbeat lost: {}", id),
                }
                let record = LeaseRecord::close(&lease, LeaseOutcome::Reclaimed(cause), now);
                self.push_history(&mut table, record);
                reclaimed.push(ReclaimedLease { lease, cause });
            }
        }
        reclaimed
    }

    /// Optimization bundle for current memory pressure.
    pub fn optimization_tier(&self) -> OptimizationConfig {
        OptimizationConfig::for_memory_percent(self.snapshot().memory_percent)
    }

    /// Suggested strategy for a new execution.
    pub fn suggest_strategy(&self) -> FallbackStrategy {
        self.suggest_strategy_excluding(None)
    }

    /// Suggested strategy, not counting the lease held by `holder`.
    pub fn suggest_strategy_excluding(&self, holder: Option<&ExecutionId>) -> FallbackStrategy {
        self.assess(holder).1
    }

    /// One sample and the strategy it implies, not counting `holder`'s lease.
    pub fn assess(&self, holder: Option<&ExecutionId>) -> (ResourceSnapshot, FallbackStrategy) {
        let snapshot = self.snapshot();
        let others = {
            let table = self.leases.lock();
            let own = holder.map_or(0, |id| usize::from(table.active.contains_key(id)));
            table.active.len() - own
        };
        let strategy = self.strategy_for(&snapshot, others);
        (snapshot, strategy)
    }

    /// Strategy for a snapshot and a count of other running executions.
    ///
    /// Memory is checked before concurrency.
    pub fn strategy_for(&self, snapshot: &ResourceSnapshot, active: usize) -> FallbackStrategy {
        if self.limits.max_concurrent_executions == 0 {
            FallbackStrategy::Rejected
        } else if snapshot.memory_percent > 90.0 {
            FallbackStrategy::Simulated
        } else if snapshot.memory_percent > 80.0 {
            FallbackStrategy::Lightweight
        } else if active >= self.limits.max_concurrent_executions {
            FallbackStrategy::Queued
        } else {
            FallbackStrategy::Full
        }
    }

    /// Finished lease history, oldest first.
    pub fn history(&self) -> Vec<LeaseRecord> {
        self.leases.lock().history.iter().cloned().collect()
    }

    /// Full resource report from a single sample.
    pub fn report(&self) -> ResourceReport {
        let current = self.snapshot();
        let (active, history_count, average_duration_secs) = {
            let table = self.leases.lock();
            let recent: Vec<f64> = table
                .history
                .iter()
                .rev()
                .take(10)
                .map(|r| r.duration_secs)
                .collect();
            let average = if recent.is_empty() {
                0.0
            } else {
                recent.iter().sum::<f64>() / recent.len() as f64
            };
            (table.active.len(), table.history.len(), average)
        };

        ResourceReport {
            limits: LimitChecks {
                memory_ok: current.memory_used_mb < self.limits.max_memory_mb as f64,
                cpu_ok: current.cpu_percent < self.limits.cpu_limit_percent,
                disk_ok: current.disk_percent < self.limits.disk_limit_percent,
                concurrent_ok: active < self.limits.max_concurrent_executions,
            },
            optimization: OptimizationConfig::for_memory_percent(current.memory_percent),
            strategy: self.strategy_for(&current, active),
            active_executions: active,
            history_count,
            average_duration_secs,
            current,
        }
    }

    /// Spawn the periodic monitor: reclaim stale leases and log usage.
    pub fn spawn_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.limits.monitor_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }

                let reclaimed = self.reclaim_stale();
                if !reclaimed.is_empty() {
                    info!("Reclaimed {} stale execution(s)", reclaimed.len());
                }

                let snapshot = self.snapshot();
                if !snapshot.is_empty() {
                    debug!(
                        "Resource usage - memory: {:.1}%, cpu: {:.1}%",
                        snapshot.memory_percent, snapshot.cpu_percent
                    );
                }
                if snapshot.memory_percent > 90.0 {
                    warn!("Memory pressure critical ({:.1}%), new executions will be simulated", snapshot.memory_percent);
                }
            }
            debug!("Resource monitor stopped");
        })
    }
}

/// An execution slot held until dropped or released.
pub struct LeaseGuard {
    manager: Arc<ResourceManager>,
    execution_id: ExecutionId,
    released: bool,
}

impl LeaseGuard {
    /// Execution holding the lease.
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Renew the heartbeat; false if the lease was reclaimed.
    pub fn renew(&self) -> bool {
        self.manager.heartbeat(&self.execution_id)
    }

    /// Release now and return the lease, if it was still active.
    pub fn release(mut self) -> Option<ActiveLease> {
        self.released = true;
        self.manager.unregister(&self.execution_id)
    }
}

impl Heartbeat for LeaseGuard {
    fn beat(&self) {
        if !self.renew() {
            debug!("Heartbeat for reclaimed execution {}", self.execution_id);
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.released {
            self.manager.unregister(&self.execution_id);
        }
    }
}

impl fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("execution_id", &self.execution_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::FixedSampler;

    fn manager_with(sampler: Arc<FixedSampler>) -> Arc<ResourceManager> {
        Arc::new(ResourceManager::new(ResourceLimits::default(), sampler))
    }

    #[test]
    fn test_can_admit_idle() {
        let manager = manager_with(Arc::new(FixedSampler::idle()));
        assert!(manager.can_admit().is_granted());
        assert_eq!(manager.can_admit().reason(), "resources available");
    }

    #[test]
    fn test_memory_and_cpu_limits() {
        let sampler = Arc::new(FixedSampler::new(450.0, 50.0, 5.0));
        let manager = manager_with(sampler.clone());
        assert!(matches!(
            manager.can_admit(),
            Admission::Denied(DenyReason::MemoryLimit { .. })
        ));

        sampler.set(100.0, 50.0, 85.0);
        assert!(matches!(
            manager.can_admit(),
            Admission::Denied(DenyReason::CpuLimit { .. })
        ));
    }

    #[test]
    fn test_concurrency_cap_regardless_of_resources() {
        let manager = manager_with(Arc::new(FixedSampler::new(0.0, 0.0, 0.0)));
        assert!(manager.register(ExecutionId::new(), "a"));
        assert!(manager.register(ExecutionId::new(), "b"));

        assert!(matches!(
            manager.can_admit(),
            Admission::Denied(DenyReason::ConcurrencyLimit { active: 2, max: 2 })
        ));
        assert!(!manager.register(ExecutionId::new(), "c"));
        assert_eq!(manager.active_count(), 2);
    }

    #[test]
    fn test_register_unregister_net_zero() {
        let manager = manager_with(Arc::new(FixedSampler::idle()));
        let before = manager.active_count();
        let id = ExecutionId::new();

        assert!(manager.register(id, "login"));
        assert_eq!(manager.active_count(), before + 1);
        let lease = manager.unregister(&id).unwrap();
        assert_eq!(lease.name, "login");
        assert_eq!(manager.active_count(), before);
        assert_eq!(manager.history().len(), 1);
        assert!(manager.unregister(&id).is_none());
    }

    #[test]
    fn test_duplicate_register_rejected() {
        let manager = manager_with(Arc::new(FixedSampler::idle()));
        let id = ExecutionId::new();
        assert!(manager.register(id, "x"));
        assert_eq!(
            manager.try_register(id, "x"),
            Admission::Denied(DenyReason::AlreadyRegistered)
        );
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_failed_sample_fails_open() {
        let sampler = Arc::new(FixedSampler::idle());
        sampler.fail();
        let manager = manager_with(sampler);
        assert!(manager.snapshot().is_empty());
        assert!(manager.can_admit().is_granted());
        assert_eq!(manager.suggest_strategy(), FallbackStrategy::Full);
    }

    #[test]
    fn test_reclaim_heartbeat_before_timeout() {
        let manager = manager_with(Arc::new(FixedSampler::idle()));
        let id = ExecutionId::new();
        assert!(manager.register(id, "slow"));

        let later = Utc::now() + chrono::Duration::seconds(61);
        let reclaimed = manager.reclaim_stale_at(later);
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].cause, LeaseExpiry::HeartbeatLost);
        assert_eq!(manager.active_count(), 0);
        assert_eq!(
            manager.history()[0].outcome,
            LeaseOutcome::Reclaimed(LeaseExpiry::HeartbeatLost)
        );
    }

    #[test]
    fn test_heartbeat_keeps_lease_alive() {
        let manager = manager_with(Arc::new(FixedSampler::idle()));
        let id = ExecutionId::new();
        assert!(manager.register(id, "busy"));

        let now = Utc::now();
        assert!(manager.heartbeat_at(&id, now + chrono::Duration::seconds(30)));
        assert!(manager.reclaim_stale_at(now + chrono::Duration::seconds(61)).is_empty());
        assert!(manager.is_active(&id));

        let reclaimed = manager.reclaim_stale_at(now + chrono::Duration::seconds(301));
        assert_eq!(reclaimed[0].cause, LeaseExpiry::Timeout);
    }

    #[test]
    fn test_suggest_strategy_order() {
        let sampler = Arc::new(FixedSampler::new(100.0, 95.0, 5.0));
        let manager = manager_with(sampler.clone());
        assert!(manager.register(ExecutionId::new(), "a"));
        assert!(manager.register(ExecutionId::new(), "b"));

        // memory dominates concurrency
        assert_eq!(manager.suggest_strategy(), FallbackStrategy::Simulated);
        sampler.set(100.0, 85.0, 5.0);
        assert_eq!(manager.suggest_strategy(), FallbackStrategy::Lightweight);
        sampler.set(100.0, 50.0, 5.0);
        assert_eq!(manager.suggest_strategy(), FallbackStrategy::Queued);
    }

    #[test]
    fn test_suggest_strategy_excludes_holder() {
        let manager = manager_with(Arc::new(FixedSampler::idle()));
        let a = ExecutionId::new();
        assert!(manager.register(a, "a"));
        assert!(manager.register(ExecutionId::new(), "b"));
        assert_eq!(manager.suggest_strategy(), FallbackStrategy::Queued);
        assert_eq!(manager.suggest_strategy_excluding(Some(&a)), FallbackStrategy::Full);
    }

    #[test]
    fn test_zero_slots_rejected() {
        let limits = ResourceLimits {
            max_concurrent_executions: 0,
            ..Default::default()
        };
        let manager = ResourceManager::new(limits, Arc::new(FixedSampler::idle()));
        assert_eq!(manager.suggest_strategy(), FallbackStrategy::Rejected);
    }

    #[test]
    fn test_lease_guard_releases_on_drop() {
        let manager = manager_with(Arc::new(FixedSampler::idle()));
        let id = ExecutionId::new();
        {
            let guard = manager.acquire(id, "scoped").unwrap();
            assert_eq!(guard.execution_id(), id);
            assert!(guard.renew());
            assert_eq!(manager.active_count(), 1);
        }
        assert_eq!(manager.active_count(), 0);

        let guard = manager.acquire(id, "explicit").unwrap();
        assert!(guard.release().is_some());
        assert_eq!(manager.history().len(), 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let limits = ResourceLimits {
            history_limit: 3,
            ..Default::default()
        };
        let manager = ResourceManager::new(limits, Arc::new(FixedSampler::idle()));
        for _ in 0..5 {
            let id = ExecutionId::new();
            assert!(manager.register(id, "x"));
            manager.unregister(&id);
        }
        assert_eq!(manager.history().len(), 3);
    }

    #[test]
    fn test_report() {
        let manager = manager_with(Arc::new(FixedSampler::new(120.0, 65.0, 10.0)));
        let id = ExecutionId::new();
        assert!(manager.register(id, "x"));

        let report = manager.report();
        assert_eq!(report.active_executions, 1);
        assert!(report.limits.memory_ok);
        assert!(report.limits.concurrent_ok);
        assert_eq!(report.optimization.tier, probekit_core::PressureTier::Medium);
        assert_eq!(report.strategy, FallbackStrategy::Full);
        assert_eq!(report.history_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reclaims_and_stops() {
        let limits = ResourceLimits {
            heartbeat_timeout_secs: 0,
            monitor_interval_secs: 1,
            ..Default::default()
        };
        let manager = Arc::new(ResourceManager::new(limits, Arc::new(FixedSampler::idle())));
        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&manager).spawn_monitor(rx);

        let id = ExecutionId::new();
        assert!(manager.register(id, "abandoned"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        // heartbeat timeout is measured in wall-clock time
        std::thread::sleep(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.active_count(), 0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
