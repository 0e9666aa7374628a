//! Fallback service - picks an execution strategy and degrades on failure.
//!
//! Full falls back to lightweight, lightweight to simulated, and a queued
//! request that finds the queue full is simulated. Simulation cannot fail.

use probekit_browser::{RunProfile, TestRunner};
use probekit_core::{
    Complexity, ExecutionId, ExecutionRequest, ExecutionResult, ExecutionStatus, ExecutionType,
    ExecutorSettings, FallbackStrategy, StepResult, TestCase,
};
use probekit_resources::{LeaseGuard, ResourceManager};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::queue::ExecutionQueue;

/// 1x1 transparent PNG used as the screenshot of simulated steps.
const PLACEHOLDER_SCREENSHOT: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

/// A strategy and why it was chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDecision {
    /// Chosen strategy
    pub strategy: FallbackStrategy,
    /// Human readable cause
    pub reason: String,
}

/// Execution counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackStats {
    /// Requests handled
    pub total_executions: u64,
    /// Real runs that returned a result
    pub successful_executions: u64,
    /// Runs that ended up lightweight or simulated
    pub fallback_executions: u64,
    /// Requests sent back to the queue
    pub queued_executions: u64,
    /// Requests refused
    pub rejected_executions: u64,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    fallback: AtomicU64,
    queued: AtomicU64,
    rejected: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Chooses and runs the cheapest viable strategy.
pub struct FallbackService {
    resources: Arc<ResourceManager>,
    queue: Arc<ExecutionQueue>,
    runner: Arc<dyn TestRunner>,
    executor: ExecutorSettings,
    counters: Counters,
}

impl FallbackService {
    /// Create the service.
    pub fn new(
        resources: Arc<ResourceManager>,
        queue: Arc<ExecutionQueue>,
        runner: Arc<dyn TestRunner>,
        executor: ExecutorSettings,
    ) -> Self {
        Self {
            resources,
            queue,
            runner,
            executor,
            counters: Counters::default(),
        }
    }

    /// Strategy for a test case under current pressure.
    pub fn decide(&self, testcase: &TestCase) -> StrategyDecision {
        self.decide_for(testcase, None)
    }

    /// Memory-driven branches win; complexity only refines the lightweight one.
    fn decide_for(&self, testcase: &TestCase, holder: Option<&ExecutionId>) -> StrategyDecision {
        let (snapshot, suggested) = self.resources.assess(holder);
        let memory = snapshot.memory_percent;
        let complexity = testcase.complexity();

        let (strategy, reason) = match suggested {
            FallbackStrategy::Simulated => (
                FallbackStrategy::Simulated,
                format!("memory usage critical ({:.1}%)", memory),
            ),
            FallbackStrategy::Lightweight if complexity == Complexity::Simple => (
                FallbackStrategy::Lightweight,
                format!("memory usage high ({:.1}%), simple test case", memory),
            ),
            FallbackStrategy::Lightweight => (
                FallbackStrategy::Simulated,
                format!(
                    "memory usage high ({:.1}%) for a {}-step test case",
                    memory,
                    testcase.steps.len()
                ),
            ),
            FallbackStrategy::Queued => (
                FallbackStrategy::Queued,
                "all execution slots are busy".to_string(),
            ),
            FallbackStrategy::Full => (FallbackStrategy::Full, "resources available".to_string()),
            FallbackStrategy::Rejected => (
                FallbackStrategy::Rejected,
                "no execution slots configured".to_string(),
            ),
        };

        info!("Strategy for {}: {} - {}", testcase.name, strategy, reason);
        StrategyDecision { strategy, reason }
    }

    /// Run a request with the chosen strategy, degrading on failure.
    ///
    /// `lease` is the slot already granted to this execution, if any; it is
    /// used by the real-browser strategies and released otherwise.
    pub async fn execute(&self, request: ExecutionRequest, lease: Option<LeaseGuard>) -> ExecutionResult {
        bump(&self.counters.total);
        let holder = lease.as_ref().map(LeaseGuard::execution_id);
        let decision = self.decide_for(&request.testcase, holder.as_ref());

        match decision.strategy {
            FallbackStrategy::Full => self.run_full(&request, lease).await,
            FallbackStrategy::Lightweight => {
                self.run_lightweight(&request, lease, decision.reason).await
            }
            FallbackStrategy::Simulated => {
                drop(lease);
                self.simulate(&request, &decision.reason)
            }
            FallbackStrategy::Queued => {
                drop(lease);
                self.requeue(request, &decision.reason)
            }
            FallbackStrategy::Rejected => {
                drop(lease);
                self.reject(&request, &decision.reason)
            }
        }
    }

    fn claim(&self, request: &ExecutionRequest, lease: Option<LeaseGuard>) -> Option<LeaseGuard> {
        lease.or_else(|| {
            self.resources
                .acquire(request.execution_id, &request.testcase.name)
                .ok()
        })
    }

    async fn run_full(&self, request: &ExecutionRequest, lease: Option<LeaseGuard>) -> ExecutionResult {
        let Some(lease) = self.claim(request, lease) else {
            return self.simulate(request, "could not register execution");
        };

        info!("Full execution: {}", request.execution_id);
        let profile = RunProfile::full(self.resources.optimization_tier(), self.resources.limits());
        match self.runner.run(request, &profile, Some(&lease)).await {
            Ok(result) => {
                bump(&self.counters.successful);
                result
            }
            Err(e) => {
                error!("Full execution of {} failed: {}", request.execution_id, e);
                info!("Falling back to lightweight execution for {}", request.execution_id);
                self.run_lightweight(request, Some(lease), format!("full execution failed: {}", e))
                    .await
            }
        }
    }

    async fn run_lightweight(
        &self,
        request: &ExecutionRequest,
        lease: Option<LeaseGuard>,
        reason: String,
    ) -> ExecutionResult {
        let Some(lease) = self.claim(request, lease) else {
            return self.simulate(request, "could not register execution");
        };

        info!("Lightweight execution: {}", request.execution_id);
        let profile = RunProfile::lightweight(&self.executor, self.resources.limits());
        match self.runner.run(request, &profile, Some(&lease)).await {
            Ok(mut result) => {
                bump(&self.counters.successful);
                bump(&self.counters.fallback);
                result.execution_type = ExecutionType::Lightweight;
                result.fallback_reason = Some(reason);
                result
            }
            Err(e) => {
                error!("Lightweight execution of {} failed: {}", request.execution_id, e);
                info!("Falling back to simulated execution for {}", request.execution_id);
                drop(lease);
                self.simulate(request, &format!("lightweight execution failed: {}", e))
            }
        }
    }

    /// Synthetic run: every step passes with a placeholder screenshot.
    pub fn simulate(&self, request: &ExecutionRequest, reason: &str) -> ExecutionResult {
        info!("Simulated execution: {} ({})", request.execution_id, reason);
        bump(&self.counters.fallback);

        let mut result = ExecutionResult::started(
            request.execution_id,
            request.testcase.name.clone(),
            request.mode,
            ExecutionType::Simulated,
        );
        for (index, step) in request.testcase.steps.iter().enumerate() {
            let description = if step.description.is_empty() {
                format!("step {}", index + 1)
            } else {
                step.description.clone()
            };
            let mut step_result = StepResult::passed(&step.action, description);
            step_result.screenshot = Some(PLACEHOLDER_SCREENSHOT.to_string());
            step_result.ai_response = Some(format!("Simulated step: {}", step.label()));
            result.record_step(step_result);
        }
        result.complete();
        result.fallback_reason = Some(reason.to_string());
        result
    }

    fn requeue(&self, request: ExecutionRequest, reason: &str) -> ExecutionResult {
        let id = request.execution_id;
        let name = request.testcase.name.clone();
        let mode = request.mode;

        match self.queue.try_enqueue(request) {
            Ok(position) => {
                bump(&self.counters.queued);
                let mut result = ExecutionResult::started(id, name, mode, ExecutionType::Queued);
                result.status = ExecutionStatus::Queued;
                result.fallback_reason = Some(format!("{}, queue position {}", reason, position));
                result
            }
            Err(request) => {
                warn!("Queue full, simulating {}", id);
                self.simulate(&request, "execution queue is full")
            }
        }
    }

    fn reject(&self, request: &ExecutionRequest, reason: &str) -> ExecutionResult {
        warn!("Rejected execution {}: {}", request.execution_id, reason);
        bump(&self.counters.rejected);
        ExecutionResult::terminal(
            request.execution_id,
            request.testcase.name.clone(),
            request.mode,
            ExecutionStatus::Rejected,
            ExecutionType::Rejected,
            reason,
        )
    }

    /// Counter snapshot.
    pub fn stats(&self) -> FallbackStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        FallbackStats {
            total_executions: load(&self.counters.total),
            successful_executions: load(&self.counters.successful),
            fallback_executions: load(&self.counters.fallback),
            queued_executions: load(&self.counters.queued),
            rejected_executions: load(&self.counters.rejected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use probekit_browser::{ExecutorError, Result as ExecResult};
    use probekit_core::{ExecutionMode, Heartbeat, ResourceLimits, Step};
    use probekit_resources::FixedSampler;
    use std::sync::atomic::AtomicUsize;

    /// Runner that fails the first `failures` calls.
    #[derive(Default)]
    struct ScriptedRunner {
        failures: usize,
        calls: AtomicUsize,
        profiles: parking_lot::Mutex<Vec<ExecutionType>>,
    }

    #[async_trait]
    impl TestRunner for ScriptedRunner {
        async fn run(
            &self,
            request: &ExecutionRequest,
            profile: &RunProfile,
            heartbeat: Option<&dyn Heartbeat>,
        ) -> ExecResult<ExecutionResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.profiles.lock().push(profile.execution_type);
            if call < self.failures {
                return Err(ExecutorError::HealthCheck("server not ready".to_string()));
            }
            let mut result = ExecutionResult::started(
                request.execution_id,
                request.testcase.name.clone(),
                request.mode,
                profile.execution_type,
            );
            for step in &request.testcase.steps {
                result.record_step(StepResult::passed(&step.action, step.label()));
                if let Some(heartbeat) = heartbeat {
                    heartbeat.beat();
                }
            }
            result.complete();
            Ok(result)
        }
    }

    struct Fixture {
        sampler: Arc<FixedSampler>,
        resources: Arc<ResourceManager>,
        queue: Arc<ExecutionQueue>,
        runner: Arc<ScriptedRunner>,
        service: FallbackService,
    }

    fn fixture_with(limits: ResourceLimits, queue_size: usize, runner: ScriptedRunner) -> Fixture {
        let sampler = Arc::new(FixedSampler::idle());
        let resources = Arc::new(ResourceManager::new(limits, sampler.clone()));
        let queue = Arc::new(ExecutionQueue::with_capacity(queue_size));
        let runner = Arc::new(runner);
        let service = FallbackService::new(
            resources.clone(),
            queue.clone(),
            runner.clone(),
            ExecutorSettings::default(),
        );
        Fixture {
            sampler,
            resources,
            queue,
            runner,
            service,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ResourceLimits::default(), 10, ScriptedRunner::default())
    }

    fn testcase(steps: usize) -> TestCase {
        let steps = (0..steps)
            .map(|i| Step::new("ai_tap", format!("tap {}", i)).param("prompt", "button"))
            .collect();
        TestCase::new("signup", steps)
    }

    fn request(steps: usize) -> ExecutionRequest {
        ExecutionRequest::new(testcase(steps), ExecutionMode::Headless)
    }

    #[test]
    fn test_critical_memory_always_simulates() {
        let f = fixture();
        f.sampler.set(100.0, 95.0, 5.0);
        for steps in [0, 2, 6, 20] {
            assert_eq!(f.service.decide(&testcase(steps)).strategy, FallbackStrategy::Simulated);
        }
    }

    #[test]
    fn test_high_memory_refined_by_complexity() {
        let f = fixture();
        f.sampler.set(100.0, 85.0, 5.0);
        assert_eq!(f.service.decide(&testcase(3)).strategy, FallbackStrategy::Lightweight);
        assert_eq!(f.service.decide(&testcase(4)).strategy, FallbackStrategy::Simulated);
        assert_eq!(f.service.decide(&testcase(12)).strategy, FallbackStrategy::Simulated);
    }

    #[test]
    fn test_busy_slots_queue() {
        let f = fixture();
        f.resources.register(ExecutionId::new(), "a");
        f.resources.register(ExecutionId::new(), "b");
        let decision = f.service.decide(&testcase(2));
        assert_eq!(decision.strategy, FallbackStrategy::Queued);
        assert_eq!(decision.reason, "all execution slots are busy");
    }

    #[tokio::test]
    async fn test_full_execution_with_granted_lease() {
        let f = fixture();
        let req = request(3);
        let lease = f.resources.acquire(req.execution_id, "signup").unwrap();

        let result = f.service.execute(req, Some(lease)).await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.execution_type, ExecutionType::Full);
        assert_eq!(result.total_count, 3);
        assert_eq!(f.resources.active_count(), 0);
        assert_eq!(f.service.stats().successful_executions, 1);
    }

    #[tokio::test]
    async fn test_full_failure_falls_back_to_lightweight() {
        let f = fixture_with(
            ResourceLimits::default(),
            10,
            ScriptedRunner {
                failures: 1,
                ..Default::default()
            },
        );

        let result = f.service.execute(request(2), None).await;
        assert_eq!(result.execution_type, ExecutionType::Lightweight);
        assert!(result
            .fallback_reason
            .as_deref()
            .unwrap()
            .starts_with("full execution failed"));
        assert_eq!(
            *f.runner.profiles.lock(),
            vec![ExecutionType::Full, ExecutionType::Lightweight]
        );
        assert_eq!(f.resources.active_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_failure_ends_simulated() {
        let f = fixture_with(
            ResourceLimits::default(),
            10,
            ScriptedRunner {
                failures: 2,
                ..Default::default()
            },
        );

        let result = f.service.execute(request(4), None).await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.execution_type, ExecutionType::Simulated);
        assert_eq!(result.success_rate, 100.0);

        let stats = f.service.stats();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.successful_executions, 0);
        assert_eq!(stats.fallback_executions, 1);
    }

    #[tokio::test]
    async fn test_simulated_result_mirrors_steps() {
        let f = fixture();
        f.sampler.set(100.0, 95.0, 5.0);

        let result = f.service.execute(request(7), None).await;
        assert_eq!(result.execution_type, ExecutionType::Simulated);
        assert_eq!(result.steps.len(), 7);
        assert_eq!(result.success_rate, 100.0);
        assert!(result.steps.iter().all(|s| s.success && s.screenshot.is_some()));
        assert_eq!(f.runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_step_test_case() {
        let f = fixture();
        let result = f.service.execute(request(0), None).await;
        assert_eq!(result.total_count, 0);
        assert_eq!(result.success_rate, 100.0);

        f.sampler.set(100.0, 95.0, 5.0);
        let simulated = f.service.execute(request(0), None).await;
        assert_eq!(simulated.success_rate, 100.0);
    }

    #[tokio::test]
    async fn test_queued_then_queue_full_simulates() {
        let f = fixture_with(ResourceLimits::default(), 1, ScriptedRunner::default());
        f.resources.register(ExecutionId::new(), "a");
        f.resources.register(ExecutionId::new(), "b");

        let first = f.service.execute(request(2), None).await;
        assert_eq!(first.status, ExecutionStatus::Queued);
        assert_eq!(first.execution_type, ExecutionType::Queued);
        assert_eq!(f.queue.position(&first.execution_id), Some(1));

        let second = f.service.execute(request(2), None).await;
        assert_eq!(second.execution_type, ExecutionType::Simulated);
        assert_eq!(second.fallback_reason.as_deref(), Some("execution queue is full"));
        assert_eq!(f.service.stats().queued_executions, 1);
    }

    #[tokio::test]
    async fn test_zero_slots_reject() {
        let limits = ResourceLimits {
            max_concurrent_executions: 0,
            ..Default::default()
        };
        let f = fixture_with(limits, 10, ScriptedRunner::default());

        let result = f.service.execute(request(1), None).await;
        assert_eq!(result.status, ExecutionStatus::Rejected);
        assert!(result.error.is_some());
        assert_eq!(f.service.stats().rejected_executions, 1);
    }
}
