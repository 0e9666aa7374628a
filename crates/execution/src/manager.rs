//! Execution manager - the public entry point.
//!
//! `submit` answers from the cache when it can, otherwise admits the
//! execution to the worker pool or parks it in the queue. One background
//! loop drains the queue as resources free up and purges old results.

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use probekit_browser::TestRunner;
use probekit_core::{
    ExecutionId, ExecutionMode, ExecutionRequest, ExecutionResult, ExecutionStatus, ExecutionType,
    ManagerSettings, Settings, TestCase, Time,
};
use probekit_resources::{Admission, LeaseGuard, ResourceManager};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, CacheStats, ExecutionCache};
use crate::fallback::{FallbackService, FallbackStats};
use crate::queue::{ExecutionQueue, QueueStatus};

/// Reason carried by a submission refused because the queue is full.
pub const QUEUE_FULL_REASON: &str = "execution queue is full";

/// Invoked once with the final result of an execution.
pub type ResultCallback = Box<dyn Fn(&ExecutionResult) + Send + Sync>;

/// Error carried by an execution submitted outside a tokio runtime.
pub const NO_RUNTIME_REASON: &str = "no async runtime available";

/// What `submit` did with a test case.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    /// Assigned execution id
    pub execution_id: ExecutionId,
    /// Status at submission time
    pub status: ExecutionStatus,
    /// Answered from the result cache
    pub from_cache: bool,
    /// Why it was queued or refused
    pub reason: Option<String>,
    /// Present when the submission finished immediately
    pub result: Option<ExecutionResult>,
}

/// Where an execution currently is.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StatusReport {
    /// Executing now
    Running {
        /// Execution id
        execution_id: ExecutionId,
        /// Test case name
        name: String,
        /// When the run started
        started_at: Time,
    },
    /// Finished with a result
    Finished(ExecutionResult),
    /// Waiting in the queue
    Queued {
        /// Execution id
        execution_id: ExecutionId,
        /// When it entered the queue
        queued_at: Option<Time>,
        /// 1-based queue position
        position: usize,
    },
}

/// Manager-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// Executions in flight
    pub running: usize,
    /// Finished results still retained
    pub completed: usize,
    /// Queue occupancy
    pub queue: QueueStatus,
    /// Cache counters
    pub cache: CacheStats,
    /// Strategy counters
    pub fallback: FallbackStats,
    /// Background loops active
    pub background_running: bool,
    /// Callbacks not yet fired
    pub pending_callbacks: usize,
}

struct RunningExecution {
    name: String,
    started_at: Time,
}

struct FinishedExecution {
    result: ExecutionResult,
    finished_at: Time,
}

/// Orchestrates cache, admission, queue and fallback execution.
pub struct ExecutionManager {
    settings: ManagerSettings,
    resources: Arc<ResourceManager>,
    queue: Arc<ExecutionQueue>,
    cache: Arc<ExecutionCache>,
    fallback: Arc<FallbackService>,
    workers: Arc<Semaphore>,
    running: Mutex<HashMap<ExecutionId, RunningExecution>>,
    finished: Mutex<HashMap<ExecutionId, FinishedExecution>>,
    callbacks: Mutex<HashMap<ExecutionId, ResultCallback>>,
    shutdown_tx: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
    background_running: AtomicBool,
}

impl ExecutionManager {
    /// Wire the services together. Call `start` to run the background loops.
    pub fn new(
        settings: &Settings,
        resources: Arc<ResourceManager>,
        runner: Arc<dyn TestRunner>,
    ) -> Arc<Self> {
        let queue = Arc::new(ExecutionQueue::new(&settings.queue));
        let cache = Arc::new(ExecutionCache::new(&settings.cache));
        let fallback = Arc::new(FallbackService::new(
            resources.clone(),
            queue.clone(),
            runner,
            settings.executor.clone(),
        ));
        let pool_size = resources.limits().max_concurrent_executions.max(1);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            settings: settings.manager.clone(),
            resources,
            queue,
            cache,
            fallback,
            workers: Arc::new(Semaphore::new(pool_size)),
            running: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            shutdown_tx,
            background: Mutex::new(Vec::new()),
            background_running: AtomicBool::new(false),
        })
    }

    /// Shared resource manager.
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Pending execution queue.
    pub fn queue(&self) -> &Arc<ExecutionQueue> {
        &self.queue
    }

    /// Result cache.
    pub fn cache(&self) -> &Arc<ExecutionCache> {
        &self.cache
    }

    /// Strategy and fallback service.
    pub fn fallback(&self) -> &Arc<FallbackService> {
        &self.fallback
    }

    /// Submit a test case.
    ///
    /// Never fails: a cache hit or a full queue finishes the execution
    /// immediately (and fires `callback` before returning), otherwise the
    /// receipt says whether it is running or queued. Admitted executions
    /// run on the current tokio runtime; with none available they fail
    /// with [`NO_RUNTIME_REASON`].
    pub fn submit(
        self: &Arc<Self>,
        testcase: TestCase,
        mode: ExecutionMode,
        callback: Option<ResultCallback>,
    ) -> SubmitReceipt {
        let request = ExecutionRequest::new(testcase, mode);
        let execution_id = request.execution_id;
        let key = CacheKey::for_testcase(&request.testcase, mode);
        info!(
            "Submitted {} - {} ({}, {} steps)",
            execution_id,
            request.testcase.name,
            mode,
            request.testcase.steps.len()
        );

        if let Some(callback) = callback {
            self.callbacks.lock().insert(execution_id, callback);
        }

        if let Some(cached) = self.cache.get(&key) {
            let mut result = cached.reissued(execution_id);
            result.from_cache = true;
            result.from_queue = false;
            let status = result.status;
            self.finish(result.clone());
            return SubmitReceipt {
                execution_id,
                status,
                from_cache: true,
                reason: None,
                result: Some(result),
            };
        }

        match self.resources.acquire(execution_id, &request.testcase.name) {
            Ok(lease) => {
                self.mark_running(execution_id, &request.testcase.name);
                match self.spawn_worker(request, lease, key) {
                    None => SubmitReceipt {
                        execution_id,
                        status: ExecutionStatus::Running,
                        from_cache: false,
                        reason: None,
                        result: None,
                    },
                    Some(result) => SubmitReceipt {
                        execution_id,
                        status: result.status,
                        from_cache: false,
                        reason: result.error.clone(),
                        result: Some(result),
                    },
                }
            }
            Err(denied) => {
                info!("Execution {} not admitted: {}", execution_id, denied);
                match self.queue.try_enqueue(request) {
                    Ok(position) => SubmitReceipt {
                        execution_id,
                        status: ExecutionStatus::Queued,
                        from_cache: false,
                        reason: Some(format!("{}, queue position {}", denied, position)),
                        result: None,
                    },
                    Err(request) => {
                        let result = ExecutionResult::terminal(
                            execution_id,
                            request.testcase.name,
                            mode,
                            ExecutionStatus::Rejected,
                            ExecutionType::Rejected,
                            QUEUE_FULL_REASON,
                        );
                        self.finish(result.clone());
                        SubmitReceipt {
                            execution_id,
                            status: ExecutionStatus::Rejected,
                            from_cache: false,
                            reason: Some(QUEUE_FULL_REASON.to_string()),
                            result: Some(result),
                        }
                    }
                }
            }
        }
    }

    fn mark_running(&self, execution_id: ExecutionId, name: &str) {
        self.running.lock().insert(
            execution_id,
            RunningExecution {
                name: name.to_string(),
                started_at: Utc::now(),
            },
        );
    }

    /// Hand the execution to a worker task. Without a tokio runtime the
    /// execution fails immediately and its result is returned.
    fn spawn_worker(
        self: &Arc<Self>,
        request: ExecutionRequest,
        lease: LeaseGuard,
        key: CacheKey,
    ) -> Option<ExecutionResult> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Cannot start execution {}: {}", request.execution_id, e);
                drop(lease);
                let result = ExecutionResult::terminal(
                    request.execution_id,
                    request.testcase.name,
                    request.mode,
                    ExecutionStatus::Failed,
                    ExecutionType::Full,
                    NO_RUNTIME_REASON,
                );
                self.finish(result.clone());
                return Some(result);
            }
        };

        let manager = Arc::clone(self);
        runtime.spawn(async move {
            // the semaphore is never closed
            let _permit = manager.workers.clone().acquire_owned().await.ok();
            let result = manager.run_guarded(request, Some(lease)).await;
            manager.record(&key, result);
        });
        None
    }

    /// Run through the fallback service, turning a panic into a failed result.
    async fn run_guarded(
        &self,
        request: ExecutionRequest,
        lease: Option<LeaseGuard>,
    ) -> ExecutionResult {
        let execution_id = request.execution_id;
        let name = request.testcase.name.clone();
        let mode = request.mode;

        match AssertUnwindSafe(self.fallback.execute(request, lease))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                error!("Execution {} panicked", execution_id);
                ExecutionResult::terminal(
                    execution_id,
                    name,
                    mode,
                    ExecutionStatus::Failed,
                    ExecutionType::Full,
                    "execution panicked",
                )
            }
        }
    }

    fn record(&self, key: &CacheKey, result: ExecutionResult) {
        // sent back to the queue; the drain loop finishes it later
        if result.status == ExecutionStatus::Queued {
            debug!("Execution {} deferred to the queue", result.execution_id);
            self.running.lock().remove(&result.execution_id);
            return;
        }

        if result.status == ExecutionStatus::Completed && !result.from_cache {
            self.cache.set(key.clone(), result.clone());
        }
        self.finish(result);
    }

    /// Publish a final result and fire its callback. The result is visible
    /// before the execution leaves the running set. No locks are held while
    /// the callback runs.
    fn finish(&self, result: ExecutionResult) {
        let execution_id = result.execution_id;
        info!(
            "Execution {} finished: {} ({}, {:.1}%)",
            execution_id, result.status, result.execution_type, result.success_rate
        );

        let callback = self.callbacks.lock().remove(&execution_id);
        self.finished.lock().insert(
            execution_id,
            FinishedExecution {
                result: result.clone(),
                finished_at: Utc::now(),
            },
        );
        self.running.lock().remove(&execution_id);

        if let Some(callback) = callback {
            let fired = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&result)));
            if fired.is_err() {
                error!("Result callback for {} panicked", execution_id);
            }
        }
    }

    /// Start the resource monitor and the queue drain loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        if self.background_running.swap(true, Ordering::AcqRel) {
            warn!("Execution manager already started");
            return;
        }
        self.shutdown_tx.send_replace(false);

        let monitor = self
            .resources
            .clone()
            .spawn_monitor(self.shutdown_tx.subscribe());

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = Duration::from_secs(self.settings.poll_interval_secs.max(1));
        let drain = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // bounded so requeued items wait for the next tick
                        for _ in 0..manager.queue.len() {
                            if manager.drain_once().await.is_none() {
                                break;
                            }
                        }
                        manager.purge_completed();
                        manager.cache.purge_expired_at(Utc::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Queue drain loop stopped");
        });

        self.background.lock().extend([monitor, drain]);
        info!(
            "Execution manager started (poll every {}s)",
            period.as_secs()
        );
    }

    /// Stop the background loops. In-flight executions are not preempted.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.background_running.store(false, Ordering::Release);
        info!("Execution manager stopped");
    }

    /// Take one request off the queue and run it to completion.
    ///
    /// Returns `None` when another consumer is draining, the queue is empty
    /// or resources are not available.
    pub async fn drain_once(self: &Arc<Self>) -> Option<ExecutionId> {
        let _processing = self.queue.try_begin_processing()?;
        if self.queue.is_empty() {
            return None;
        }
        if let Admission::Denied(reason) = self.resources.can_admit() {
            debug!("Queue waiting for resources: {}", reason);
            return None;
        }

        // running from the moment it leaves the queue
        let request = self.queue.dequeue_with(|request| {
            self.mark_running(request.execution_id, &request.testcase.name);
        })?;
        let execution_id = request.execution_id;
        let key = CacheKey::for_testcase(&request.testcase, request.mode);

        if let Some(cached) = self.cache.get(&key) {
            let mut result = cached.reissued(execution_id);
            result.from_cache = true;
            result.from_queue = true;
            self.finish(result);
            return Some(execution_id);
        }

        info!("Dequeued {} - {}", execution_id, request.testcase.name);
        let lease = match self.resources.acquire(execution_id, &request.testcase.name) {
            Ok(lease) => Some(lease),
            Err(denied) => {
                debug!("Lease for {} not granted: {}", execution_id, denied);
                None
            }
        };
        let mut result = self.run_guarded(request, lease).await;
        result.from_queue = true;
        self.record(&key, result);
        Some(execution_id)
    }

    /// Drop finished results older than the retention window.
    pub fn purge_completed(&self) -> usize {
        self.purge_completed_at(Utc::now())
    }

    /// Drop finished results older than the retention window as of `now`.
    pub fn purge_completed_at(&self, now: Time) -> usize {
        let retention = i64::try_from(self.settings.retention_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        let mut finished = self.finished.lock();
        let before = finished.len();
        finished.retain(|_, entry| now - entry.finished_at <= retention);
        let purged = before - finished.len();
        if purged > 0 {
            debug!("Purged {} finished execution(s)", purged);
        }
        purged
    }

    /// Where an execution is: running, then finished, then queued.
    ///
    /// Every handoff publishes the new state before clearing the old one,
    /// so a second lookup finds anything that moved during the first.
    pub fn status(&self, execution_id: &ExecutionId) -> Option<StatusReport> {
        self.lookup(execution_id).or_else(|| self.lookup(execution_id))
    }

    fn lookup(&self, execution_id: &ExecutionId) -> Option<StatusReport> {
        if let Some(running) = self.running.lock().get(execution_id) {
            return Some(StatusReport::Running {
                execution_id: *execution_id,
                name: running.name.clone(),
                started_at: running.started_at,
            });
        }
        if let Some(entry) = self.finished.lock().get(execution_id) {
            return Some(StatusReport::Finished(entry.result.clone()));
        }
        self.queue
            .locate(execution_id)
            .map(|(position, queued_at)| StatusReport::Queued {
                execution_id: *execution_id,
                queued_at,
                position,
            })
    }

    /// Final result, if the execution has finished.
    pub fn result(&self, execution_id: &ExecutionId) -> Option<ExecutionResult> {
        self.finished
            .lock()
            .get(execution_id)
            .map(|entry| entry.result.clone())
    }

    /// Poll until the execution finishes or `timeout` elapses.
    pub async fn wait_for(
        &self,
        execution_id: &ExecutionId,
        timeout: Duration,
    ) -> Option<ExecutionResult> {
        let start = tokio::time::Instant::now();
        let sleep_duration = Duration::from_millis(100);

        loop {
            if let Some(result) = self.result(execution_id) {
                return Some(result);
            }
            if start.elapsed() >= timeout {
                return None;
            }
            tokio::time::sleep(sleep_duration).await;
        }
    }

    /// Snapshot of manager-wide counters.
    pub fn stats(&self) -> ManagerStats {
        // one lock at a time; the drain loop takes queue then running
        let running = self.running.lock().len();
        let completed = self.finished.lock().len();
        let pending_callbacks = self.callbacks.lock().len();
        ManagerStats {
            running,
            completed,
            queue: self.queue.status(),
            cache: self.cache.stats(),
            fallback: self.fallback.stats(),
            background_running: self.background_running.load(Ordering::Acquire),
            pending_callbacks,
        }
    }
}
