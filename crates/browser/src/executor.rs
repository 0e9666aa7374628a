//! CloudExecutor - runs one test case against a freshly started automation server.
//!
//! Each execution walks `Init -> ServerStarting -> ServerReady -> Running ->
//! Cleanup -> Done | Failed`. Cleanup runs whenever a server was launched,
//! whatever happened after.

use async_trait::async_trait;
use probekit_core::{
    ExecutionRequest, ExecutionResult, ExecutionType, ExecutorSettings, Heartbeat,
    OptimizationConfig, PressureTier, ResourceLimits, Step, StepAction, StepResult,
};
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::{ActionReply, ActionRequest, ControlApi, Endpoint, HttpControlClient};
use crate::error::{ExecutorError, Result};
use crate::server::{LaunchSpec, NodeServerLauncher, ServerLauncher, ServerProcess};

const DEFAULT_WAIT_TIMEOUT_MS: u64 = 10_000;

/// Limits and tuning for one run.
#[derive(Debug, Clone)]
pub struct RunProfile {
    /// Browser tuning for the current pressure tier
    pub optimization: OptimizationConfig,
    /// Heap cap for the automation server
    pub memory_cap_mb: u64,
    /// Budget for the step loop
    pub time_limit: Duration,
    /// Reported on the result
    pub execution_type: ExecutionType,
    /// Heartbeat period while a control request is in flight
    pub keepalive: Duration,
}

impl RunProfile {
    /// Full-fidelity run with the given optimization tier.
    pub fn full(optimization: OptimizationConfig, limits: &ResourceLimits) -> Self {
        Self {
            optimization,
            memory_cap_mb: limits.max_memory_mb,
            time_limit: limits.max_execution_time(),
            execution_type: ExecutionType::Full,
            keepalive: keepalive_for(limits),
        }
    }

    /// Degraded run: high-pressure tier, tighter memory and time limits.
    pub fn lightweight(settings: &ExecutorSettings, limits: &ResourceLimits) -> Self {
        Self {
            optimization: OptimizationConfig::for_tier(PressureTier::High),
            memory_cap_mb: settings.lightweight_memory_mb,
            time_limit: Duration::from_secs(settings.lightweight_time_limit_secs),
            execution_type: ExecutionType::Lightweight,
            keepalive: keepalive_for(limits),
        }
    }
}

/// Half the heartbeat timeout, so one missed tick never loses the lease.
fn keepalive_for(limits: &ResourceLimits) -> Duration {
    (limits.heartbeat_timeout() / 2).max(Duration::from_secs(1))
}

/// Lifecycle state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Created, nothing started
    Init,
    /// Automation server spawning
    ServerStarting,
    /// Server passed its health check
    ServerReady,
    /// Steps executing
    Running,
    /// Tearing the server down
    Cleanup,
    /// Finished and cleaned up
    Done,
    /// Aborted by an error
    Failed,
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutorState::Init => "init",
            ExecutorState::ServerStarting => "server_starting",
            ExecutorState::ServerReady => "server_ready",
            ExecutorState::Running => "running",
            ExecutorState::Cleanup => "cleanup",
            ExecutorState::Done => "done",
            ExecutorState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Something that can run a test case for real.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run all steps and aggregate the result.
    ///
    /// Step failures are recorded on the result; an `Err` means the run
    /// itself could not happen (startup, health check, time limit).
    async fn run(
        &self,
        request: &ExecutionRequest,
        profile: &RunProfile,
        heartbeat: Option<&dyn Heartbeat>,
    ) -> Result<ExecutionResult>;
}

/// Drives the node automation server through its control API.
pub struct CloudExecutor {
    settings: ExecutorSettings,
    api: Arc<dyn ControlApi>,
    launcher: Arc<dyn ServerLauncher>,
    next_port: AtomicUsize,
}

impl CloudExecutor {
    /// Create an executor with explicit collaborators.
    pub fn new(
        settings: ExecutorSettings,
        api: Arc<dyn ControlApi>,
        launcher: Arc<dyn ServerLauncher>,
    ) -> Self {
        Self {
            settings,
            api,
            launcher,
            next_port: AtomicUsize::new(0),
        }
    }

    /// Create an executor that spawns node and talks HTTP.
    pub fn from_settings(settings: ExecutorSettings) -> Self {
        let api = Arc::new(HttpControlClient::from_settings(&settings));
        let mut launcher = NodeServerLauncher::new(settings.node_binary.clone());
        if let Some(dir) = &settings.script_dir {
            launcher = launcher.with_script_dir(dir);
        }
        Self::new(settings, api, Arc::new(launcher))
    }

    /// Executor settings.
    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Next server address from the rotating port range.
    pub fn allocate_endpoint(&self) -> Endpoint {
        let span = usize::from(self.settings.port_span.max(1));
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
        Endpoint::new(
            self.settings.host.clone(),
            self.settings.base_port.saturating_add(offset as u16),
        )
    }

    /// Whether a step list goes out as one `/ai-batch` call.
    ///
    /// Lists that capture output variables always run step by step.
    pub fn should_batch(&self, steps: &[Step]) -> bool {
        self.settings.batching_enabled
            && steps.len() > self.settings.batch_threshold
            && steps.iter().all(|s| s.output_variable.is_none())
    }

    /// Start a server, run every step, and clean up.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        profile: &RunProfile,
        heartbeat: Option<&dyn Heartbeat>,
    ) -> Result<ExecutionResult> {
        let id = request.execution_id;
        let mut state = ExecutorState::Init;
        let endpoint = self.allocate_endpoint();
        let spec = LaunchSpec {
            endpoint: endpoint.clone(),
            headless: request.mode.is_headless(),
            memory_cap_mb: profile.memory_cap_mb,
            optimization: profile.optimization.clone(),
            ai: self.settings.ai.clone(),
        };

        info!(
            "Executing {} ({}) - {} steps, {} mode, {} run on {}",
            request.testcase.name,
            id,
            request.testcase.steps.len(),
            request.mode,
            profile.execution_type,
            endpoint
        );

        advance(&mut state, ExecutorState::ServerStarting, &id);
        let mut process = match self.launcher.launch(&spec).await {
            Ok(process) => process,
            Err(e) => {
                advance(&mut state, ExecutorState::Failed, &id);
                warn!("Automation server for {} did not start: {}", id, e);
                return Err(e);
            }
        };

        let outcome = self
            .drive(&endpoint, request, profile, heartbeat, &mut state)
            .await;

        advance(&mut state, ExecutorState::Cleanup, &id);
        self.cleanup(&endpoint, process.as_mut()).await;

        match &outcome {
            Ok(result) => {
                advance(&mut state, ExecutorState::Done, &id);
                info!(
                    "Execution {} finished: {}/{} steps passed",
                    id, result.success_count, result.total_count
                );
            }
            Err(e) => {
                advance(&mut state, ExecutorState::Failed, &id);
                warn!("Execution {} failed: {}", id, e);
            }
        }
        outcome
    }

    async fn drive(
        &self,
        endpoint: &Endpoint,
        request: &ExecutionRequest,
        profile: &RunProfile,
        heartbeat: Option<&dyn Heartbeat>,
        state: &mut ExecutorState,
    ) -> Result<ExecutionResult> {
        let id = request.execution_id;
        tokio::time::sleep(Duration::from_millis(self.settings.startup_grace_ms)).await;
        self.check_health(endpoint).await?;
        advance(state, ExecutorState::ServerReady, &id);

        let mut result = ExecutionResult::started(
            id,
            request.testcase.name.clone(),
            request.mode,
            profile.execution_type,
        );
        advance(state, ExecutorState::Running, &id);

        let steps = &request.testcase.steps;
        let step_loop = async {
            if self.should_batch(steps) {
                self.run_batch(endpoint, steps, profile, heartbeat, &mut result)
                    .await
            } else {
                self.run_sequential(endpoint, steps, profile, heartbeat, &mut result)
                    .await
            }
        };
        tokio::time::timeout(profile.time_limit, step_loop)
            .await
            .map_err(|_| ExecutorError::TimedOut(profile.time_limit))?;

        result.complete();
        Ok(result)
    }

    async fn check_health(&self, endpoint: &Endpoint) -> Result<()> {
        match self.api.health(endpoint).await {
            Ok(reply) if reply.is_healthy() => {
                info!("Automation server on {} is healthy", endpoint);
                Ok(())
            }
            Ok(reply) => Err(ExecutorError::HealthCheck(format!(
                "server on {} reported status {}",
                endpoint, reply.status
            ))),
            Err(e) => Err(ExecutorError::HealthCheck(e.to_string())),
        }
    }

    async fn run_sequential(
        &self,
        endpoint: &Endpoint,
        steps: &[Step],
        profile: &RunProfile,
        heartbeat: Option<&dyn Heartbeat>,
        result: &mut ExecutionResult,
    ) {
        let mut vars = HashMap::new();
        let delay = profile.optimization.step_delay();

        for (index, step) in steps.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let step_result = self.run_step(endpoint, step, profile, heartbeat, &mut vars).await;
            log_step(index, step, &step_result);
            result.record_step(step_result);

            if let Some(heartbeat) = heartbeat {
                heartbeat.beat();
            }
        }
    }

    async fn run_step(
        &self,
        endpoint: &Endpoint,
        step: &Step,
        profile: &RunProfile,
        heartbeat: Option<&dyn Heartbeat>,
        vars: &mut HashMap<String, String>,
    ) -> StepResult {
        let request = match build_action(step, vars) {
            Ok(request) => request,
            Err(message) => return StepResult::failed(&step.action, step.label(), message),
        };

        let call = self.api.action(endpoint, &request);
        match keep_alive(call, heartbeat, profile.keepalive).await {
            Ok(reply) => {
                if reply.success {
                    if let (Some(name), Some(value)) = (&step.output_variable, reply.result_text()) {
                        debug!("Captured ${{{}}} = {}", name, value);
                        vars.insert(name.clone(), value);
                    }
                }
                step_from_reply(step, reply, &profile.optimization)
            }
            Err(e) => StepResult::failed(&step.action, step.label(), e.to_string()),
        }
    }

    async fn run_batch(
        &self,
        endpoint: &Endpoint,
        steps: &[Step],
        profile: &RunProfile,
        heartbeat: Option<&dyn Heartbeat>,
        result: &mut ExecutionResult,
    ) {
        let vars = HashMap::new();
        let mut outcomes: Vec<Option<StepResult>> = vec![None; steps.len()];
        let mut actions = Vec::with_capacity(steps.len());
        let mut slots = Vec::with_capacity(steps.len());

        for (index, step) in steps.iter().enumerate() {
            match build_action(step, &vars) {
                Ok(action) => {
                    actions.push(action);
                    slots.push(index);
                }
                Err(message) => {
                    outcomes[index] = Some(StepResult::failed(&step.action, step.label(), message))
                }
            }
        }

        if !actions.is_empty() {
            info!("Sending {} steps as one batch to {}", actions.len(), endpoint);
            let call = self.api.batch(endpoint, &actions);
            match keep_alive(call, heartbeat, profile.keepalive).await {
                Ok(reply) => {
                    let batch_error = reply
                        .error
                        .clone()
                        .unwrap_or_else(|| "missing batch result".to_string());
                    let mut replies = reply.results.into_iter();
                    for &index in &slots {
                        let step = &steps[index];
                        outcomes[index] = Some(match replies.next() {
                            Some(reply) => step_from_reply(step, reply, &profile.optimization),
                            None => StepResult::failed(&step.action, step.label(), &batch_error),
                        });
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    for &index in &slots {
                        let step = &steps[index];
                        outcomes[index] =
                            Some(StepResult::failed(&step.action, step.label(), &message));
                    }
                }
            }
        }

        for (index, (step, outcome)) in steps.iter().zip(outcomes).enumerate() {
            let step_result = outcome
                .unwrap_or_else(|| StepResult::failed(&step.action, step.label(), "step not run"));
            log_step(index, step, &step_result);
            result.record_step(step_result);
        }

        if let Some(heartbeat) = heartbeat {
            heartbeat.beat();
        }
    }

    async fn cleanup(&self, endpoint: &Endpoint, process: &mut dyn ServerProcess) {
        if let Err(e) = self.api.cleanup(endpoint).await {
            debug!("Remote cleanup on {} failed: {}", endpoint, e);
        }

        let grace = Duration::from_secs(self.settings.cleanup_grace_secs);
        if let Err(e) = process.terminate(grace).await {
            warn!(
                "Failed to stop automation server {:?} on {}: {}",
                process.id(),
                endpoint,
                e
            );
        }
    }
}

#[async_trait]
impl TestRunner for CloudExecutor {
    async fn run(
        &self,
        request: &ExecutionRequest,
        profile: &RunProfile,
        heartbeat: Option<&dyn Heartbeat>,
    ) -> Result<ExecutionResult> {
        self.execute(request, profile, heartbeat).await
    }
}

/// Await a control request, beating `heartbeat` every `every` until it returns.
async fn keep_alive<F: Future>(
    call: F,
    heartbeat: Option<&dyn Heartbeat>,
    every: Duration,
) -> F::Output {
    let Some(heartbeat) = heartbeat else {
        return call.await;
    };
    tokio::pin!(call);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            output = &mut call => return output,
            _ = ticker.tick() => heartbeat.beat(),
        }
    }
}

fn advance(state: &mut ExecutorState, next: ExecutorState, id: &impl fmt::Display) {
    debug!("Execution {}: {} -> {}", id, state, next);
    *state = next;
}

fn log_step(index: usize, step: &Step, result: &StepResult) {
    if !result.success {
        warn!(
            "Step {} ({}) failed: {}",
            index + 1,
            step.label(),
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
}

fn step_from_reply(step: &Step, reply: ActionReply, optimization: &OptimizationConfig) -> StepResult {
    let mut result = if reply.success {
        StepResult::passed(&step.action, step.label())
    } else {
        let error = reply
            .error
            .clone()
            .unwrap_or_else(|| "action failed".to_string());
        StepResult::failed(&step.action, step.label(), error)
    };
    result.ai_response = reply.result_text();
    if optimization.capture_screenshots() {
        result.screenshot = reply.screenshot();
    }
    result
}

/// Map a declarative step onto a control API action.
fn build_action(
    step: &Step,
    vars: &HashMap<String, String>,
) -> std::result::Result<ActionRequest, String> {
    let params: Map<String, Value> = step
        .params
        .iter()
        .map(|(k, v)| (k.clone(), substitute(v, vars)))
        .collect();

    let text = |key: &str| {
        params
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let required = |key: &str| {
        text(key).ok_or_else(|| format!("{} requires parameter '{}'", step.action, key))
    };
    let prompt = || {
        text("prompt")
            .or_else(|| (!step.description.is_empty()).then(|| step.description.clone()))
            .ok_or_else(|| format!("{} requires a prompt", step.action))
    };

    let kind = step.kind();
    let mut out = Map::new();
    match kind {
        StepAction::Navigate => {
            out.insert("url".into(), required("url")?.into());
        }
        StepAction::AiInput => {
            let value = required("text")?;
            let locate = required("locate")?;
            out.insert(
                "prompt".into(),
                format!("Type \"{}\" into {}", value, locate).into(),
            );
            out.insert("text".into(), value.into());
            out.insert("locate".into(), locate.into());
        }
        StepAction::AiTap | StepAction::AiAssert | StepAction::AiQuery | StepAction::AiAction => {
            out.insert("prompt".into(), prompt()?.into());
        }
        StepAction::AiWaitFor => {
            out.insert("prompt".into(), prompt()?.into());
            let timeout = params
                .get("timeout")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
            out.insert("timeout".into(), timeout.into());
        }
        StepAction::Unknown => return Err(format!("unsupported action: {}", step.action)),
    }

    Ok(ActionRequest {
        action: kind.as_str().to_string(),
        params: out,
    })
}

fn placeholder_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{(\w+)\}").ok())
        .as_ref()
}

/// Replace `${name}` references with captured values; unknown names stay as is.
fn substitute(value: &Value, vars: &HashMap<String, String>) -> Value {
    match value {
        Value::String(text) => Value::String(substitute_text(text, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_text(text: &str, vars: &HashMap<String, String>) -> String {
    if vars.is_empty() || !text.contains("${") {
        return text.to_string();
    }
    match placeholder_pattern() {
        Some(pattern) => pattern
            .replace_all(text, |caps: &Captures| {
                vars.get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned(),
        None => text.to_string(),
    }
}
