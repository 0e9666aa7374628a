//! Execution results - what the orchestrator reports back to callers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::id::ExecutionId;
use crate::testcase::ExecutionMode;
use crate::Time;

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Currently executing
    Running,
    /// Finished (individual steps may still have failed)
    Completed,
    /// Aborted before producing step results
    Failed,
    /// Refused by the orchestrator
    Rejected,
    /// Waiting in the execution queue
    Queued,
}

impl ExecutionStatus {
    /// Whether no further transitions will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Rejected
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Rejected => write!(f, "rejected"),
            ExecutionStatus::Queued => write!(f, "queued"),
        }
    }
}

/// How an execution was (or will be) carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    /// Real browser automation, standard tier
    Full,
    /// Real browser automation with tightened limits
    Lightweight,
    /// Synthetic, always-succeeding execution
    Simulated,
    /// Deferred to the queue
    Queued,
    /// Refused
    Rejected,
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionType::Full => "full",
            ExecutionType::Lightweight => "lightweight",
            ExecutionType::Simulated => "simulated",
            ExecutionType::Queued => "queued",
            ExecutionType::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Whether the step passed
    pub success: bool,

    /// Action name
    pub action: String,

    /// Step description
    pub description: String,

    /// Screenshot (data URI or base64), if captured
    pub screenshot: Option<String>,

    /// AI model response text
    pub ai_response: Option<String>,

    /// Failure reason
    pub error: Option<String>,
}

impl StepResult {
    /// A passing step.
    pub fn passed(action: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            success: true,
            action: action.into(),
            description: description.into(),
            screenshot: None,
            ai_response: None,
            error: None,
        }
    }

    /// A failing step carrying its error.
    pub fn failed(
        action: impl Into<String>,
        description: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            action: action.into(),
            description: description.into(),
            screenshot: None,
            ai_response: None,
            error: Some(error.into()),
        }
    }
}

/// Aggregated result of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Execution this result belongs to
    pub execution_id: ExecutionId,
    /// Test case name
    pub name: String,
    /// Browser mode
    pub mode: ExecutionMode,
    /// Final status
    pub status: ExecutionStatus,
    /// Per-step outcomes in order
    pub steps: Vec<StepResult>,
    /// Passed steps
    pub success_count: usize,
    /// Steps attempted
    pub total_count: usize,
    /// Percentage of passed steps
    pub success_rate: f64,
    /// How the execution actually ran
    pub execution_type: ExecutionType,
    /// Why a weaker strategy was used
    pub fallback_reason: Option<String>,
    /// Error that aborted or refused the execution
    pub error: Option<String>,
    /// When the execution started
    pub start_time: Time,
    /// When it finished
    pub end_time: Option<Time>,
    /// Served from the result cache
    #[serde(default)]
    pub from_cache: bool,
    /// Ran after waiting in the queue
    #[serde(default)]
    pub from_queue: bool,
}

impl ExecutionResult {
    /// Start a running result.
    pub fn started(
        execution_id: ExecutionId,
        name: impl Into<String>,
        mode: ExecutionMode,
        execution_type: ExecutionType,
    ) -> Self {
        Self {
            execution_id,
            name: name.into(),
            mode,
            status: ExecutionStatus::Running,
            steps: Vec::new(),
            success_count: 0,
            total_count: 0,
            success_rate: 0.0,
            execution_type,
            fallback_reason: None,
            error: None,
            start_time: chrono::Utc::now(),
            end_time: None,
            from_cache: false,
            from_queue: false,
        }
    }

    /// A terminal result with no steps.
    pub fn terminal(
        execution_id: ExecutionId,
        name: impl Into<String>,
        mode: ExecutionMode,
        status: ExecutionStatus,
        execution_type: ExecutionType,
        error: impl Into<String>,
    ) -> Self {
        let mut result = Self::started(execution_id, name, mode, execution_type);
        result.status = status;
        result.error = Some(error.into());
        if status.is_terminal() {
            result.end_time = Some(chrono::Utc::now());
        }
        result
    }

    /// Append a step outcome.
    pub fn record_step(&mut self, step: StepResult) {
        if step.success {
            self.success_count += 1;
        }
        self.steps.push(step);
    }

    /// Mark completed and compute aggregates over all recorded steps.
    ///
    /// A zero-step execution has a vacuous success rate of 100.0.
    pub fn complete(&mut self) {
        self.total_count = self.steps.len();
        self.success_count = self.steps.iter().filter(|s| s.success).count();
        self.success_rate = success_rate(self.success_count, self.total_count);
        self.status = ExecutionStatus::Completed;
        self.end_time = Some(chrono::Utc::now());
    }

    /// Copy of this result re-addressed to another execution.
    pub fn reissued(&self, execution_id: ExecutionId) -> Self {
        let mut result = self.clone();
        result.execution_id = execution_id;
        result
    }
}

/// Percentage of passed steps; `100.0` when there were none.
pub fn success_rate(success_count: usize, total_count: usize) -> f64 {
    if total_count == 0 {
        100.0
    } else {
        success_count as f64 / total_count as f64 * 100.0
    }
}
