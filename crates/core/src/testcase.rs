//! Test case model - the declarative input consumed by the executor.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::id::ExecutionId;
use crate::Time;

/// A single declarative browser step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Action name (`navigate`, `ai_input`, `ai_tap`, ...)
    pub action: String,

    /// Action parameters
    #[serde(default)]
    pub params: Map<String, Value>,

    /// Human readable description
    #[serde(default)]
    pub description: String,

    /// Variable that captures this step's query result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
}

impl Step {
    /// Create a step with no parameters.
    pub fn new(action: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: Map::new(),
            description: description.into(),
            output_variable: None,
        }
    }

    /// Add a parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Capture the step result into a named variable.
    pub fn capture(mut self, variable: impl Into<String>) -> Self {
        self.output_variable = Some(variable.into());
        self
    }

    /// Parsed action kind.
    pub fn kind(&self) -> StepAction {
        self.action.parse().unwrap_or(StepAction::Unknown)
    }

    /// Description, or the action name when none was given.
    pub fn label(&self) -> &str {
        if self.description.is_empty() {
            &self.action
        } else {
            &self.description
        }
    }

    /// Get a string parameter.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Supported step actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Open a URL
    Navigate,
    /// Type into a field located by description
    AiInput,
    /// Click an element located by description
    AiTap,
    /// Check a natural-language assertion
    AiAssert,
    /// Extract data by description
    AiQuery,
    /// Wait until a condition holds
    AiWaitFor,
    /// Free-form instruction
    AiAction,
    /// Unrecognized action, the step fails
    Unknown,
}

impl StepAction {
    /// Wire name used on the control API.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::Navigate => "navigate",
            StepAction::AiInput => "ai_input",
            StepAction::AiTap => "ai_tap",
            StepAction::AiAssert => "ai_assert",
            StepAction::AiQuery => "ai_query",
            StepAction::AiWaitFor => "ai_wait_for",
            StepAction::AiAction => "ai_action",
            StepAction::Unknown => "unknown",
        }
    }
}

impl FromStr for StepAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "navigate" | "goto" => Ok(StepAction::Navigate),
            "ai_input" => Ok(StepAction::AiInput),
            "ai_tap" => Ok(StepAction::AiTap),
            "ai_assert" => Ok(StepAction::AiAssert),
            "ai_query" => Ok(StepAction::AiQuery),
            "ai_wait_for" => Ok(StepAction::AiWaitFor),
            "ai_action" | "ai" => Ok(StepAction::AiAction),
            other => Err(format!("unsupported action: {}", other)),
        }
    }
}

/// Browser mode requested for an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// No visible browser window
    #[default]
    Headless,
    /// Visible browser window
    Browser,
}

impl ExecutionMode {
    /// Whether the browser should run headless.
    pub fn is_headless(&self) -> bool {
        matches!(self, ExecutionMode::Headless)
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Headless => "headless",
            ExecutionMode::Browser => "browser",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "headless" => Ok(ExecutionMode::Headless),
            "browser" => Ok(ExecutionMode::Browser),
            other => Err(format!("unknown execution mode: {}", other)),
        }
    }
}

/// Step-count complexity bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// At most 3 steps
    Simple,
    /// At most 8 steps
    Medium,
    /// More than 8 steps
    Complex,
}

impl Complexity {
    /// Bucket a step count.
    pub fn from_step_count(count: usize) -> Self {
        match count {
            0..=3 => Complexity::Simple,
            4..=8 => Complexity::Medium,
            _ => Complexity::Complex,
        }
    }
}

/// A named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Test case name
    pub name: String,

    /// Ordered steps. Accepts a JSON array or a string holding one.
    #[serde(default, deserialize_with = "steps_from_list_or_string")]
    pub steps: Vec<Step>,
}

impl TestCase {
    /// Create a test case.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Complexity bucket of this test case.
    pub fn complexity(&self) -> Complexity {
        Complexity::from_step_count(self.steps.len())
    }
}

fn steps_from_list_or_string<'de, D>(deserializer: D) -> Result<Vec<Step>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Encoded {
        List(Vec<Step>),
        Text(String),
    }

    match Encoded::deserialize(deserializer)? {
        Encoded::List(steps) => Ok(steps),
        Encoded::Text(text) if text.trim().is_empty() => Ok(Vec::new()),
        Encoded::Text(text) => serde_json::from_str(&text).map_err(serde::de::Error::custom),
    }
}

/// A submitted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Execution identifier
    pub execution_id: ExecutionId,

    /// Test case to run
    pub testcase: TestCase,

    /// Browser mode
    pub mode: ExecutionMode,

    /// When the request entered the queue, if it did
    pub queued_at: Option<Time>,
}

impl ExecutionRequest {
    /// Create a request with a fresh id.
    pub fn new(testcase: TestCase, mode: ExecutionMode) -> Self {
        Self::with_id(ExecutionId::new(), testcase, mode)
    }

    /// Create a request with a known id.
    pub fn with_id(execution_id: ExecutionId, testcase: TestCase, mode: ExecutionMode) -> Self {
        Self {
            execution_id,
            testcase,
            mode,
            queued_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complexity_buckets() {
        assert_eq!(Complexity::from_step_count(0), Complexity::Simple);
        assert_eq!(Complexity::from_step_count(3), Complexity::Simple);
        assert_eq!(Complexity::from_step_count(4), Complexity::Medium);
        assert_eq!(Complexity::from_step_count(8), Complexity::Medium);
        assert_eq!(Complexity::from_step_count(9), Complexity::Complex);
    }

    #[test]
    fn test_testcase_steps_as_list() {
        let json = r#"{"name":"search","steps":[{"action":"navigate","params":{"url":"https://example.com"},"description":"open"}]}"#;
        let tc: TestCase = serde_json::from_str(json).unwrap();
        assert_eq!(tc.steps.len(), 1);
        assert_eq!(tc.steps[0].kind(), StepAction::Navigate);
        assert_eq!(tc.steps[0].str_param("url"), Some("https://example.com"));
    }

    #[test]
    fn test_testcase_steps_as_string() {
        let json = r#"{"name":"legacy","steps":"[{\"action\":\"ai_tap\",\"params\":{\"prompt\":\"login\"}}]"}"#;
        let tc: TestCase = serde_json::from_str(json).unwrap();
        assert_eq!(tc.steps.len(), 1);
        assert_eq!(tc.steps[0].kind(), StepAction::AiTap);
        assert_eq!(tc.steps[0].label(), "ai_tap");
    }

    #[test]
    fn test_testcase_missing_steps() {
        let tc: TestCase = serde_json::from_str(r#"{"name":"empty"}"#).unwrap();
        assert!(tc.steps.is_empty());
        let tc: TestCase = serde_json::from_str(r#"{"name":"empty","steps":""}"#).unwrap();
        assert!(tc.steps.is_empty());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("headless".parse::<ExecutionMode>().unwrap(), ExecutionMode::Headless);
        assert_eq!("Browser".parse::<ExecutionMode>().unwrap(), ExecutionMode::Browser);
        assert!("kiosk".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_unknown_action() {
        let step = Step::new("drag_and_drop", "");
        assert_eq!(step.kind(), StepAction::Unknown);
    }
}
