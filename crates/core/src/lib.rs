//! probekit core data models.
//!
//! This crate defines the value types shared by the resource manager,
//! the browser executor and the execution orchestrator.

#![warn(missing_docs)]

// Identities
mod id;

// Test case input and execution output
mod testcase;
mod result;

// Resource pressure model
mod resource;

// Runtime configuration
pub mod config;

// Re-exports
pub use id::ExecutionId;

pub use testcase::{Complexity, ExecutionMode, ExecutionRequest, Step, StepAction, TestCase};
pub use result::{success_rate, ExecutionResult, ExecutionStatus, ExecutionType, StepResult};
pub use resource::{
    FallbackStrategy, Heartbeat, OptimizationConfig, PressureTier, ResourceSnapshot, Viewport,
};
pub use config::{
    AiSettings, CacheSettings, ConfigError, ExecutorSettings, ManagerSettings, QueueSettings,
    ResourceLimits, Settings, MAX_CACHE_TTL_HOURS, MAX_RETENTION_SECS,
};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
