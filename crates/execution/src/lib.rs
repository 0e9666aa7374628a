//! Execution orchestration - queueing, result caching, fallback and dispatch.

#![warn(missing_docs)]

pub mod queue;
pub mod cache;
pub mod fallback;
pub mod manager;

pub use queue::{ExecutionQueue, ProcessingGuard, QueueStatus};
pub use cache::{CacheEntry, CacheKey, CacheStats, ExecutionCache};
pub use fallback::{FallbackService, FallbackStats, StrategyDecision};
pub use manager::{
    ExecutionManager, ManagerStats, ResultCallback, StatusReport, SubmitReceipt,
    NO_RUNTIME_REASON, QUEUE_FULL_REASON,
};
