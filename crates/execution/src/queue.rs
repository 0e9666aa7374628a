//! Bounded FIFO of executions waiting for resources.

use chrono::Utc;
use parking_lot::Mutex;
use probekit_core::{ExecutionId, ExecutionRequest, QueueSettings, Time};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Queue occupancy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Requests waiting
    pub size: usize,
    /// Capacity
    pub max_size: usize,
    /// A consumer is currently draining
    pub processing: bool,
    /// Rough wait for a new arrival
    pub estimated_wait_secs: u64,
}

/// Bounded FIFO queue. A full queue rejects; nothing is evicted.
pub struct ExecutionQueue {
    items: Mutex<VecDeque<ExecutionRequest>>,
    max_size: usize,
    wait_per_item_secs: u64,
    processing: AtomicBool,
}

impl ExecutionQueue {
    /// Create a queue from settings.
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(settings.max_size)),
            max_size: settings.max_size,
            wait_per_item_secs: settings.wait_per_item_secs,
            processing: AtomicBool::new(false),
        }
    }

    /// Create a queue holding at most `max_size` items.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::new(&QueueSettings {
            max_size,
            ..Default::default()
        })
    }

    /// Append a request; false if the queue is full.
    pub fn enqueue(&self, request: ExecutionRequest) -> bool {
        self.try_enqueue(request).is_ok()
    }

    /// Append a request and return its 1-based position, or hand it back
    /// if the queue is full.
    pub fn try_enqueue(&self, mut request: ExecutionRequest) -> Result<usize, ExecutionRequest> {
        let mut items = self.items.lock();
        if items.len() >= self.max_size {
            warn!(
                "Execution queue full ({}/{}), rejecting {}",
                items.len(),
                self.max_size,
                request.execution_id
            );
            return Err(request);
        }

        request.queued_at.get_or_insert_with(Utc::now);
        info!(
            "Queued {} - {} (position {})",
            request.execution_id,
            request.testcase.name,
            items.len() + 1
        );
        items.push_back(request);
        Ok(items.len())
    }

    /// Pop the oldest request.
    pub fn dequeue(&self) -> Option<ExecutionRequest> {
        self.items.lock().pop_front()
    }

    /// Remove the oldest request, calling `on_take` before the queue lock
    /// is released so observers never see it in neither place.
    pub fn dequeue_with(&self, on_take: impl FnOnce(&ExecutionRequest)) -> Option<ExecutionRequest> {
        let mut items = self.items.lock();
        let request = items.pop_front()?;
        on_take(&request);
        Some(request)
    }

    /// 1-based position of a queued execution.
    pub fn position(&self, execution_id: &ExecutionId) -> Option<usize> {
        self.locate(execution_id).map(|(position, _)| position)
    }

    /// Position and enqueue time of a queued execution.
    pub fn locate(&self, execution_id: &ExecutionId) -> Option<(usize, Option<Time>)> {
        self.items
            .lock()
            .iter()
            .enumerate()
            .find(|(_, r)| &r.execution_id == execution_id)
            .map(|(index, r)| (index + 1, r.queued_at))
    }

    /// Requests waiting.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Capacity.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Current occupancy and a fixed-rate wait estimate.
    pub fn status(&self) -> QueueStatus {
        let size = self.len();
        QueueStatus {
            size,
            max_size: self.max_size,
            processing: self.is_processing(),
            estimated_wait_secs: size as u64 * self.wait_per_item_secs,
        }
    }

    /// Whether a consumer holds the processing marker.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Claim the single-consumer marker; `None` if already claimed.
    pub fn try_begin_processing(&self) -> Option<ProcessingGuard<'_>> {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ProcessingGuard { queue: self })
    }
}

/// Holds the queue's processing marker until dropped.
pub struct ProcessingGuard<'a> {
    queue: &'a ExecutionQueue,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.queue.processing.store(false, Ordering::Release);
    }
}
