//! Queue module for work distribution and completion signalling
//!
//! The coordinator is the only producer on the work queue and the only
//! consumer of the completion queue for a run. Both sides are expressed as
//! small traits so the barrier can run against Redis in production and an
//! in-memory channel in tests.

mod memory;
mod redis_queue;

pub use memory::{MemoryQueue, MemorySender};
pub use redis_queue::{RedisQueue, RedisQueueConfig};

use crate::error::QueueResult;
use std::time::Duration;

/// One message popped from the completion queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSignal {
    /// Queue the message came from
    pub queue: String,
    /// Raw payload (usually the finished chunk's object name)
    pub payload: String,
}

impl CompletionSignal {
    pub fn new(queue: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            payload: payload.into(),
        }
    }
}

/// Producer side: where work descriptors go
pub trait WorkQueue {
    /// Queue name, for logging
    fn name(&self) -> &str;

    /// Append a payload to the tail of the queue
    fn push(&mut self, payload: &str) -> QueueResult<()>;
}

/// Consumer side: where completion signals come from
pub trait CompletionSource {
    /// Queue name, for logging
    fn name(&self) -> &str;

    /// Pop the head of the queue, blocking up to `timeout`
    ///
    /// Returns `Ok(None)` when nothing arrived in time. A popped message is
    /// removed from the queue.
    fn pop(&mut self, timeout: Duration) -> QueueResult<Option<CompletionSignal>>;

    /// Remove every signal currently queued, returning how many there were
    fn discard_pending(&mut self) -> QueueResult<u64>;
}
