//! In-process queue on a crossbeam channel
//!
//! Implements both queue traits so a whole pipeline run can be driven
//! without a Redis server. Producer handles can be cloned onto other threads
//! to play the part of the worker pool.

use crate::error::{QueueError, QueueResult};
use crate::queue::{CompletionSignal, CompletionSource, WorkQueue};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Cloneable producer handle for a [`MemoryQueue`]
#[derive(Clone)]
pub struct MemorySender {
    sender: Sender<String>,
}

impl MemorySender {
    /// Push a payload; returns false if the queue has been dropped
    pub fn send(&self, payload: impl Into<String>) -> bool {
        self.sender.send(payload.into()).is_ok()
    }
}

/// Unbounded FIFO queue
pub struct MemoryQueue {
    name: String,
    sender: Option<Sender<String>>,
    receiver: Receiver<String>,
    pushed: u64,
    popped: u64,
}

impl MemoryQueue {
    /// Create an empty queue
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            name: name.into(),
            sender: Some(sender),
            receiver,
            pushed: 0,
            popped: 0,
        }
    }

    /// Get a producer handle (clone for each producer thread)
    pub fn sender(&self) -> MemorySender {
        MemorySender {
            sender: self
                .sender
                .clone()
                .unwrap_or_else(|| unbounded().0),
        }
    }

    /// Drop the queue's own producer so it disconnects once every
    /// [`MemorySender`] is gone
    pub fn close(&mut self) {
        self.sender = None;
    }

    /// Remove and return everything currently queued
    pub fn drain(&mut self) -> Vec<String> {
        let items: Vec<String> = self.receiver.try_iter().collect();
        self.popped += items.len() as u64;
        items
    }

    /// Current queue length
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Payloads pushed through [`WorkQueue::push`]
    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Payloads taken off the queue
    pub fn popped(&self) -> u64 {
        self.popped
    }
}

impl WorkQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(&mut self, payload: &str) -> QueueResult<()> {
        let sender = self.sender.as_ref().ok_or_else(|| QueueError::Disconnected {
            name: self.name.clone(),
        })?;
        sender
            .send(payload.to_string())
            .map_err(|_| QueueError::Disconnected {
                name: self.name.clone(),
            })?;
        self.pushed += 1;
        Ok(())
    }
}

impl CompletionSource for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn pop(&mut self, timeout: Duration) -> QueueResult<Option<CompletionSignal>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(payload) => {
                self.popped += 1;
                Ok(Some(CompletionSignal::new(self.name.clone(), payload)))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::Disconnected {
                name: self.name.clone(),
            }),
        }
    }

    fn discard_pending(&mut self) -> QueueResult<u64> {
        Ok(self.drain().len() as u64)
    }
}
