//! Redis-backed work and completion queues
//!
//! Uses plain Redis lists, which is what the viralign workers speak:
//! - `RPUSH <work_queue> <payload>` to hand out work
//! - `BLPOP <work_queue>_return <timeout>` to collect completions
//!
//! Each popped element is removed, so every completion is seen exactly once
//! by the single coordinator consuming the return queue. Payloads are read
//! as raw bytes; anything that is not UTF-8 is decoded lossily rather than
//! failing the run.

use crate::config::{completion_queue_name, RedisAddr};
use crate::error::{QueueError, QueueResult};
use crate::queue::{CompletionSignal, CompletionSource, WorkQueue};

use redis::{Client, Commands, Connection};
use std::time::Duration;
use tracing::debug;

/// Smallest BLPOP timeout we send; Redis treats 0 as "block forever"
const MIN_BLPOP_SECS: f64 = 0.01;

/// Configuration for the Redis queues
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Redis connection URL
    pub url: String,
    /// Queue the workers pull from
    pub work_queue: String,
    /// Queue the workers answer on
    pub completion_queue: String,
}

impl RedisQueueConfig {
    /// Build config for a server address and work queue name
    pub fn new(addr: &RedisAddr, queue_name: &str) -> Self {
        Self {
            url: addr.to_url(),
            work_queue: queue_name.to_string(),
            completion_queue: completion_queue_name(queue_name),
        }
    }
}

/// Redis list queue pair for one pipeline run
pub struct RedisQueue {
    connection: Connection,
    config: RedisQueueConfig,
}

impl RedisQueue {
    /// Connect to the Redis server
    pub fn connect(config: RedisQueueConfig) -> QueueResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| QueueError::ConnectionFailed {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;

        let connection = client
            .get_connection()
            .map_err(|e| QueueError::ConnectionFailed {
                url: config.url.clone(),
                reason: e.to_string(),
            })?;

        debug!(url = %config.url, work = %config.work_queue, completion = %config.completion_queue, "Connected to Redis");

        Ok(Self { connection, config })
    }
}

fn signal_from_reply(queue: String, payload: Vec<u8>) -> CompletionSignal {
    CompletionSignal {
        queue,
        payload: String::from_utf8_lossy(&payload).into_owned(),
    }
}

impl WorkQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.config.work_queue
    }

    fn push(&mut self, payload: &str) -> QueueResult<()> {
        let _len: i64 = self.connection.rpush(&self.config.work_queue, payload)?;
        Ok(())
    }
}

impl CompletionSource for RedisQueue {
    fn name(&self) -> &str {
        &self.config.completion_queue
    }

    fn pop(&mut self, timeout: Duration) -> QueueResult<Option<CompletionSignal>> {
        let secs = timeout.as_secs_f64().max(MIN_BLPOP_SECS);

        let reply: Option<(String, Vec<u8>)> = redis::cmd("BLPOP")
            .arg(&self.config.completion_queue)
            .arg(secs)
            .query(&mut self.connection)?;

        Ok(reply.map(|(queue, payload)| signal_from_reply(queue, payload)))
    }

    fn discard_pending(&mut self) -> QueueResult<u64> {
        let (pending, _deleted): (u64, u64) = redis::pipe()
            .atomic()
            .llen(&self.config.completion_queue)
            .del(&self.config.completion_queue)
            .query(&mut self.connection)?;

        debug!(queue = %self.config.completion_queue, pending, "Cleared completion queue");
        Ok(pending)
    }
}
