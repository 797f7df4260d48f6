/*!
 * # Message Queue
 *
 * Topic-based queue between the outbox relay and the workers that act on
 * relayed events (currently the invoice dispatcher).
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

/// Topic carrying invoice requests for confirmed orders
pub const INVOICE_TOPIC: &str = "invoices";

/// Message queue errors
#[derive(Error, Debug)]
pub enum MessageQueueError {
    #[error("Queue is full")]
    QueueFull,
    #[error("Queue state poisoned")]
    Poisoned,
}

/// Message envelope for queue items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            timestamp: chrono::Utc::now(),
            retry_count: 0,
            max_retries,
        }
    }

    /// Copy of this message for another delivery attempt
    pub fn retried(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            timestamp: chrono::Utc::now(),
            ..self.clone()
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError>;
    /// Pops the oldest message on `topic`, if any
    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError>;
}

/// Bounded in-process queue, one FIFO per topic
#[derive(Debug)]
pub struct InMemoryMessageQueue {
    queues: Mutex<HashMap<String, VecDeque<Message>>>,
    max_size: usize,
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::with_max_size(1000)
    }
}

impl InMemoryMessageQueue {
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            max_size,
        }
    }

    fn queues(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<String, VecDeque<Message>>>, MessageQueueError> {
        self.queues.lock().map_err(|_| MessageQueueError::Poisoned)
    }

    /// Number of messages waiting on `topic`
    pub fn len(&self, topic: &str) -> usize {
        self.queues()
            .map(|q| q.get(topic).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError> {
        let mut queues = self.queues()?;
        let queue = queues.entry(message.topic.clone()).or_default();

        if queue.len() >= self.max_size {
            return Err(MessageQueueError::QueueFull);
        }

        queue.push_back(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError> {
        let mut queues = self.queues()?;
        Ok(queues.get_mut(topic).and_then(VecDeque::pop_front))
    }
}
