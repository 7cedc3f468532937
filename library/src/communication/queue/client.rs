use super::{AckToken, MessageId, QueueMessage, RawQueueMessage};
use crate::BoxedError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Transport level access to a message queue
///
/// Implementations report every failure to the caller. The structured [`QueueClient`] on top
/// of it decides which failures are swallowed.
#[async_trait]
pub trait RawQueue {
    /// Waits up to `wait` for messages and returns at most `max_count` of them
    async fn receive_raw(
        &self,
        max_count: usize,
        wait: Duration,
    ) -> Result<Vec<RawQueueMessage>, BoxedError>;

    /// Deletes the delivery identified by the token
    ///
    /// Returns `Ok(false)` when the token is unknown or has expired.
    async fn delete_raw(&self, token: &AckToken) -> Result<bool, BoxedError>;

    /// Enqueues an opaque body
    async fn send_raw(&self, body: &str) -> Result<MessageId, BoxedError>;

    /// Number of messages held by the queue, including those currently in flight
    async fn depth_raw(&self) -> Result<u64, BoxedError>;
}

/// Queue operating on structured message bodies
///
/// Transient transport failures never surface from [`receive`](QueueClient::receive) or
/// [`acknowledge`](QueueClient::acknowledge). They are logged and reported as "nothing received"
/// or "could not confirm" respectively so that callers can simply poll again.
#[async_trait]
pub trait QueueClient {
    /// Long-polls for up to `wait` and returns at most `max_count` messages (capped at ten)
    async fn receive(&self, max_count: usize, wait: Duration) -> Vec<QueueMessage>;

    /// Deletes a delivery, returning whether the queue confirmed the deletion
    async fn acknowledge(&self, token: &AckToken) -> bool;

    /// Serializes and enqueues a body
    async fn send(&self, body: &Value) -> Result<MessageId, BoxedError>;

    /// Number of messages held by the queue, including those currently in flight
    async fn approximate_depth(&self) -> Result<u64, BoxedError>;
}

/// Queue client which can be shared between tasks
pub type SharedQueue = Arc<dyn QueueClient + Send + Sync>;
