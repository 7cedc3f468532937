use super::super::json::JsonQueue;
use super::wait_for_change;
use crate::communication::queue::{AckToken, MessageId, RawQueue, RawQueueMessage};
use crate::BoxedError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::lock::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

const ATTRIBUTE_RECEIVE_COUNT: &str = "ApproximateReceiveCount";
const ATTRIBUTE_SENT_TIMESTAMP: &str = "SentTimestamp";

#[derive(Clone)]
struct StoredMessage {
    id: MessageId,
    body: String,
    sent_at: DateTime<Utc>,
    receive_count: u32,
    custom_attributes: HashMap<String, String>,
}

impl StoredMessage {
    fn to_raw(&self, token: &str) -> RawQueueMessage {
        let mut attributes = HashMap::new();
        attributes.insert(
            ATTRIBUTE_RECEIVE_COUNT.to_owned(),
            self.receive_count.to_string(),
        );
        attributes.insert(
            ATTRIBUTE_SENT_TIMESTAMP.to_owned(),
            self.sent_at.timestamp_millis().to_string(),
        );

        RawQueueMessage {
            id: self.id.clone(),
            body: self.body.clone(),
            ack_token: AckToken::new(token),
            attributes,
            custom_attributes: self.custom_attributes.clone(),
        }
    }
}

struct InFlight {
    message: StoredMessage,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    visible: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlight>,
}

impl QueueState {
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, delivery)| delivery.deadline <= now)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(delivery) = self.in_flight.remove(&token) {
                self.visible.push_back(delivery.message);
            }
        }
    }

    fn deliver(&mut self, max_count: usize, visibility: Duration) -> Vec<RawQueueMessage> {
        let count = max_count.min(self.visible.len());
        let deadline = Instant::now() + visibility;
        let mut delivered = Vec::with_capacity(count);

        for mut message in self.visible.drain(..count).collect::<Vec<_>>() {
            message.receive_count += 1;

            let token = Uuid::new_v4().to_string();
            delivered.push(message.to_raw(&token));
            self.in_flight.insert(token, InFlight { message, deadline });
        }

        delivered
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    arrivals: Notify,
    visibility_timeout: Duration,
}

/// In-process queue with visibility timeout semantics
///
/// Received messages stay invisible until they are deleted or their visibility timeout
/// expires, at which point they are handed out again with a fresh [`AckToken`].
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<QueueInner>,
}

impl MemoryQueue {
    /// Creates an empty queue
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                arrivals: Notify::new(),
                visibility_timeout,
            }),
        }
    }

    /// Enqueues a body with producer assigned attributes
    pub async fn send_with_attributes(
        &self,
        body: &str,
        custom_attributes: HashMap<String, String>,
    ) -> MessageId {
        let id = MessageId::new(Uuid::new_v4().to_string());

        self.inner
            .state
            .lock()
            .await
            .visible
            .push_back(StoredMessage {
                id: id.clone(),
                body: body.to_owned(),
                sent_at: Utc::now(),
                receive_count: 0,
                custom_attributes,
            });

        self.inner.arrivals.notify_waiters();

        id
    }

    /// Number of deliveries that have neither been deleted nor expired
    pub async fn in_flight(&self) -> usize {
        self.inner.state.lock().await.in_flight.len()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl RawQueue for MemoryQueue {
    async fn receive_raw(
        &self,
        max_count: usize,
        wait: Duration,
    ) -> Result<Vec<RawQueueMessage>, BoxedError> {
        let deadline = Instant::now() + wait;

        loop {
            {
                let mut state = self.inner.state.lock().await;
                state.requeue_expired(Instant::now());

                let messages = state.deliver(max_count, self.inner.visibility_timeout);
                if !messages.is_empty() {
                    return Ok(messages);
                }
            }

            if !wait_for_change(&self.inner.arrivals, deadline).await {
                return Ok(Vec::new());
            }
        }
    }

    async fn delete_raw(&self, token: &AckToken) -> Result<bool, BoxedError> {
        let mut state = self.inner.state.lock().await;
        Ok(state.in_flight.remove(token.as_str()).is_some())
    }

    async fn send_raw(&self, body: &str) -> Result<MessageId, BoxedError> {
        Ok(self.send_with_attributes(body, HashMap::new()).await)
    }

    async fn depth_raw(&self) -> Result<u64, BoxedError> {
        let state = self.inner.state.lock().await;
        Ok((state.visible.len() + state.in_flight.len()) as u64)
    }
}

impl JsonQueue for MemoryQueue {}
