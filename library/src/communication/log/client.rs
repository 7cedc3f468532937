use super::{DeliveryReceipt, LogRecord, TopicSpec};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Buffered access to a partitioned log
#[async_trait]
pub trait LogClient {
    /// Creates a topic, failing if it already exists or the broker refuses
    async fn create_topic(&self, topic: &str, spec: &TopicSpec) -> EmptyResult;

    /// Lists the names of all known topics
    async fn list_topics(&self) -> Result<Vec<String>, BoxedError>;

    /// Hands a record to the local send buffer
    ///
    /// Acceptance into the buffer says nothing about durability. The returned receipt
    /// reports the outcome once [`flush`](LogClient::flush) has been called.
    async fn send(&self, topic: &str, record: LogRecord) -> Result<DeliveryReceipt, BoxedError>;

    /// Blocks until every buffered record has been confirmed or the timeout elapses
    async fn flush(&self, timeout: Duration) -> EmptyResult;

    /// Makes sure a topic exists, creating it with the given layout if necessary
    ///
    /// Failures are logged and swallowed as the topic may be auto-created
    /// by the first publish or concurrently by another instance.
    #[instrument(skip(self))]
    async fn ensure_topic(&self, topic: &str, spec: &TopicSpec) {
        match self.list_topics().await {
            Ok(topics) if topics.iter().any(|t| t == topic) => {
                debug!("Topic already exists");
                return;
            }
            Ok(_) => {}
            Err(error) => warn!(%error, "Unable to list topics, attempting creation anyway"),
        }

        match self.create_topic(topic, spec).await {
            Ok(()) => debug!("Created topic"),
            Err(error) => warn!(%error, "Failed to create topic"),
        }
    }
}

/// Log client which can be shared between tasks
pub type SharedLog = Arc<dyn LogClient + Send + Sync>;
