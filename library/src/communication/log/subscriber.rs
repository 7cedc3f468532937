use super::ConsumedRecord;
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Open stream of records for one consumer group
#[async_trait]
pub trait LogSubscription {
    /// Waits up to `timeout` for the next record
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>, BoxedError>;

    /// Marks a record as processed for the consumer group
    async fn commit(&mut self, record: &ConsumedRecord) -> EmptyResult;
}

/// Allows joining a consumer group on a topic
///
/// Groups that have not consumed the topic before start at the earliest retained record.
#[async_trait]
pub trait LogSubscriber {
    /// Joins (or creates) the consumer group and returns a handle to read records with
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn LogSubscription + Send>, BoxedError>;
}

/// Subscriber which can be shared between tasks
pub type SharedSubscriber = Arc<dyn LogSubscriber + Send + Sync>;
