//! Serialization and deserialization provided by [`serde_json`]
//!
//! Transports only move opaque text and bytes around. This module lifts them to the structured
//! traits by providing blanket implementations: implementing the [`JsonQueue`] marker on top of a
//! [`RawQueue`] yields a [`QueueClient`], and every [`LogClient`] automatically becomes a
//! [`LogPublisher`] of serializable values.

use super::super::log::{DeliveryReceipt, LogClient, LogRecord};
use super::super::queue::{
    AckToken, MessageId, QueueClient, QueueMessage, RawQueue, MAX_RECEIVE_BATCH,
};
use crate::BoxedError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{error, instrument, trace, warn};

/// Marker trait providing a default [`QueueClient`] implementation based on [`serde_json`]
pub trait JsonQueue: RawQueue + Send + Sync {}

#[async_trait]
impl<Q> QueueClient for Q
where
    Q: JsonQueue,
{
    /// Parses bodies using [`serde_json::from_str`], wrapping anything unparsable
    #[instrument(skip(self))]
    async fn receive(&self, max_count: usize, wait: Duration) -> Vec<QueueMessage> {
        let max_count = max_count.min(MAX_RECEIVE_BATCH);
        if max_count == 0 {
            return Vec::new();
        }

        match self.receive_raw(max_count, wait).await {
            Ok(messages) => {
                trace!(count = messages.len(), "Received messages");
                messages
                    .into_iter()
                    .take(max_count)
                    .map(QueueMessage::from_raw)
                    .collect()
            }
            Err(error) => {
                error!(%error, "Failed to receive messages");
                Vec::new()
            }
        }
    }

    #[instrument(skip(self))]
    async fn acknowledge(&self, token: &AckToken) -> bool {
        match self.delete_raw(token).await {
            Ok(true) => true,
            Ok(false) => {
                warn!("Delivery is unknown or has expired");
                false
            }
            Err(error) => {
                error!(%error, "Failed to delete message");
                false
            }
        }
    }

    /// Serializes the body using [`serde_json::to_string`]
    #[instrument(err, skip(self, body))]
    async fn send(&self, body: &Value) -> Result<MessageId, BoxedError> {
        trace!("Serializing message body");
        let data = serde_json::to_string(body)?;
        self.send_raw(&data).await
    }

    async fn approximate_depth(&self) -> Result<u64, BoxedError> {
        self.depth_raw().await
    }
}

/// Publisher for serializable values
#[async_trait]
pub trait LogPublisher {
    /// Serializes the value and hands it to the send buffer of the topic
    ///
    /// Returns `None` if serialization or the hand-off failed. The error has already been logged.
    async fn publish<T: Serialize + Send + Sync>(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &T,
    ) -> Option<DeliveryReceipt>;
}

#[async_trait]
impl<L> LogPublisher for L
where
    L: LogClient + Send + Sync + ?Sized,
{
    /// Serializes the value using [`serde_json::to_vec`]
    #[instrument(skip(self, value), fields(value = std::any::type_name::<T>()))]
    async fn publish<T: Serialize + Send + Sync>(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &T,
    ) -> Option<DeliveryReceipt> {
        trace!("Serializing record");
        let data = match serde_json::to_vec(value) {
            Ok(data) => data,
            Err(error) => {
                error!(%error, "Failed to serialize record");
                return None;
            }
        };

        let record = LogRecord::new(key.map(str::to_owned), data);

        match self.send(topic, record).await {
            Ok(receipt) => Some(receipt),
            Err(error) => {
                error!(%error, "Failed to hand record to send buffer");
                None
            }
        }
    }
}
