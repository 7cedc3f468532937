use crate::communication::log::{ConsumedRecord, LogSubscription};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use std::time::Duration;

/// Consumer group member committing offsets manually
pub(super) struct KafkaSubscription {
    consumer: StreamConsumer,
}

impl KafkaSubscription {
    pub(super) fn new(consumer: StreamConsumer) -> Self {
        Self { consumer }
    }
}

#[async_trait]
impl LogSubscription for KafkaSubscription {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>, BoxedError> {
        let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(message) => message?,
            Err(_) => return Ok(None),
        };

        Ok(Some(ConsumedRecord {
            topic: message.topic().to_owned(),
            partition: message.partition().max(0) as u32,
            offset: message.offset().to_string(),
            key: message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            value: message.payload().unwrap_or_default().to_vec(),
        }))
    }

    async fn commit(&mut self, record: &ConsumedRecord) -> EmptyResult {
        let offset: i64 = record.offset.parse()?;
        let mut partitions = TopicPartitionList::new();

        // Committed offsets point at the next record to read
        partitions.add_partition_offset(
            &record.topic,
            record.partition as i32,
            Offset::Offset(offset + 1),
        )?;
        self.consumer.commit(&partitions, CommitMode::Async)?;

        Ok(())
    }
}
