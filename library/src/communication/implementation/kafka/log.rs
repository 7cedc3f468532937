use super::subscription::KafkaSubscription;
use super::KafkaSettings;
use crate::communication::log::{
    DeliveryReceipt, LogClient, LogError, LogRecord, LogSubscriber, LogSubscription,
    RecordPosition, TopicSpec,
};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use std::time::Duration;
use tokio::task::spawn_blocking;
use tracing::{debug, instrument};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Partitioned log backed by a Kafka cluster
pub struct KafkaLog {
    settings: KafkaSettings,
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
}

impl KafkaLog {
    /// Creates the producer and admin clients, no connection is established until first use
    pub fn new(settings: KafkaSettings) -> Result<Self, BoxedError> {
        let producer = settings.producer_config().create()?;
        let admin = settings.client_config().create()?;

        Ok(Self {
            settings,
            producer,
            admin,
        })
    }
}

#[async_trait]
impl LogClient for KafkaLog {
    #[instrument(skip(self))]
    async fn create_topic(&self, topic: &str, spec: &TopicSpec) -> EmptyResult {
        let partitions = i32::try_from(spec.partitions)?;
        let replication = i32::try_from(spec.replication)?;
        let new_topic = NewTopic::new(topic, partitions, TopicReplication::Fixed(replication));

        let results = self
            .admin
            .create_topics(&[new_topic], &AdminOptions::new())
            .await?;

        for result in results {
            match result {
                Ok(name) => debug!(topic = %name, "Created topic"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    return Err(LogError::TopicExists(name).into())
                }
                Err((name, code)) => {
                    return Err(LogError::Broker(format!("{}: {}", name, code)).into())
                }
            }
        }

        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<String>, BoxedError> {
        let producer = self.producer.clone();

        let metadata = spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, Timeout::After(METADATA_TIMEOUT))
        })
        .await??;

        let mut topics: Vec<String> = metadata
            .topics()
            .iter()
            .map(|topic| topic.name().to_owned())
            .filter(|name| !name.starts_with("__"))
            .collect();
        topics.sort();

        Ok(topics)
    }

    async fn send(&self, topic: &str, record: LogRecord) -> Result<DeliveryReceipt, BoxedError> {
        let mut kafka_record =
            FutureRecord::<str, [u8]>::to(topic).payload(record.value.as_slice());
        if let Some(key) = record.key.as_deref() {
            kafka_record = kafka_record.key(key);
        }

        let delivery = self
            .producer
            .send_result(kafka_record)
            .map_err(|(error, _)| error)?;

        // The delivery future resolves from within the delivery callback which runs during flush
        Ok(DeliveryReceipt::new(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => Ok(RecordPosition {
                    partition: partition.max(0) as u32,
                    offset: offset.to_string(),
                }),
                Ok(Err((error, _))) => Err(error.to_string()),
                Err(_) => Err("delivery report has been cancelled".to_owned()),
            }
        }))
    }

    #[instrument(skip(self))]
    async fn flush(&self, timeout: Duration) -> EmptyResult {
        let producer = self.producer.clone();
        spawn_blocking(move || producer.flush(Timeout::After(timeout))).await??;
        Ok(())
    }
}

#[async_trait]
impl LogSubscriber for KafkaLog {
    #[instrument(skip(self))]
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn LogSubscription + Send>, BoxedError> {
        let consumer: StreamConsumer = self.settings.consumer_config(group).create()?;
        consumer.subscribe(&[topic])?;

        Ok(Box::new(KafkaSubscription::new(consumer)))
    }
}
