use super::{
    partition_key, RedisFactory, RedisStreamError, STREAM_ID_ADDITIONS, STREAM_ID_HEAD,
    STREAM_ID_NEW,
};
use crate::communication::log::{
    ConsumedRecord, DeliveryNotifier, DeliveryReceipt, LogClient, LogError, LogRecord,
    LogSubscriber, LogSubscription, RecordPosition, TopicSpec,
};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::lock::Mutex;
use redis::aio::Connection;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

const TOPIC_REGISTRY_KEY: &str = "log.topics";
const FIELD_KEY: &str = "key";
const FIELD_VALUE: &str = "value";
const READ_BATCH_SIZE: usize = 64;

struct BufferedRecord {
    topic: String,
    partition: u32,
    record: LogRecord,
    notifier: DeliveryNotifier,
}

/// Partitioned log storing each partition of a topic in its own redis stream
///
/// Topic layouts are kept in a registry hash so that every instance agrees on the number
/// of partitions. Published records are buffered locally and written in a single pipeline
/// on [`flush`](LogClient::flush). Streams are capped at approximately `retention` entries.
pub struct RedisStreamLog {
    factory: RedisFactory,
    default_spec: TopicSpec,
    retention: usize,
    topics: Mutex<HashMap<String, TopicSpec>>,
    buffer: Mutex<Vec<BufferedRecord>>,
    next_partition: AtomicUsize,
}

impl RedisStreamLog {
    /// Creates a new instance which auto-creates unknown topics with the given layout
    pub fn new(factory: RedisFactory, default_spec: TopicSpec, retention: usize) -> Self {
        Self {
            factory,
            default_spec,
            retention,
            topics: Mutex::new(HashMap::new()),
            buffer: Mutex::new(Vec::new()),
            next_partition: AtomicUsize::new(0),
        }
    }

    /// Looks up the layout of a topic, registering it with the default layout if it is unknown
    async fn topic_spec(&self, topic: &str) -> Result<TopicSpec, BoxedError> {
        if let Some(spec) = self.topics.lock().await.get(topic) {
            return Ok(*spec);
        }

        let mut con = self.factory.shared().await?;
        let default = serde_json::to_string(&self.default_spec)?;

        // Another instance might register the topic concurrently, so read back whatever won
        con.hset_nx::<_, _, _, ()>(TOPIC_REGISTRY_KEY, topic, default)
            .await?;
        let stored: String = con.hget(TOPIC_REGISTRY_KEY, topic).await?;
        let spec: TopicSpec = serde_json::from_str(&stored)?;

        self.topics.lock().await.insert(topic.to_owned(), spec);

        Ok(spec)
    }

    fn select_partition(&self, key: Option<&str>, spec: &TopicSpec) -> u32 {
        match key {
            Some(key) => spec.partition_for(key),
            None => {
                let next = self.next_partition.fetch_add(1, Ordering::Relaxed);
                (next % spec.partitions.max(1) as usize) as u32
            }
        }
    }
}

#[async_trait]
impl LogClient for RedisStreamLog {
    #[instrument(skip(self))]
    async fn create_topic(&self, topic: &str, spec: &TopicSpec) -> EmptyResult {
        if spec.partitions == 0 {
            return Err(LogError::InvalidTopic {
                topic: topic.to_owned(),
                reason: "at least one partition is required".into(),
            }
            .into());
        }

        let mut con = self.factory.shared().await?;
        let serialized = serde_json::to_string(spec)?;

        let created: bool = con
            .hset_nx(TOPIC_REGISTRY_KEY, topic, serialized)
            .await?;

        if !created {
            return Err(LogError::TopicExists(topic.to_owned()).into());
        }

        // Replication is up to the redis deployment, the value is only recorded
        self.topics.lock().await.insert(topic.to_owned(), *spec);

        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<String>, BoxedError> {
        let mut con = self.factory.shared().await?;
        let mut topics: Vec<String> = con.hkeys(TOPIC_REGISTRY_KEY).await?;
        topics.sort();
        Ok(topics)
    }

    async fn send(&self, topic: &str, record: LogRecord) -> Result<DeliveryReceipt, BoxedError> {
        let spec = self.topic_spec(topic).await?;
        let partition = self.select_partition(record.key.as_deref(), &spec);
        let (notifier, receipt) = DeliveryReceipt::channel();

        self.buffer.lock().await.push(BufferedRecord {
            topic: topic.to_owned(),
            partition,
            record,
            notifier,
        });

        Ok(receipt)
    }

    #[instrument(skip(self))]
    async fn flush(&self, timeout: Duration) -> EmptyResult {
        let buffered: Vec<BufferedRecord> = self.buffer.lock().await.drain(..).collect();
        if buffered.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for entry in &buffered {
            let mut fields: Vec<(&str, &[u8])> = vec![(FIELD_VALUE, entry.record.value.as_slice())];
            if let Some(key) = &entry.record.key {
                fields.push((FIELD_KEY, key.as_bytes()));
            }

            pipe.xadd_maxlen(
                partition_key(&entry.topic, entry.partition),
                StreamMaxlen::Approx(self.retention),
                STREAM_ID_NEW,
                fields.as_slice(),
            );
        }

        // Dropping the notifiers on an early return marks the records as failed
        let mut con = self.factory.shared().await?;
        let result =
            tokio::time::timeout(timeout, pipe.query_async::<_, Vec<String>>(&mut con)).await;

        match result {
            Ok(Ok(ids)) => {
                trace!(count = ids.len(), "Flushed records");
                for (entry, id) in buffered.into_iter().zip(ids) {
                    entry.notifier.delivered(RecordPosition {
                        partition: entry.partition,
                        offset: id,
                    });
                }
                Ok(())
            }
            Ok(Err(error)) => {
                for entry in buffered {
                    entry.notifier.failed(error.to_string());
                }
                Err(error.into())
            }
            Err(_) => {
                for entry in buffered {
                    entry.notifier.failed("flush timed out");
                }
                Err(LogError::FlushTimeout(timeout).into())
            }
        }
    }
}

#[async_trait]
impl LogSubscriber for RedisStreamLog {
    #[instrument(skip(self))]
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn LogSubscription + Send>, BoxedError> {
        let spec = self.topic_spec(topic).await?;
        let keys: Vec<String> = (0..spec.partitions.max(1))
            .map(|partition| partition_key(topic, partition))
            .collect();

        let mut con = self.factory.shared().await?;
        for key in &keys {
            // Fails if the group already exists which is fine
            con.xgroup_create_mkstream::<_, _, _, ()>(key, group, STREAM_ID_HEAD)
                .await
                .ok();
        }

        let reader = self.factory.owned().await?;
        debug!(partitions = keys.len(), "Joined consumer group");

        Ok(Box::new(RedisStreamSubscription {
            factory: self.factory.clone(),
            reader,
            group: group.to_owned(),
            partitions: PartitionCursors::new(topic, keys),
            buffer: VecDeque::new(),
        }))
    }
}

/// Read position of a consumer within each partition of a topic
///
/// Entries that were delivered to this consumer before but never acknowledged (e.g. after a
/// crash) are read first, afterwards only new entries are requested.
struct PartitionCursors {
    topic: String,
    keys: Vec<String>,
    cursors: Vec<String>,
}

impl PartitionCursors {
    fn new(topic: &str, keys: Vec<String>) -> Self {
        Self {
            topic: topic.to_owned(),
            cursors: vec![STREAM_ID_HEAD.to_owned(); keys.len()],
            keys,
        }
    }

    fn only_new(&self) -> bool {
        self.cursors.iter().all(|c| c == STREAM_ID_ADDITIONS)
    }

    fn ingest(&mut self, reply: StreamReadReply) -> Vec<ConsumedRecord> {
        let mut backlog = HashSet::new();
        let mut records = Vec::new();

        for stream in reply.keys {
            let partition = match self.keys.iter().position(|key| *key == stream.key) {
                Some(partition) => partition,
                None => continue,
            };

            if self.cursors[partition] != STREAM_ID_ADDITIONS {
                if let Some(last) = stream.ids.last() {
                    self.cursors[partition] = last.id.clone();
                    backlog.insert(partition);
                }
            }

            for entry in stream.ids {
                records.push(ConsumedRecord {
                    topic: self.topic.clone(),
                    partition: partition as u32,
                    key: entry.get(FIELD_KEY),
                    value: entry.get(FIELD_VALUE).unwrap_or_default(),
                    offset: entry.id,
                });
            }
        }

        // Partitions without further backlog switch over to new entries
        for (partition, cursor) in self.cursors.iter_mut().enumerate() {
            if !backlog.contains(&partition) {
                *cursor = STREAM_ID_ADDITIONS.to_owned();
            }
        }

        records
    }
}

struct RedisStreamSubscription {
    factory: RedisFactory,
    reader: Connection,
    group: String,
    partitions: PartitionCursors,
    buffer: VecDeque<ConsumedRecord>,
}

impl RedisStreamSubscription {
    fn read_options(&self, timeout: Duration) -> StreamReadOptions {
        // The consumer name equals the group so a restarted reader picks up its pending entries
        let options = StreamReadOptions::default()
            .group(&self.group, &self.group)
            .count(READ_BATCH_SIZE);

        let block: usize = timeout.as_millis().try_into().unwrap_or(usize::MAX);

        // A block duration of zero would block indefinitely
        if self.partitions.only_new() && block > 0 {
            options.block(block)
        } else {
            options
        }
    }
}

#[async_trait]
impl LogSubscription for RedisStreamSubscription {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>, BoxedError> {
        if let Some(record) = self.buffer.pop_front() {
            return Ok(Some(record));
        }

        let options = self.read_options(timeout);
        let result = self
            .reader
            .xread_options::<_, _, Option<StreamReadReply>>(
                self.partitions.keys.as_slice(),
                self.partitions.cursors.as_slice(),
                &options,
            )
            .await;

        match result {
            Ok(Some(reply)) => {
                let records = self.partitions.ingest(reply);
                self.buffer.extend(records);
            }
            Ok(None) => {}
            Err(error) => {
                warn!(%error, "Reading from partitions failed, reconnecting");
                if let Ok(reader) = self.factory.owned().await {
                    self.reader = reader;
                }
                return Err(error.into());
            }
        }

        Ok(self.buffer.pop_front())
    }

    async fn commit(&mut self, record: &ConsumedRecord) -> EmptyResult {
        let key = self
            .partitions
            .keys
            .get(record.partition as usize)
            .ok_or_else(|| {
                RedisStreamError::UnknownPartition(record.topic.clone(), record.partition)
            })?;

        let mut con = self.factory.shared().await?;
        con.xack::<_, _, _, ()>(key, &self.group, &[&record.offset])
            .await?;

        Ok(())
    }
}
