use super::wait_for_change;
use crate::communication::log::{
    ConsumedRecord, DeliveryNotifier, DeliveryReceipt, LogClient, LogError, LogRecord,
    LogSubscriber, LogSubscription, RecordPosition, TopicSpec,
};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::lock::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct MemoryTopic {
    spec: TopicSpec,
    partitions: Vec<Vec<LogRecord>>,
}

impl MemoryTopic {
    fn new(spec: TopicSpec) -> Self {
        Self {
            spec,
            partitions: vec![Vec::new(); spec.partitions.max(1) as usize],
        }
    }
}

struct BufferedRecord {
    topic: String,
    partition: usize,
    record: LogRecord,
    notifier: DeliveryNotifier,
}

struct GroupOffsets {
    committed: Vec<usize>,
    delivered: Vec<usize>,
}

struct LogState {
    topics: HashMap<String, MemoryTopic>,
    buffer: Vec<BufferedRecord>,
    groups: HashMap<(String, String), GroupOffsets>,
    next_partition: usize,
    available: bool,
}

impl LogState {
    fn topic_or_create(&mut self, topic: &str, default_spec: TopicSpec) -> &mut MemoryTopic {
        self.topics
            .entry(topic.to_owned())
            .or_insert_with(|| MemoryTopic::new(default_spec))
    }

    fn select_partition(&mut self, key: Option<&str>, spec: TopicSpec) -> usize {
        match key {
            Some(key) => spec.partition_for(key) as usize,
            None => {
                let partition = self.next_partition % spec.partitions.max(1) as usize;
                self.next_partition = self.next_partition.wrapping_add(1);
                partition
            }
        }
    }
}

struct LogInner {
    state: Mutex<LogState>,
    appended: Notify,
    default_spec: TopicSpec,
}

/// In-process partitioned log
///
/// Published records are kept in a send buffer until [`flush`](LogClient::flush) is called,
/// mirroring the behaviour of networked producers. Topics are created on first use.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<LogInner>,
}

impl MemoryLog {
    /// Creates an empty log which auto-creates topics using the given layout
    pub fn new(default_spec: TopicSpec) -> Self {
        Self {
            inner: Arc::new(LogInner {
                state: Mutex::new(LogState {
                    topics: HashMap::new(),
                    buffer: Vec::new(),
                    groups: HashMap::new(),
                    next_partition: 0,
                    available: true,
                }),
                appended: Notify::new(),
                default_spec,
            }),
        }
    }

    /// Simulates an unreachable broker, failing every flush while set to `false`
    pub async fn set_available(&self, available: bool) {
        self.inner.state.lock().await.available = available;
    }

    /// All records stored in a topic, ordered by partition and offset
    pub async fn records(&self, topic: &str) -> Vec<LogRecord> {
        let state = self.inner.state.lock().await;

        state
            .topics
            .get(topic)
            .map(|t| t.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Records of a topic that have been sent but not yet flushed
    pub async fn buffered(&self) -> usize {
        self.inner.state.lock().await.buffer.len()
    }

    /// Layout of an existing topic
    pub async fn topic_spec(&self, topic: &str) -> Option<TopicSpec> {
        let state = self.inner.state.lock().await;
        state.topics.get(topic).map(|t| t.spec)
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(TopicSpec::default())
    }
}

#[async_trait]
impl LogClient for MemoryLog {
    async fn create_topic(&self, topic: &str, spec: &TopicSpec) -> EmptyResult {
        if spec.partitions == 0 {
            return Err(LogError::InvalidTopic {
                topic: topic.to_owned(),
                reason: "at least one partition is required".into(),
            }
            .into());
        }

        let mut state = self.inner.state.lock().await;
        if state.topics.contains_key(topic) {
            return Err(LogError::TopicExists(topic.to_owned()).into());
        }

        state
            .topics
            .insert(topic.to_owned(), MemoryTopic::new(*spec));

        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<String>, BoxedError> {
        let state = self.inner.state.lock().await;
        let mut topics: Vec<String> = state.topics.keys().cloned().collect();
        topics.sort();
        Ok(topics)
    }

    async fn send(&self, topic: &str, record: LogRecord) -> Result<DeliveryReceipt, BoxedError> {
        let mut state = self.inner.state.lock().await;

        let spec = state.topic_or_create(topic, self.inner.default_spec).spec;
        let partition = state.select_partition(record.key.as_deref(), spec);

        let (notifier, receipt) = DeliveryReceipt::channel();
        state.buffer.push(BufferedRecord {
            topic: topic.to_owned(),
            partition,
            record,
            notifier,
        });

        Ok(receipt)
    }

    async fn flush(&self, _timeout: Duration) -> EmptyResult {
        let mut state = self.inner.state.lock().await;
        let buffered: Vec<BufferedRecord> = state.buffer.drain(..).collect();

        if !state.available {
            for entry in buffered {
                entry.notifier.failed("broker unavailable");
            }

            return Err(LogError::Broker("broker unavailable".into()).into());
        }

        for entry in buffered {
            let default_spec = self.inner.default_spec;
            let partition = &mut state.topic_or_create(&entry.topic, default_spec).partitions
                [entry.partition];

            partition.push(entry.record);
            entry.notifier.delivered(RecordPosition {
                partition: entry.partition as u32,
                offset: (partition.len() - 1).to_string(),
            });
        }

        drop(state);
        self.inner.appended.notify_waiters();

        Ok(())
    }
}

#[async_trait]
impl LogSubscriber for MemoryLog {
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn LogSubscription + Send>, BoxedError> {
        let mut state = self.inner.state.lock().await;
        let partitions = state
            .topic_or_create(topic, self.inner.default_spec)
            .partitions
            .len();

        let offsets = state
            .groups
            .entry((topic.to_owned(), group.to_owned()))
            .or_insert_with(|| GroupOffsets {
                committed: vec![0; partitions],
                delivered: vec![0; partitions],
            });

        // Anything handed out but never committed is delivered again
        offsets.delivered = offsets.committed.clone();

        Ok(Box::new(MemorySubscription {
            log: self.clone(),
            topic: topic.to_owned(),
            group: group.to_owned(),
        }))
    }
}

struct MemorySubscription {
    log: MemoryLog,
    topic: String,
    group: String,
}

impl MemorySubscription {
    fn group_key(&self) -> (String, String) {
        (self.topic.clone(), self.group.clone())
    }

    async fn next_record(&self) -> Option<ConsumedRecord> {
        let mut guard = self.log.inner.state.lock().await;
        let state = &mut *guard;

        let topic = state.topics.get(&self.topic)?;
        let offsets = state.groups.get_mut(&self.group_key())?;

        for (partition, records) in topic.partitions.iter().enumerate() {
            let offset = offsets.delivered[partition];

            if let Some(record) = records.get(offset) {
                offsets.delivered[partition] += 1;

                return Some(ConsumedRecord {
                    topic: self.topic.clone(),
                    partition: partition as u32,
                    offset: offset.to_string(),
                    key: record.key.clone(),
                    value: record.value.clone(),
                });
            }
        }

        None
    }
}

#[async_trait]
impl LogSubscription for MemorySubscription {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>, BoxedError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(record) = self.next_record().await {
                return Ok(Some(record));
            }

            if !wait_for_change(&self.log.inner.appended, deadline).await {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, record: &ConsumedRecord) -> EmptyResult {
        let offset: usize = record.offset.parse()?;
        let partition = record.partition as usize;

        let mut state = self.log.inner.state.lock().await;
        let offsets = state
            .groups
            .get_mut(&self.group_key())
            .ok_or_else(|| LogError::Broker(format!("unknown consumer group {}", self.group)))?;

        if let Some(committed) = offsets.committed.get_mut(partition) {
            *committed = (*committed).max(offset + 1);
        }

        Ok(())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::communication::implementation::json::LogPublisher;
    use crate::communication::log::DeliveryOutcome;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TOPIC: &str = "events";
    const NO_WAIT: Duration = Duration::from_millis(0);

    #[tokio::test]
    async fn hold_records_until_flushed() {
        let log = MemoryLog::default();
        let receipt = log.publish(TOPIC, Some("a"), &json!({})).await.unwrap();

        assert!(log.records(TOPIC).await.is_empty());
        assert_eq!(log.buffered().await, 1);

        log.flush(NO_WAIT).await.unwrap();

        assert_eq!(log.records(TOPIC).await.len(), 1);
        assert!(matches!(receipt.outcome(), DeliveryOutcome::Delivered(_)));
    }

    #[tokio::test]
    async fn fail_deliveries_while_unavailable() {
        let log = MemoryLog::default();
        log.set_available(false).await;

        let receipt = log.publish(TOPIC, None, &json!({})).await.unwrap();

        assert!(log.flush(NO_WAIT).await.is_err());
        assert!(matches!(receipt.outcome(), DeliveryOutcome::Failed(_)));
        assert!(log.records(TOPIC).await.is_empty());
    }

    #[tokio::test]
    async fn assign_equal_keys_to_equal_partitions() {
        let log = MemoryLog::default();

        let first = log.publish(TOPIC, Some("key"), &json!(1)).await.unwrap();
        let second = log.publish(TOPIC, Some("key"), &json!(2)).await.unwrap();
        log.flush(NO_WAIT).await.unwrap();

        match (first.outcome(), second.outcome()) {
            (DeliveryOutcome::Delivered(a), DeliveryOutcome::Delivered(b)) => {
                assert_eq!(a.partition, b.partition)
            }
            outcomes => panic!("unexpected outcomes {:?}", outcomes),
        }
    }

    #[tokio::test]
    async fn spread_keyless_records() {
        let log = MemoryLog::default();
        let mut partitions = Vec::new();

        for n in 0..3 {
            let receipt = log.publish(TOPIC, None, &json!(n)).await.unwrap();
            log.flush(NO_WAIT).await.unwrap();

            if let DeliveryOutcome::Delivered(position) = receipt.outcome() {
                partitions.push(position.partition);
            }
        }

        assert_eq!(partitions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn reject_duplicate_topics() {
        let log = MemoryLog::default();
        let spec = TopicSpec::new(1, 1);

        log.create_topic(TOPIC, &spec).await.unwrap();

        assert!(log.create_topic(TOPIC, &spec).await.is_err());
        assert_eq!(log.topic_spec(TOPIC).await, Some(spec));
        assert_eq!(log.list_topics().await.unwrap(), vec![TOPIC.to_owned()]);
    }

    #[tokio::test]
    async fn ensure_topic_only_once() {
        let log = MemoryLog::default();
        let spec = TopicSpec::new(2, 1);

        log.ensure_topic(TOPIC, &spec).await;
        log.ensure_topic(TOPIC, &TopicSpec::new(5, 1)).await;

        assert_eq!(log.topic_spec(TOPIC).await, Some(spec));
    }

    #[tokio::test]
    async fn redeliver_uncommitted_records_to_group() {
        let log = MemoryLog::default();
        log.create_topic(TOPIC, &TopicSpec::new(1, 1)).await.unwrap();
        log.publish(TOPIC, None, &json!(1)).await.unwrap();
        log.publish(TOPIC, None, &json!(2)).await.unwrap();
        log.flush(NO_WAIT).await.unwrap();

        let mut subscription = log.subscribe(TOPIC, "group").await.unwrap();
        let first = subscription.poll(NO_WAIT).await.unwrap().unwrap();
        subscription.commit(&first).await.unwrap();
        let second = subscription.poll(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(second.offset, "1");

        let mut resumed = log.subscribe(TOPIC, "group").await.unwrap();
        let again = resumed.poll(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(again, second);
    }

    #[tokio::test]
    async fn track_groups_independently() {
        let log = MemoryLog::default();
        log.publish(TOPIC, Some("k"), &json!(1)).await.unwrap();
        log.flush(NO_WAIT).await.unwrap();

        let mut analytics = log.subscribe(TOPIC, "analytics").await.unwrap();
        let mut alerting = log.subscribe(TOPIC, "alerting").await.unwrap();

        assert!(analytics.poll(NO_WAIT).await.unwrap().is_some());
        assert!(alerting.poll(NO_WAIT).await.unwrap().is_some());
        assert!(analytics.poll(NO_WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wake_up_subscribers_on_flush() {
        let log = MemoryLog::default();
        let mut subscription = log.subscribe(TOPIC, "group").await.unwrap();

        let producer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.publish(TOPIC, None, &json!(1)).await;
            producer.flush(NO_WAIT).await.ok();
        });

        let record = subscription.poll(Duration::from_secs(5)).await.unwrap();
        assert!(record.is_some());
    }
}
