use super::{EnrichedMessage, MetricsSnapshot, RelayMetrics};
use harness::{BackgroundTask, TerminationSignal};
use library::communication::implementation::json::LogPublisher;
use library::communication::log::{DeliveryOutcome, LogClient, SharedLog, TopicSpec};
use library::communication::queue::{QueueClient, QueueMessage, SharedQueue, MAX_RECEIVE_BATCH};
use library::BoxedError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, trace, warn};

/// Errors which abort the processing of a whole batch
#[derive(Debug, Error)]
pub enum RelayError {
    /// Buffered records could not be flushed
    #[error("flushing the log failed")]
    Flush(#[source] BoxedError),
}

/// Tuning parameters of the relay loop
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Topic records are published to
    pub topic: String,
    /// Tag written into every record
    pub source: String,
    /// Maximum number of messages pulled per batch, capped at ten
    pub batch_size: usize,
    /// Long-poll duration of a single receive call
    pub receive_wait: Duration,
    /// Upper bound for confirming a batch with the log
    pub flush_timeout: Duration,
    /// Pause after an empty or failed batch
    pub backoff: Duration,
    /// Grace period granted to the worker when stopping
    pub stop_timeout: Duration,
    /// Layout used when the topic has to be created
    pub topic_spec: TopicSpec,
    /// Whether queue attributes are copied into the records
    pub forward_attributes: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topic: "sqs-data".into(),
            source: "aws-sqs".into(),
            batch_size: MAX_RECEIVE_BATCH,
            receive_wait: Duration::from_secs(20),
            flush_timeout: Duration::from_secs(10),
            backoff: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
            topic_spec: TopicSpec::default(),
            forward_attributes: false,
        }
    }
}

/// Moves messages from a queue into a topic of a partitioned log
///
/// Every message is acknowledged only after the log confirmed the corresponding record,
/// which yields at-least-once delivery. Messages whose record could not be confirmed stay
/// in the queue and are handed out again once their visibility timeout expires.
pub struct RelayEngine {
    worker: RelayWorker,
    task: BackgroundTask,
}

impl RelayEngine {
    /// Creates a stopped relay
    pub fn new(queue: SharedQueue, log: SharedLog, config: RelayConfig) -> Self {
        Self {
            worker: RelayWorker {
                queue,
                log,
                config: Arc::new(config),
                metrics: Arc::new(RelayMetrics::default()),
            },
            task: BackgroundTask::new("relay"),
        }
    }

    /// Starts the worker, returning `false` if it is already running
    ///
    /// Counters are reset whenever a new worker is started.
    #[instrument(skip(self))]
    pub async fn start(&self) -> bool {
        let worker = self.worker.clone();

        self.task
            .start(move |signal| {
                worker.metrics.reset();
                worker.metrics.set_running(true);
                worker.run(signal)
            })
            .await
    }

    /// Stops the worker, returning `false` if it was not running
    ///
    /// A worker that already exited on its own (e.g. by panicking) counts as not running.
    /// Waits for the current batch to complete for at most the configured stop timeout.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> bool {
        let outcome = self.task.stop(self.worker.config.stop_timeout).await;
        self.worker.metrics.set_running(false);
        outcome.stopped()
    }

    /// Whether the worker is currently running
    pub fn is_running(&self) -> bool {
        self.worker.metrics.is_running()
    }

    /// Current counters of the relay
    pub fn metrics(&self) -> MetricsSnapshot {
        self.worker.metrics.snapshot()
    }

    /// Queue messages are pulled from
    pub fn queue(&self) -> &SharedQueue {
        &self.worker.queue
    }

    /// Log records are published to
    pub fn log(&self) -> &SharedLog {
        &self.worker.log
    }

    /// Configuration the relay has been created with
    pub fn config(&self) -> &RelayConfig {
        &self.worker.config
    }
}

/// Clears the running flag once the worker future is gone, whether it returned or unwound
struct RunningGuard(Arc<RelayMetrics>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.set_running(false);
    }
}

#[derive(Clone)]
struct RelayWorker {
    queue: SharedQueue,
    log: SharedLog,
    config: Arc<RelayConfig>,
    metrics: Arc<RelayMetrics>,
}

impl RelayWorker {
    #[instrument(skip(self, signal), fields(topic = %self.config.topic))]
    async fn run(self, mut signal: TerminationSignal) {
        let _running = RunningGuard(self.metrics.clone());

        self.log
            .ensure_topic(&self.config.topic, &self.config.topic_spec)
            .await;

        info!("Relaying messages");

        while !signal.is_triggered() {
            let batch = tokio::select! {
                batch = self.queue.receive(self.config.batch_size, self.config.receive_wait) => batch,
                _ = signal.triggered() => break,
            };

            let idle = if batch.is_empty() {
                trace!("Queue is empty");
                true
            } else if let Err(error) = self.relay(batch).await {
                error!(%error, "Failed to relay batch");
                self.metrics.record_processing_error();
                true
            } else {
                false
            };

            if idle {
                tokio::select! {
                    _ = sleep(self.config.backoff) => {},
                    _ = signal.triggered() => break,
                }
            }
        }

        info!("Relay stopped");
    }

    /// Publishes a batch, flushes once and acknowledges every confirmed message
    ///
    /// A failed flush is reported only after the confirmed part of the batch has been acknowledged.
    async fn relay(&self, batch: Vec<QueueMessage>) -> Result<(), RelayError> {
        let mut accepted = Vec::with_capacity(batch.len());

        for message in batch {
            let record = EnrichedMessage::new(
                &message,
                &self.config.source,
                self.config.forward_attributes,
            );

            match self
                .log
                .publish(&self.config.topic, Some(message.id.as_str()), &record)
                .await
            {
                Some(receipt) => accepted.push((message, receipt)),
                None => {
                    warn!(id = %message.id, "Log did not accept record, leaving message in queue");
                    self.metrics.record_send_error();
                }
            }
        }

        if accepted.is_empty() {
            return Ok(());
        }

        let flushed = self.log.flush(self.config.flush_timeout).await;

        for (message, receipt) in accepted {
            match receipt.outcome() {
                DeliveryOutcome::Delivered(position) => {
                    debug!(id = %message.id, partition = position.partition, offset = %position.offset, "Record delivered");
                    self.metrics.record_processed();

                    if !self.queue.acknowledge(&message.ack_token).await {
                        warn!(id = %message.id, "Failed to acknowledge delivered message");
                        self.metrics.record_acknowledgement_error();
                    }
                }
                DeliveryOutcome::Failed(reason) => {
                    warn!(id = %message.id, %reason, "Record has not been delivered");
                    self.metrics.record_send_error();
                }
                DeliveryOutcome::Pending => {
                    warn!(id = %message.id, "Record has not been confirmed in time");
                    self.metrics.record_send_error();
                }
            }
        }

        flushed.map_err(RelayError::Flush)
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use async_trait::async_trait;
    use library::communication::implementation::memory::{MemoryLog, MemoryQueue};
    use library::communication::log::{DeliveryReceipt, LogRecord};
    use library::communication::queue::{AckToken, MessageId};
    use library::EmptyResult;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOPIC: &str = "sqs-data";

    fn config() -> RelayConfig {
        RelayConfig {
            receive_wait: Duration::from_millis(50),
            flush_timeout: Duration::from_millis(200),
            backoff: Duration::from_millis(20),
            stop_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Memory log which can reject single records, stall flushes and counts flush calls
    struct FaultyLog {
        inner: MemoryLog,
        reject: Option<i64>,
        stall_flush: bool,
        flushes: AtomicUsize,
    }

    impl FaultyLog {
        fn new(inner: &MemoryLog) -> Self {
            Self {
                inner: inner.clone(),
                reject: None,
                stall_flush: false,
                flushes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LogClient for FaultyLog {
        async fn create_topic(&self, topic: &str, spec: &TopicSpec) -> EmptyResult {
            self.inner.create_topic(topic, spec).await
        }

        async fn list_topics(&self) -> Result<Vec<String>, BoxedError> {
            self.inner.list_topics().await
        }

        async fn send(
            &self,
            topic: &str,
            record: LogRecord,
        ) -> Result<DeliveryReceipt, BoxedError> {
            if let Some(reject) = self.reject {
                let enriched: EnrichedMessage = serde_json::from_slice(&record.value)?;

                if enriched.data["n"] == json!(reject) {
                    return Err("record rejected".into());
                }
            }

            self.inner.send(topic, record).await
        }

        async fn flush(&self, timeout: Duration) -> EmptyResult {
            self.flushes.fetch_add(1, Ordering::SeqCst);

            if self.stall_flush {
                Err("flush timed out with records outstanding".into())
            } else {
                self.inner.flush(timeout).await
            }
        }
    }

    /// Memory queue which never confirms an acknowledgement
    struct NackingQueue(MemoryQueue);

    #[async_trait]
    impl QueueClient for NackingQueue {
        async fn receive(&self, max_count: usize, wait: Duration) -> Vec<QueueMessage> {
            self.0.receive(max_count, wait).await
        }

        async fn acknowledge(&self, _token: &AckToken) -> bool {
            false
        }

        async fn send(&self, body: &Value) -> Result<MessageId, BoxedError> {
            self.0.send(body).await
        }

        async fn approximate_depth(&self) -> Result<u64, BoxedError> {
            self.0.approximate_depth().await
        }
    }

    struct PanickingQueue;

    #[async_trait]
    impl QueueClient for PanickingQueue {
        async fn receive(&self, _max_count: usize, _wait: Duration) -> Vec<QueueMessage> {
            panic!("queue client failed")
        }

        async fn acknowledge(&self, _token: &AckToken) -> bool {
            false
        }

        async fn send(&self, _body: &Value) -> Result<MessageId, BoxedError> {
            Err("unsupported".into())
        }

        async fn approximate_depth(&self) -> Result<u64, BoxedError> {
            Ok(0)
        }
    }

    fn worker(queue: SharedQueue, log: SharedLog) -> RelayWorker {
        RelayWorker {
            queue,
            log,
            config: Arc::new(config()),
            metrics: Arc::new(RelayMetrics::default()),
        }
    }

    async fn fill(queue: &MemoryQueue, count: i64) -> Vec<String> {
        let mut ids = Vec::new();
        for n in 0..count {
            let id = queue.send(&json!({ "n": n })).await.unwrap();
            ids.push(id.to_string());
        }
        ids
    }

    async fn published(log: &MemoryLog) -> Vec<EnrichedMessage> {
        log.records(TOPIC)
            .await
            .into_iter()
            .map(|record| serde_json::from_slice(&record.value).unwrap())
            .collect()
    }

    async fn await_processed(engine: &RelayEngine, count: u64) {
        for _ in 0..200 {
            if engine.metrics().messages_processed >= count {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn relay_every_message_keyed_by_id() {
        let queue = MemoryQueue::default();
        let log = MemoryLog::default();
        let ids = fill(&queue, 5).await;

        let engine = RelayEngine::new(Arc::new(queue.clone()), Arc::new(log.clone()), config());
        assert!(engine.start().await);

        await_processed(&engine, 5).await;
        assert!(engine.stop().await);

        let records = log.records(TOPIC).await;
        let keys: HashSet<_> = records.iter().filter_map(|r| r.key.clone()).collect();
        assert_eq!(keys, ids.iter().cloned().collect::<HashSet<_>>());

        for message in published(&log).await {
            assert_eq!(message.source, "aws-sqs");
            assert!(ids.contains(&message.message_id));
        }

        assert_eq!(queue.approximate_depth().await.unwrap(), 0);
        assert_eq!(engine.metrics().messages_processed, 5);
    }

    #[tokio::test]
    async fn leave_rejected_message_for_redelivery() {
        let queue = MemoryQueue::new(Duration::from_millis(100));
        let memory_log = MemoryLog::default();
        let ids = fill(&queue, 5).await;

        let log = FaultyLog {
            reject: Some(2),
            ..FaultyLog::new(&memory_log)
        };

        let engine = RelayEngine::new(Arc::new(queue.clone()), Arc::new(log), config());
        engine.start().await;

        await_processed(&engine, 4).await;
        engine.stop().await;

        let delivered: HashSet<_> = published(&memory_log)
            .await
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        let expected: HashSet<_> = vec![&ids[0], &ids[1], &ids[3], &ids[4]]
            .into_iter()
            .cloned()
            .collect();

        assert_eq!(delivered, expected);
        assert!(engine.metrics().queue_send_errors >= 1);

        // The rejected message is the only one left and becomes visible again
        assert_eq!(queue.approximate_depth().await.unwrap(), 1);
        sleep(Duration::from_millis(150)).await;

        let redelivered = queue.receive(10, Duration::from_millis(100)).await;
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].id.to_string(), ids[2]);
        assert_eq!(redelivered[0].body, json!({ "n": 2 }));
    }

    #[tokio::test]
    async fn never_acknowledge_unconfirmed_records() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let log = MemoryLog::default();
        log.set_available(false).await;
        fill(&queue, 3).await;

        let engine = RelayEngine::new(Arc::new(queue.clone()), Arc::new(log.clone()), config());
        engine.start().await;

        for _ in 0..200 {
            if engine.metrics().processing_errors > 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        engine.stop().await;

        let metrics = engine.metrics();
        assert_eq!(metrics.messages_processed, 0);
        assert!(metrics.queue_send_errors >= 3);
        assert!(metrics.processing_errors >= 1);
        assert_eq!(queue.approximate_depth().await.unwrap(), 3);
        assert!(log.records(TOPIC).await.is_empty());
    }

    #[tokio::test]
    async fn keep_batch_in_queue_when_flush_fails() {
        let queue = MemoryQueue::default();
        let memory_log = MemoryLog::default();
        fill(&queue, 3).await;

        let log = Arc::new(FaultyLog {
            stall_flush: true,
            ..FaultyLog::new(&memory_log)
        });
        let worker = worker(Arc::new(queue.clone()), log.clone());

        let batch = queue.receive(10, Duration::from_millis(50)).await;
        assert_eq!(batch.len(), 3);

        let result = worker.relay(batch).await;
        assert!(matches!(result, Err(RelayError::Flush(_))));
        assert_eq!(log.flushes.load(Ordering::SeqCst), 1);

        let metrics = worker.metrics.snapshot();
        assert_eq!(metrics.messages_processed, 0);
        assert_eq!(metrics.queue_send_errors, 3);
        assert_eq!(metrics.acknowledgement_errors, 0);
        assert_eq!(metrics.last_processing_time, None);

        // Nothing has been acknowledged, all three deliveries are still outstanding
        assert_eq!(queue.approximate_depth().await.unwrap(), 3);
        assert_eq!(queue.in_flight().await, 3);
        assert!(memory_log.records(TOPIC).await.is_empty());
    }

    #[tokio::test]
    async fn count_failed_acknowledgements_and_redeliver() {
        let queue = MemoryQueue::new(Duration::from_millis(100));
        let log = MemoryLog::default();
        let mut ids = fill(&queue, 2).await;

        let worker = worker(Arc::new(NackingQueue(queue.clone())), Arc::new(log.clone()));

        let batch = queue.receive(10, Duration::from_millis(50)).await;
        worker.relay(batch).await.unwrap();

        let metrics = worker.metrics.snapshot();
        assert_eq!(metrics.messages_processed, 2);
        assert_eq!(metrics.acknowledgement_errors, 2);
        assert_eq!(metrics.queue_send_errors, 0);
        assert_eq!(log.records(TOPIC).await.len(), 2);
        assert_eq!(queue.approximate_depth().await.unwrap(), 2);

        sleep(Duration::from_millis(150)).await;

        let mut redelivered: Vec<String> = queue
            .receive(10, Duration::from_millis(100))
            .await
            .iter()
            .map(|message| message.id.to_string())
            .collect();

        redelivered.sort();
        ids.sort();
        assert_eq!(redelivered, ids);
    }

    #[tokio::test]
    async fn skip_flush_for_empty_batches() {
        let log = Arc::new(FaultyLog::new(&MemoryLog::default()));
        let engine = RelayEngine::new(Arc::new(MemoryQueue::default()), log.clone(), config());

        engine.start().await;
        sleep(Duration::from_millis(200)).await;
        assert!(engine.stop().await);

        assert_eq!(log.flushes.load(Ordering::SeqCst), 0);

        let metrics = engine.metrics();
        assert_eq!(metrics.messages_processed, 0);
        assert_eq!(metrics.processing_errors, 0);
        assert_eq!(metrics.queue_send_errors, 0);
        assert_eq!(metrics.acknowledgement_errors, 0);
        assert_eq!(metrics.last_processing_time, None);
    }

    #[tokio::test]
    async fn refuse_stop_after_worker_crashed() {
        let engine = RelayEngine::new(
            Arc::new(PanickingQueue),
            Arc::new(MemoryLog::default()),
            config(),
        );

        assert!(engine.start().await);
        sleep(Duration::from_millis(50)).await;

        assert!(!engine.is_running());
        assert!(!engine.stop().await);
    }

    #[tokio::test]
    async fn preserve_malformed_bodies() {
        let queue = MemoryQueue::default();
        let log = MemoryLog::default();
        queue
            .send_with_attributes("not { json", Default::default())
            .await;

        let engine = RelayEngine::new(Arc::new(queue.clone()), Arc::new(log.clone()), config());
        engine.start().await;

        await_processed(&engine, 1).await;
        engine.stop().await;

        let messages = published(&log).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, json!({ "raw": "not { json" }));
    }

    #[tokio::test]
    async fn forward_attributes_when_configured() {
        let queue = MemoryQueue::default();
        let log = MemoryLog::default();
        let attributes = vec![("origin".to_owned(), "test".to_owned())]
            .into_iter()
            .collect();
        queue.send_with_attributes("{}", attributes).await;

        let config = RelayConfig {
            forward_attributes: true,
            ..config()
        };
        let engine = RelayEngine::new(Arc::new(queue.clone()), Arc::new(log.clone()), config);
        engine.start().await;

        await_processed(&engine, 1).await;
        engine.stop().await;

        let value: Value = serde_json::from_slice(&log.records(TOPIC).await[0].value).unwrap();
        assert_eq!(value["custom_attributes"]["origin"], json!("test"));
        assert_eq!(value["attributes"]["ApproximateReceiveCount"], json!("1"));
    }

    #[tokio::test]
    async fn start_and_stop_idempotently() {
        let engine = RelayEngine::new(
            Arc::new(MemoryQueue::default()),
            Arc::new(MemoryLog::default()),
            config(),
        );

        assert!(!engine.stop().await);
        assert!(engine.start().await);
        assert!(!engine.start().await);
        assert!(engine.is_running());
        assert!(engine.stop().await);
        assert!(!engine.stop().await);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn reset_metrics_on_fresh_start() {
        let queue = MemoryQueue::default();
        let engine = RelayEngine::new(
            Arc::new(queue.clone()),
            Arc::new(MemoryLog::default()),
            config(),
        );
        fill(&queue, 2).await;

        engine.start().await;
        await_processed(&engine, 2).await;
        engine.stop().await;
        assert_eq!(engine.metrics().messages_processed, 2);

        engine.start().await;
        assert_eq!(engine.metrics().messages_processed, 0);
        assert_eq!(engine.metrics().last_processing_time, None);
        engine.stop().await;
    }

    #[tokio::test]
    async fn create_topic_on_start() {
        let log = MemoryLog::new(TopicSpec::new(1, 1));
        let config = RelayConfig {
            topic_spec: TopicSpec::new(5, 1),
            ..config()
        };

        let engine = RelayEngine::new(
            Arc::new(MemoryQueue::default()),
            Arc::new(log.clone()),
            config,
        );
        engine.start().await;
        sleep(Duration::from_millis(50)).await;
        engine.stop().await;

        assert_eq!(log.topic_spec(TOPIC).await, Some(TopicSpec::new(5, 1)));
    }
}
