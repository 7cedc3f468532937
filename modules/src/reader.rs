//! Shared consumption loop of the downstream readers
//!
//! A [`Reader`] joins a consumer group on the relay topic and feeds every decoded record
//! into a [`RecordProcessor`]. Records are committed after processing. Undecodable ones are
//! committed as well so that a single broken record can not stall the group.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use harness::{BackgroundTask, TerminationSignal};
use library::communication::log::{ConsumedRecord, LogSubscription, SharedSubscriber};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const METRICS_INTERVAL: Duration = Duration::from_secs(60);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

const NEVER: i64 = i64::MIN;

/// Counters every reader maintains
#[derive(Debug)]
pub struct ReaderMetrics {
    messages_processed: AtomicU64,
    processing_errors: AtomicU64,
    last_message_time: AtomicI64,
    processing_latency_us: AtomicU64,
}

impl Default for ReaderMetrics {
    fn default() -> Self {
        Self {
            messages_processed: AtomicU64::new(0),
            processing_errors: AtomicU64::new(0),
            last_message_time: AtomicI64::new(NEVER),
            processing_latency_us: AtomicU64::new(0),
        }
    }
}

impl ReaderMetrics {
    /// Number of records processed so far
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    fn record_processed(&self, elapsed: Duration) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.last_message_time
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.processing_latency_us
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.processing_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point in time copy of all counters
    pub fn snapshot(&self) -> ReaderSnapshot {
        let last_message_time = match self.last_message_time.load(Ordering::Relaxed) {
            NEVER => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        };

        ReaderSnapshot {
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
            last_message_time,
            processing_latency_ms: self.processing_latency_us.load(Ordering::Relaxed) as f64
                / 1000.0,
        }
    }
}

/// Point in time copy of [`ReaderMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReaderSnapshot {
    /// Records processed so far
    pub messages_processed: u64,
    /// Records that could not be decoded and failed reads
    pub processing_errors: u64,
    /// Moment the last record has been processed
    pub last_message_time: Option<DateTime<Utc>>,
    /// Duration it took to process and commit the last record
    pub processing_latency_ms: f64,
}

/// Consumer of decoded records
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    /// Handles a single record, `encoded_len` is the size of the record value in bytes
    async fn process(&self, message: &Value, encoded_len: usize);

    /// Called once the record has been processed and committed
    async fn completed(&self, _elapsed: Duration) {}

    /// Writes a summary of the metrics to the log
    async fn log_metrics(&self);

    /// Counters shared with the consumption loop
    fn metrics(&self) -> &ReaderMetrics;
}

/// Background consumption of a topic through a consumer group
pub struct Reader<P> {
    job: ReadJob<P>,
    task: BackgroundTask,
}

impl<P> Reader<P>
where
    P: RecordProcessor + 'static,
{
    /// Creates a stopped reader
    pub fn new(
        subscriber: SharedSubscriber,
        topic: impl Into<String>,
        group: &'static str,
        processor: Arc<P>,
    ) -> Self {
        Self {
            job: ReadJob {
                subscriber,
                topic: topic.into(),
                group,
                processor,
            },
            task: BackgroundTask::new(group),
        }
    }

    /// Processor records are handed to
    pub fn processor(&self) -> &Arc<P> {
        &self.job.processor
    }

    /// Starts consuming, returns `false` if the reader is already running
    pub async fn start(&self) -> bool {
        let job = self.job.clone();
        self.task.start(move |signal| job.run(signal)).await
    }

    /// Stops consuming, returns `false` if the reader was not running
    pub async fn stop(&self) -> bool {
        self.task.stop(STOP_TIMEOUT).await.stopped()
    }
}

struct ReadJob<P> {
    subscriber: SharedSubscriber,
    topic: String,
    group: &'static str,
    processor: Arc<P>,
}

impl<P> Clone for ReadJob<P> {
    fn clone(&self) -> Self {
        Self {
            subscriber: self.subscriber.clone(),
            topic: self.topic.clone(),
            group: self.group,
            processor: self.processor.clone(),
        }
    }
}

impl<P> ReadJob<P>
where
    P: RecordProcessor + 'static,
{
    #[instrument(skip(self, signal), fields(topic = %self.topic, group = self.group))]
    async fn run(self, mut signal: TerminationSignal) {
        let mut subscription = loop {
            match self.subscriber.subscribe(&self.topic, self.group).await {
                Ok(subscription) => break subscription,
                Err(error) => {
                    error!(%error, "Failed to join consumer group");
                    self.processor.metrics().record_error();

                    tokio::select! {
                        _ = sleep(ERROR_BACKOFF) => {},
                        _ = signal.triggered() => return,
                    }
                }
            }
        };

        info!("Consuming records");
        let mut last_report = Instant::now();

        while !signal.is_triggered() {
            let polled = tokio::select! {
                polled = subscription.poll(POLL_TIMEOUT) => polled,
                _ = signal.triggered() => break,
            };

            match polled {
                Ok(Some(record)) => self.handle(subscription.as_mut(), record).await,
                Ok(None) => {}
                Err(error) => {
                    error!(%error, "Failed to read from topic");
                    self.processor.metrics().record_error();

                    tokio::select! {
                        _ = sleep(ERROR_BACKOFF) => {},
                        _ = signal.triggered() => break,
                    }
                }
            }

            if last_report.elapsed() >= METRICS_INTERVAL {
                self.processor.log_metrics().await;
                last_report = Instant::now();
            }
        }

        info!("Stopped consuming records");
    }

    async fn handle(
        &self,
        subscription: &mut (dyn LogSubscription + Send),
        record: ConsumedRecord,
    ) {
        let started = Instant::now();

        match serde_json::from_slice::<Value>(&record.value) {
            Ok(message) => {
                self.processor.process(&message, record.value.len()).await;
                commit(subscription, &record).await;

                let elapsed = started.elapsed();
                self.processor.metrics().record_processed(elapsed);
                self.processor.completed(elapsed).await;
            }
            Err(error) => {
                warn!(%error, partition = record.partition, offset = %record.offset, "Failed to decode record");
                self.processor.metrics().record_error();
                commit(subscription, &record).await;
            }
        }
    }
}

async fn commit(subscription: &mut (dyn LogSubscription + Send), record: &ConsumedRecord) {
    match subscription.commit(record).await {
        Ok(()) => debug!(partition = record.partition, offset = %record.offset, "Committed record"),
        Err(error) => error!(%error, offset = %record.offset, "Failed to commit record"),
    }
}
