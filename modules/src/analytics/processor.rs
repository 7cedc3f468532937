use crate::reader::{ReaderMetrics, ReaderSnapshot, RecordProcessor};
use async_trait::async_trait;
use futures::lock::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::{info, trace};

/// Number of samples kept for the averages
const SAMPLE_WINDOW: usize = 1000;
/// Event counts are logged whenever this many messages have been processed
const REPORT_EVERY: u64 = 100;

#[derive(Debug, Default)]
struct Statistics {
    event_counts: BTreeMap<String, u64>,
    message_sizes: VecDeque<usize>,
    processing_times: VecDeque<f64>,
}

fn push_sample<T>(samples: &mut VecDeque<T>, sample: T) {
    if samples.len() == SAMPLE_WINDOW {
        samples.pop_front();
    }
    samples.push_back(sample);
}

fn average<T: Copy + Into<f64>>(samples: impl ExactSizeIterator<Item = T>) -> Option<f64> {
    let count = samples.len();
    if count == 0 {
        return None;
    }

    let total: f64 = samples.map(Into::<f64>::into).sum();
    Some(total / count as f64)
}

/// Event type of a relayed message, `unknown` if it does not carry one
fn event_type(data: &Value) -> String {
    match data.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        None | Some(Value::Null) => "unknown".into(),
        Some(other) => other.to_string(),
    }
}

/// Aggregates statistics over the relayed messages
pub struct AnalyticsProcessor {
    metrics: ReaderMetrics,
    statistics: Mutex<Statistics>,
}

impl Default for AnalyticsProcessor {
    fn default() -> Self {
        Self {
            metrics: ReaderMetrics::default(),
            statistics: Mutex::new(Statistics::default()),
        }
    }
}

impl AnalyticsProcessor {
    /// Current counters and derived averages
    pub async fn snapshot(&self) -> AnalyticsSnapshot {
        let statistics = self.statistics.lock().await;

        AnalyticsSnapshot {
            reader: self.metrics.snapshot(),
            avg_processing_time_ms: average(statistics.processing_times.iter().copied()),
            avg_message_size_bytes: average(
                statistics.message_sizes.iter().map(|size| *size as u32),
            ),
            event_counts: statistics.event_counts.clone(),
        }
    }
}

#[async_trait]
impl RecordProcessor for AnalyticsProcessor {
    async fn process(&self, message: &Value, encoded_len: usize) {
        let data = match message.get("data") {
            Some(data) => data,
            None => return,
        };

        let mut statistics = self.statistics.lock().await;
        *statistics.event_counts.entry(event_type(data)).or_default() += 1;
        push_sample(&mut statistics.message_sizes, encoded_len);

        trace!(
            average = ?average(statistics.message_sizes.iter().map(|size| *size as u32)),
            "Average message size"
        );

        if self.metrics.messages_processed() % REPORT_EVERY == 0 {
            info!(counts = ?statistics.event_counts, "Event counts");
        }
    }

    async fn completed(&self, elapsed: Duration) {
        let millis = elapsed.as_micros() as f64 / 1000.0;
        push_sample(&mut self.statistics.lock().await.processing_times, millis);
    }

    async fn log_metrics(&self) {
        let snapshot = self.snapshot().await;
        info!(metrics = ?snapshot, "Current metrics");
    }

    fn metrics(&self) -> &ReaderMetrics {
        &self.metrics
    }
}

/// Point in time view of the [`AnalyticsProcessor`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsSnapshot {
    /// Counters maintained by the consumption loop
    #[serde(flatten)]
    pub reader: ReaderSnapshot,
    /// Average duration of the last processed messages
    pub avg_processing_time_ms: Option<f64>,
    /// Average encoded size of the last processed messages
    pub avg_message_size_bytes: Option<f64>,
    /// Number of messages seen per event type
    pub event_counts: BTreeMap<String, u64>,
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn count_events_by_type() {
        let processor = AnalyticsProcessor::default();

        for message in &[
            json!({ "data": { "type": "click" } }),
            json!({ "data": { "type": "click" } }),
            json!({ "data": { "type": "view" } }),
            json!({ "data": { "user": 42 } }),
        ] {
            processor.process(message, 10).await;
        }

        let counts = processor.snapshot().await.event_counts;
        let expected: BTreeMap<String, u64> = vec![
            ("click".to_owned(), 2),
            ("unknown".to_owned(), 1),
            ("view".to_owned(), 1),
        ]
        .into_iter()
        .collect();

        assert_eq!(counts, expected);
    }

    #[tokio::test]
    async fn skip_messages_without_data() {
        let processor = AnalyticsProcessor::default();
        processor.process(&json!({ "message_id": "m-1" }), 10).await;

        let snapshot = processor.snapshot().await;
        assert!(snapshot.event_counts.is_empty());
        assert_eq!(snapshot.avg_message_size_bytes, None);
    }

    #[tokio::test]
    async fn average_message_sizes() {
        let processor = AnalyticsProcessor::default();
        processor.process(&json!({ "data": {} }), 100).await;
        processor.process(&json!({ "data": {} }), 300).await;

        assert_eq!(processor.snapshot().await.avg_message_size_bytes, Some(200.0));
    }

    #[tokio::test]
    async fn keep_a_bounded_window_of_samples() {
        let processor = AnalyticsProcessor::default();

        for _ in 0..SAMPLE_WINDOW {
            processor.process(&json!({ "data": {} }), 1).await;
        }
        for _ in 0..SAMPLE_WINDOW {
            processor.process(&json!({ "data": {} }), 3).await;
        }

        let statistics = processor.statistics.lock().await;
        assert_eq!(statistics.message_sizes.len(), SAMPLE_WINDOW);
        drop(statistics);

        assert_eq!(processor.snapshot().await.avg_message_size_bytes, Some(3.0));
    }

    #[tokio::test]
    async fn average_processing_times() {
        let processor = AnalyticsProcessor::default();
        assert_eq!(processor.snapshot().await.avg_processing_time_ms, None);

        processor.completed(Duration::from_millis(2)).await;
        processor.completed(Duration::from_millis(4)).await;

        assert_eq!(processor.snapshot().await.avg_processing_time_ms, Some(3.0));
    }

    #[test]
    fn stringify_non_textual_types() {
        assert_eq!(event_type(&json!({ "type": 7 })), "7");
        assert_eq!(event_type(&json!({ "type": null })), "unknown");
    }
}
