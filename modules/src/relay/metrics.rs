use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

const NEVER: i64 = i64::MIN;

/// Lifecycle state of the relay worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    /// No worker is running
    Stopped,
    /// Worker is pulling from the queue
    Running,
}

/// Counters updated by the relay worker
///
/// Values are only ever incremented while the worker runs and reset when it is started again.
#[derive(Debug)]
pub struct RelayMetrics {
    messages_processed: AtomicU64,
    processing_errors: AtomicU64,
    queue_send_errors: AtomicU64,
    acknowledgement_errors: AtomicU64,
    last_processing_time: AtomicI64,
    running: AtomicBool,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            messages_processed: AtomicU64::new(0),
            processing_errors: AtomicU64::new(0),
            queue_send_errors: AtomicU64::new(0),
            acknowledgement_errors: AtomicU64::new(0),
            last_processing_time: AtomicI64::new(NEVER),
            running: AtomicBool::new(false),
        }
    }
}

impl RelayMetrics {
    pub(super) fn reset(&self) {
        self.messages_processed.store(0, Ordering::Relaxed);
        self.processing_errors.store(0, Ordering::Relaxed);
        self.queue_send_errors.store(0, Ordering::Relaxed);
        self.acknowledgement_errors.store(0, Ordering::Relaxed);
        self.last_processing_time.store(NEVER, Ordering::Relaxed);
    }

    pub(super) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub(super) fn record_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.last_processing_time
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub(super) fn record_processing_error(&self) {
        self.processing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_send_error(&self) {
        self.queue_send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_acknowledgement_error(&self) {
        self.acknowledgement_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether a worker is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Consistent-enough copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_processing_time = match self.last_processing_time.load(Ordering::Relaxed) {
            NEVER => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        };

        MetricsSnapshot {
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
            queue_send_errors: self.queue_send_errors.load(Ordering::Relaxed),
            acknowledgement_errors: self.acknowledgement_errors.load(Ordering::Relaxed),
            last_processing_time,
            stream_status: if self.is_running() {
                RelayStatus::Running
            } else {
                RelayStatus::Stopped
            },
        }
    }
}

/// Point in time copy of [`RelayMetrics`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Messages published, flushed and handed to acknowledgement
    pub messages_processed: u64,
    /// Batches which failed as a whole
    pub processing_errors: u64,
    /// Records the log rejected or did not confirm
    pub queue_send_errors: u64,
    /// Deletions the queue did not confirm after a successful publish
    pub acknowledgement_errors: u64,
    /// Moment the last message has been delivered
    pub last_processing_time: Option<DateTime<Utc>>,
    /// Lifecycle state of the worker
    pub stream_status: RelayStatus,
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn start_out_empty() {
        let snapshot = RelayMetrics::default().snapshot();

        assert_eq!(snapshot.messages_processed, 0);
        assert_eq!(snapshot.last_processing_time, None);
        assert_eq!(snapshot.stream_status, RelayStatus::Stopped);
    }

    #[test]
    fn track_processing_time() {
        let metrics = RelayMetrics::default();
        metrics.record_processed();
        metrics.record_processed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_processed, 2);
        assert!(snapshot.last_processing_time.is_some());
    }

    #[test]
    fn reset_counters_but_not_status() {
        let metrics = RelayMetrics::default();
        metrics.set_running(true);
        metrics.record_processed();
        metrics.record_send_error();
        metrics.record_acknowledgement_error();
        metrics.record_processing_error();

        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_processed, 0);
        assert_eq!(snapshot.queue_send_errors, 0);
        assert_eq!(snapshot.acknowledgement_errors, 0);
        assert_eq!(snapshot.processing_errors, 0);
        assert_eq!(snapshot.last_processing_time, None);
        assert_eq!(snapshot.stream_status, RelayStatus::Running);
    }

    #[test]
    fn serialize_status_in_lowercase() {
        let value = serde_json::to_value(RelayMetrics::default().snapshot()).unwrap();
        assert_eq!(value["stream_status"], json!("stopped"));
        assert_eq!(value["last_processing_time"], json!(null));
    }
}
