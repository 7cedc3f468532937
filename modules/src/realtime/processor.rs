use super::{message_id, AlertRecord, AlertThreshold};
use crate::reader::{ReaderMetrics, ReaderSnapshot, RecordProcessor};
use async_trait::async_trait;
use futures::lock::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Number of alerts kept in the history
const HISTORY_LENGTH: usize = 1000;
/// Number of alerts included in the periodic metrics report
const REPORTED_ALERTS: usize = 5;

/// Evaluates alert thresholds against every relayed message
pub struct RealtimeProcessor {
    metrics: ReaderMetrics,
    thresholds: Vec<AlertThreshold>,
    alerts_triggered: AtomicU64,
    history: Mutex<VecDeque<AlertRecord>>,
}

impl RealtimeProcessor {
    /// Creates a processor evaluating the given thresholds
    pub fn new(thresholds: Vec<AlertThreshold>) -> Self {
        Self {
            metrics: ReaderMetrics::default(),
            thresholds,
            alerts_triggered: AtomicU64::new(0),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Evaluates all thresholds, records an alert for every match and returns their names
    pub async fn check_alerts(&self, message: &Value, encoded_len: usize) -> Vec<&'static str> {
        let triggered: Vec<&'static str> = self
            .thresholds
            .iter()
            .filter(|threshold| threshold.matches(message, encoded_len))
            .map(|threshold| threshold.name)
            .collect();

        if triggered.is_empty() {
            return triggered;
        }

        let mut history = self.history.lock().await;
        for name in &triggered {
            warn!(alert = name, message_id = %message_id(message), "Alert triggered");
            self.alerts_triggered.fetch_add(1, Ordering::Relaxed);

            if history.len() == HISTORY_LENGTH {
                history.pop_front();
            }
            history.push_back(AlertRecord::new(name, message));
        }

        triggered
    }

    /// Most recent alerts, oldest first
    pub async fn recent_alerts(&self, limit: usize) -> Vec<AlertRecord> {
        let history = self.history.lock().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Current counters
    pub fn snapshot(&self) -> RealtimeSnapshot {
        RealtimeSnapshot {
            reader: self.metrics.snapshot(),
            alerts_triggered: self.alerts_triggered.load(Ordering::Relaxed),
        }
    }
}

impl Default for RealtimeProcessor {
    fn default() -> Self {
        Self::new(AlertThreshold::defaults())
    }
}

#[async_trait]
impl RecordProcessor for RealtimeProcessor {
    async fn process(&self, message: &Value, encoded_len: usize) {
        self.check_alerts(message, encoded_len).await;
    }

    async fn log_metrics(&self) {
        info!(metrics = ?self.snapshot(), "Current metrics");

        let recent = self.recent_alerts(REPORTED_ALERTS).await;
        if !recent.is_empty() {
            info!(alerts = ?recent, "Recent alerts");
        }
    }

    fn metrics(&self) -> &ReaderMetrics {
        &self.metrics
    }
}

/// Point in time view of the [`RealtimeProcessor`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeSnapshot {
    /// Counters maintained by the consumption loop
    #[serde(flatten)]
    pub reader: ReaderSnapshot,
    /// Number of alerts raised so far
    pub alerts_triggered: u64,
}
