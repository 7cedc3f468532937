use super::RecordPosition;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;

type DeliveryReport = Result<RecordPosition, String>;

/// State of a published record as observed through its [`DeliveryReceipt`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Broker confirmed that the record has been stored
    Delivered(RecordPosition),
    /// Broker refused the record or the connection failed
    Failed(String),
    /// No report has arrived yet
    Pending,
}

/// Handle to the delivery report of a single published record
///
/// Publishing only hands a record to a local buffer. The receipt resolves once the buffer
/// has been flushed and should be inspected after calling
/// [`LogClient::flush`](super::LogClient::flush).
pub struct DeliveryReceipt {
    report: BoxFuture<'static, DeliveryReport>,
}

impl DeliveryReceipt {
    /// Creates a receipt from a future that resolves with the delivery report
    pub fn new<F>(report: F) -> Self
    where
        F: std::future::Future<Output = DeliveryReport> + Send + 'static,
    {
        Self {
            report: report.boxed(),
        }
    }

    /// Creates a linked pair of notifier and receipt
    pub fn channel() -> (DeliveryNotifier, Self) {
        let (tx, rx) = oneshot::channel();
        let receipt = Self::new(rx.map(|report| {
            report.unwrap_or_else(|_| Err("delivery report has been dropped".to_owned()))
        }));

        (DeliveryNotifier { tx }, receipt)
    }

    /// Inspects the report without waiting for it
    pub fn outcome(self) -> DeliveryOutcome {
        match self.report.now_or_never() {
            Some(Ok(position)) => DeliveryOutcome::Delivered(position),
            Some(Err(reason)) => DeliveryOutcome::Failed(reason),
            None => DeliveryOutcome::Pending,
        }
    }

    /// Waits until the report arrives
    pub async fn wait(self) -> DeliveryOutcome {
        match self.report.await {
            Ok(position) => DeliveryOutcome::Delivered(position),
            Err(reason) => DeliveryOutcome::Failed(reason),
        }
    }
}

/// Sending half of a [`DeliveryReceipt`] held by buffering log implementations
pub struct DeliveryNotifier {
    tx: oneshot::Sender<DeliveryReport>,
}

impl DeliveryNotifier {
    /// Reports that the record has been stored at the given position
    pub fn delivered(self, position: RecordPosition) {
        self.tx.send(Ok(position)).ok();
    }

    /// Reports that the record could not be stored
    pub fn failed(self, reason: impl Into<String>) {
        self.tx.send(Err(reason.into())).ok();
    }
}
