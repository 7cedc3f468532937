use thiserror::Error;

/// Errors reported by log implementations
#[derive(Debug, Error)]
pub enum LogError {
    /// A topic with the requested name has already been created
    #[error("topic {0} already exists")]
    TopicExists(String),
    /// Topic specification is not usable
    #[error("invalid topic specification for {topic}: {reason}")]
    InvalidTopic {
        /// Name of the rejected topic
        topic: String,
        /// Human readable explanation
        reason: String,
    },
    /// Buffered records have not been confirmed in time
    #[error("flush did not complete within {0:?}")]
    FlushTimeout(std::time::Duration),
    /// Stored record is missing a mandatory field
    #[error("record {0} is missing its value")]
    MissingValue(String),
    /// Broker rejected an operation
    #[error("broker rejected operation: {0}")]
    Broker(String),
}
