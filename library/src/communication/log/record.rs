use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Record appended to a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Partitioning key, records without one are spread across partitions
    pub key: Option<String>,
    /// Encoded payload
    pub value: Vec<u8>,
}

impl LogRecord {
    /// Creates a new record from raw parts
    pub fn new(key: Option<String>, value: Vec<u8>) -> Self {
        Self { key, value }
    }
}

/// Layout of a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpec {
    /// Number of partitions records are distributed across
    pub partitions: u32,
    /// Number of replicas each partition is stored on
    pub replication: u32,
}

impl TopicSpec {
    /// Creates a new specification from raw parts
    pub fn new(partitions: u32, replication: u32) -> Self {
        Self {
            partitions,
            replication,
        }
    }

    /// Partition a keyed record is assigned to, stable for the lifetime of the process
    pub fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.partitions.max(1))) as u32
    }
}

impl Default for TopicSpec {
    fn default() -> Self {
        Self {
            partitions: 3,
            replication: 3,
        }
    }
}

/// Location at which a record has been stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordPosition {
    /// Partition the record was assigned to
    pub partition: u32,
    /// Transport specific offset within the partition
    pub offset: String,
}

/// Record read from a topic through a consumer group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    /// Topic the record has been read from
    pub topic: String,
    /// Partition the record has been read from
    pub partition: u32,
    /// Transport specific offset, required to commit the record
    pub offset: String,
    /// Partitioning key, if any
    pub key: Option<String>,
    /// Encoded payload
    pub value: Vec<u8>,
}
