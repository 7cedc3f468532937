//! Trait implementations using [Redis Streams](https://redis.io/topics/streams-intro)
//!
//! - [`RedisStreamQueue`] simulates a visibility-timeout queue on top of a single stream
//! - [`RedisStreamLog`] stores every partition of a topic in its own stream

const STREAM_ID_NEW: &str = "*";
const STREAM_ID_HEAD: &str = "0";
const STREAM_ID_ADDITIONS: &str = ">";

mod factory;
mod log;
mod queue;

pub use self::log::*;
pub use factory::*;
pub use queue::*;

use thiserror::Error;

#[derive(Debug, Error)]
enum RedisStreamError {
    #[error("acknowledgement token {0} is malformed")]
    MalformedToken(String),
    #[error("partition {1} of topic {0} does not exist")]
    UnknownPartition(String, u32),
}

/// Key of the stream holding one partition of a topic
fn partition_key(topic: &str, partition: u32) -> String {
    format!("{}.{}", topic, partition)
}
