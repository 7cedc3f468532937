//! Implementations of traits from this module using third-party crates

pub mod json;
pub mod memory;
pub mod redis;

#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "sqs")]
pub mod sqs;
