//! Pull-based message queues with explicit per-delivery acknowledgement

mod client;
mod message;

pub use client::*;
pub use message::*;

/// Upper bound of messages a single receive call may return
pub const MAX_RECEIVE_BATCH: usize = 10;
