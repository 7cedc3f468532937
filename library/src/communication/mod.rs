//! Structures and traits to pull messages from queues and append them to partitioned logs
//!
//! The module is split into two halves which are unaware of each other:
//!
//! - [`queue`] models a pull-based message queue with per-delivery acknowledgement
//! - [`log`] models an append-only, partitioned log with buffered publishing and consumer groups
//!
//! Both halves are expressed as a low-level "raw" trait which transports are implementing
//! and a high-level trait operating on structured data. The glue between the two levels lives in
//! [`implementation::json`], concrete transports live next to it.

pub mod implementation;
pub mod log;
pub mod queue;
