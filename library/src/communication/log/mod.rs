//! Append-only, partitioned logs with buffered publishing and consumer groups

mod client;
mod error;
mod receipt;
mod record;
mod subscriber;

pub use client::*;
pub use error::*;
pub use receipt::*;
pub use record::*;
pub use subscriber::*;
