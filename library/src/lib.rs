//! Shared building blocks for moving messages between queues and partitioned logs

#![deny(missing_docs)]
// Disable the lint for now as it has a high false-positive rate
#![allow(unknown_lints, clippy::nonstandard_macro_braces)]

pub mod communication;
pub mod helpers;

/// Type erased error which can be sent across threads
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Result without a value which may carry a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;
