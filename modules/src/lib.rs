//! Runnable modules each bundling multiple services and providing a unified configuration

#![deny(missing_docs)]
// Disable the lint for now as it has a high false-positive rate
#![allow(unknown_lints, clippy::nonstandard_macro_braces)]

pub mod options;

pub mod analytics;
pub mod realtime;
pub mod relay;

pub mod reader;
