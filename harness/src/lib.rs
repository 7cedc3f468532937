//! Runtime harness to execute modules and their background tasks

#![deny(missing_docs)]
// Disable the lint for now as it has a high false-positive rate
#![allow(unknown_lints, clippy::nonstandard_macro_braces)]

mod heart;
mod module;
mod task;

pub use heart::*;
pub use module::*;
pub use task::*;
