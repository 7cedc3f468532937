//! In-process implementations backed by plain collections
//!
//! They behave like their networked counterparts (visibility timeouts, buffered publishing,
//! consumer groups) and are used for local experimentation and as test doubles.

mod log;
mod queue;

pub use self::log::*;
pub use queue::*;

use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};

/// Upper bound for a single wait so that expired deadlines are noticed without notification
const RECHECK_INTERVAL: Duration = Duration::from_millis(25);

/// Waits for a notification or until the next recheck is due
///
/// Returns `false` if the deadline has already passed.
async fn wait_for_change(notify: &Notify, deadline: Instant) -> bool {
    let now = Instant::now();
    if now >= deadline {
        return false;
    }

    let pause = (deadline - now).min(RECHECK_INTERVAL);
    tokio::select! {
        _ = notify.notified() => {},
        _ = sleep(pause) => {},
    }

    true
}
