//! Background tasks with an explicit, idempotent start/stop lifecycle

use futures::lock::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch::{channel, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Handed to background tasks so they can notice when they should wind down
#[derive(Clone)]
pub struct TerminationSignal {
    rx: Receiver<bool>,
}

impl TerminationSignal {
    /// Future that completes when the task should gracefully shut down
    ///
    /// Also completes if the owning [`BackgroundTask`] has been dropped.
    pub async fn triggered(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Check if the task should enter graceful shutdown
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

struct RunningTask {
    handle: JoinHandle<()>,
    termination: Sender<bool>,
}

/// Outcome of stopping a [`BackgroundTask`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Task was not running in the first place
    NotRunning,
    /// Task finished within the grace period
    Finished,
    /// Task did not finish within the grace period and has been aborted
    Aborted,
    /// Task panicked or was cancelled externally while winding down
    Crashed,
}

impl StopOutcome {
    /// Whether a running task has been brought down by the call
    ///
    /// A task that crashes while winding down does not count as stopped.
    pub fn stopped(&self) -> bool {
        matches!(self, StopOutcome::Finished | StopOutcome::Aborted)
    }
}

/// Slot for at most one instance of a long-running task
///
/// Starting an already running task or stopping a task that is not running has no effect
/// besides logging a warning.
pub struct BackgroundTask {
    name: &'static str,
    running: Mutex<Option<RunningTask>>,
}

impl BackgroundTask {
    /// Creates an empty slot, the name is only used for logging
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    /// Spawns the future produced by `job` unless an instance is already running
    ///
    /// The closure is only invoked when the task is actually started. Returns whether it has been.
    pub async fn start<F, Fut>(&self, job: F) -> bool
    where
        F: FnOnce(TerminationSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock().await;

        if let Some(task) = running.as_ref() {
            if !task.handle.is_finished() {
                warn!(task = self.name, "Task is already running");
                return false;
            }

            debug!(task = self.name, "Replacing task which exited on its own");
        }

        let (termination, rx) = channel(false);
        let handle = tokio::spawn(job(TerminationSignal { rx }));

        *running = Some(RunningTask {
            handle,
            termination,
        });

        info!(task = self.name, "Task started");
        true
    }

    /// Signals the task to terminate and waits up to `grace_period` before aborting it
    pub async fn stop(&self, grace_period: Duration) -> StopOutcome {
        let task = match self.running.lock().await.take() {
            Some(task) => task,
            None => {
                warn!(task = self.name, "Task is not running");
                return StopOutcome::NotRunning;
            }
        };

        let mut handle = task.handle;

        if handle.is_finished() {
            match (&mut handle).await {
                Ok(()) => debug!(task = self.name, "Task had already exited"),
                Err(e) => warn!(task = self.name, error = %e, "Task had already crashed"),
            }
            return StopOutcome::NotRunning;
        }

        task.termination.send(true).ok();

        let outcome = match timeout(grace_period, &mut handle).await {
            Ok(Ok(())) => StopOutcome::Finished,
            Ok(Err(e)) => {
                error!(task = self.name, error = %e, "Task crashed");
                StopOutcome::Crashed
            }
            Err(_) => {
                warn!(task = self.name, ?grace_period, "Task did not terminate in time, aborting");
                handle.abort();
                StopOutcome::Aborted
            }
        };

        info!(task = self.name, ?outcome, "Task stopped");
        outcome
    }

    /// Whether an instance of the task is currently alive
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }
}
