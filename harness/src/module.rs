use super::{DeathReason, Heart};
use async_trait::async_trait;
use library::{BoxedError, EmptyResult};
use std::any::type_name;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

/// Reason why a module has terminated
#[derive(Error, Debug)]
pub enum ModuleTerminationReason {
    /// Startup routine threw an error
    #[error("startup routine threw an error")]
    StartupFailed(#[source] BoxedError),
    /// Core run loop threw an error
    #[error("error during operation")]
    OperationalError(#[source] BoxedError),
    /// [`Heart`] provided by module died
    #[error("heart provided by module died: {0}")]
    HeartDied(DeathReason),
    /// Run loop exited cleanly
    #[error("run loop exited cleanly")]
    ExitedNormally,
    /// Timeout during startup or shutdown
    #[error("timeout during startup or shutdown")]
    Timeout,
}

/// Executable module
#[async_trait]
pub trait Module {
    /// Executed before running the core loop
    async fn pre_startup(&mut self) -> EmptyResult {
        Ok(())
    }

    /// Core run loop of the module
    ///
    /// When the function returns `Some(_)` the death of the returned [`Heart`] is awaited before calling the shutdown hooks.
    /// Useful for situations where you dispatch background tasks in the run loop but want to hand-off the program lifecycle management.
    ///
    /// Returning `None` results in the program entering a shutdown state right away.
    async fn run(&mut self) -> Result<Option<Heart>, BoxedError>;

    /// Opportunity for modules to wind down their background tasks
    async fn pre_shutdown(&mut self) {}

    /// Shutdown hook executed after the core loop and all associated tasks have terminated
    #[instrument(skip(self))]
    async fn post_shutdown(&mut self, termination_reason: ModuleTerminationReason) {
        match termination_reason {
            ModuleTerminationReason::HeartDied(_) | ModuleTerminationReason::ExitedNormally => {
                info!("Module exited normally")
            }
            _ => error!("Module terminated with an error"),
        }
    }
}

/// Runner for [`Module`] implementations
pub struct ModuleRunner {
    startup_timeout: Duration,
    shutdown_timeout: Duration,
}

impl ModuleRunner {
    /// Creates a new runner with custom timeouts for the startup and shutdown sequences
    pub fn new(startup_timeout: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            startup_timeout,
            shutdown_timeout,
        }
    }
}

impl Default for ModuleRunner {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl ModuleRunner {
    /// Executes a [`Module`] until it exits by calling the corresponding lifecycle functions in order
    #[instrument(skip(self, module), fields(module_name = type_name::<M>()))]
    pub async fn run<M: Module + Send + Sync>(&self, mut module: M) {
        info!("Commencing module startup sequence");
        let startup = timeout(self.startup_timeout, module.pre_startup()).await;

        let termination_reason = match startup {
            Ok(Ok(_)) => self.run_loop(&mut module).await,
            Ok(Err(error)) => {
                error!(?error, "Module startup sequence encountered an error");
                ModuleTerminationReason::StartupFailed(error)
            }
            Err(_) => {
                error!("Module startup sequence timed out");
                ModuleTerminationReason::Timeout
            }
        };

        info!("Running pre-shutdown hook");
        if timeout(self.shutdown_timeout, module.pre_shutdown())
            .await
            .is_err()
        {
            error!("Module pre-shutdown hook timed out");
        }

        info!("Commencing module shutdown sequence");
        let result = timeout(
            self.shutdown_timeout,
            module.post_shutdown(termination_reason),
        )
        .await;

        if result.is_err() {
            error!("Module shutdown sequence timed out");
        }
    }

    #[instrument(skip(self, module))]
    async fn run_loop<M: Module + Send + Sync>(&self, module: &mut M) -> ModuleTerminationReason {
        info!("Executing module run procedure");
        match module.run().await {
            Ok(None) => {
                debug!("Module run procedure completed successfully");
                ModuleTerminationReason::ExitedNormally
            }
            Ok(Some(mut heart)) => {
                debug!("Module run procedure completed successfully, entering run loop");
                let death_reason = heart.death().await;
                info!(?death_reason, "Heart provided by run procedure died");
                ModuleTerminationReason::HeartDied(death_reason)
            }
            Err(error) => {
                info!(?error, "Module run procedure encountered an error");
                ModuleTerminationReason::OperationalError(error)
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::HeartStone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Probe {
        fail_startup: bool,
        stone: Option<HeartStone>,
        ran: Arc<AtomicBool>,
        shut_down: Arc<AtomicBool>,
        reason: Arc<futures::lock::Mutex<Option<String>>>,
    }

    #[async_trait]
    impl Module for Probe {
        async fn pre_startup(&mut self) -> EmptyResult {
            if self.fail_startup {
                Err("startup refused".into())
            } else {
                Ok(())
            }
        }

        async fn run(&mut self) -> Result<Option<Heart>, BoxedError> {
            self.ran.store(true, Ordering::SeqCst);

            let (heart, mut stone) = Heart::new();
            stone.kill("done".into()).await;
            self.stone = Some(stone);

            Ok(Some(heart))
        }

        async fn pre_shutdown(&mut self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }

        async fn post_shutdown(&mut self, termination_reason: ModuleTerminationReason) {
            *self.reason.lock().await = Some(termination_reason.to_string());
        }
    }

    #[tokio::test]
    async fn run_lifecycle_in_order() {
        let probe = Probe::default();
        let (ran, shut_down, reason) = (
            probe.ran.clone(),
            probe.shut_down.clone(),
            probe.reason.clone(),
        );

        ModuleRunner::default().run(probe).await;

        assert!(ran.load(Ordering::SeqCst));
        assert!(shut_down.load(Ordering::SeqCst));
        assert_eq!(
            reason.lock().await.as_deref(),
            Some("heart provided by module died: Killed (done)")
        );
    }

    #[tokio::test]
    async fn skip_run_when_startup_fails() {
        let probe = Probe {
            fail_startup: true,
            ..Default::default()
        };
        let (ran, reason) = (probe.ran.clone(), probe.reason.clone());

        ModuleRunner::default().run(probe).await;

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(
            reason.lock().await.as_deref(),
            Some("startup routine threw an error")
        );
    }
}
