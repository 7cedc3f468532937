//! Relay moving messages from a queue into a partitioned log, controlled over HTTP

mod engine;
mod message;
mod metrics;
mod options;
mod server;

pub use engine::*;
pub use message::*;
pub use metrics::*;
pub use options::Options;
pub use server::{routes, AdminCredentials};

use async_trait::async_trait;
use futures::channel::oneshot;
use harness::{Heart, Module};
use library::BoxedError;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

struct RunningServer {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Module implementation
pub struct Relay {
    options: Options,
    engine: Option<Arc<RelayEngine>>,
    server: Option<RunningServer>,
}

impl Relay {
    /// Creates a new instance from raw parts
    pub fn new(options: Options) -> Self {
        Self {
            options,
            engine: None,
            server: None,
        }
    }
}

#[async_trait]
impl Module for Relay {
    #[instrument(skip(self))]
    async fn run(&mut self) -> Result<Option<Heart>, BoxedError> {
        debug!("Connecting to backends");
        let queue = self.options.queue.connect(&self.options.redis).await?;
        let log = self.options.log.publisher(
            &self.options.redis,
            self.options.topic_spec(),
            "queue-relay",
        )?;

        let engine = Arc::new(RelayEngine::new(queue, log, self.options.relay_config()));

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let (addr, server) = warp::serve(routes(engine.clone(), self.options.credentials()))
            .try_bind_with_graceful_shutdown(self.options.address(), async {
                shutdown_rx.await.ok();
            })?;

        info!(?addr, "Serving control surface");
        let handle = tokio::spawn(server);

        if self.options.autostart {
            engine.start().await;
        }

        self.engine = Some(engine);
        self.server = Some(RunningServer { shutdown, handle });

        Ok(Some(Heart::without_heart_stone()))
    }

    async fn pre_shutdown(&mut self) {
        if let Some(engine) = self.engine.take() {
            if engine.is_running() {
                debug!("Stopping relay");
                engine.stop().await;
            }
        }

        if let Some(server) = self.server.take() {
            debug!("Gracefully shutting down HTTP server");
            server.shutdown.send(()).ok();

            if let Err(error) = server.handle.await {
                warn!(%error, "HTTP server terminated abnormally");
            }
        }
    }
}
