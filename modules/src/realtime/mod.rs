//! Reader raising alerts for relayed messages as they arrive

mod alerts;
mod processor;

pub use alerts::*;
pub use processor::*;

use crate::options::{LogOptions, RedisOptions};
use crate::reader::{Reader, RecordProcessor};
use async_trait::async_trait;
use harness::{Heart, Module};
use library::BoxedError;
use std::sync::Arc;
use structopt::StructOpt;
use tracing::{debug, instrument};

/// Consumer group the real-time reader joins
pub const CONSUMER_GROUP: &str = "realtime-processor";

/// Options for the real-time module
#[derive(Debug, StructOpt)]
pub struct Options {
    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub redis: RedisOptions,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub log: LogOptions,
}

/// Module implementation
pub struct Realtime {
    options: Options,
    reader: Option<Reader<RealtimeProcessor>>,
}

impl Realtime {
    /// Creates a new instance from raw parts
    pub fn new(options: Options) -> Self {
        Self {
            options,
            reader: None,
        }
    }
}

#[async_trait]
impl Module for Realtime {
    #[instrument(skip(self))]
    async fn run(&mut self) -> Result<Option<Heart>, BoxedError> {
        let subscriber = self
            .options
            .log
            .subscriber(&self.options.redis, CONSUMER_GROUP)?;

        let reader = Reader::new(
            subscriber,
            self.options.log.topic.clone(),
            CONSUMER_GROUP,
            Arc::new(RealtimeProcessor::default()),
        );

        debug!("Starting reader");
        reader.start().await;
        self.reader = Some(reader);

        Ok(Some(Heart::without_heart_stone()))
    }

    async fn pre_shutdown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.stop().await;
            reader.processor().log_metrics().await;
        }
    }
}
