//! Various options usable by modules
//!
//! The structs in this module allow other modules to flatten them into
//! their own options struct. This allows for a unified yet non-cluttered
//! option set.

use library::communication::implementation::memory::{MemoryLog, MemoryQueue};
use library::communication::implementation::redis::{
    RedisFactory, RedisStreamLog, RedisStreamQueue,
};
#[cfg(feature = "kafka")]
use library::communication::implementation::kafka::{KafkaLog, KafkaSettings, SaslSettings};
use library::communication::log::{SharedLog, SharedSubscriber, TopicSpec};
use library::communication::queue::SharedQueue;
use library::helpers::parse_seconds;
use library::BoxedError;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use thiserror::Error;
use tracing::debug;

/// Errors raised while building a backend from its options
#[derive(Debug, Error)]
pub enum BackendError {
    /// Name of the backend is unknown
    #[error("unknown backend `{0}`, expected one of: {1}")]
    Unknown(String, &'static str),
    /// Support for the backend has not been compiled in
    #[error("the {0} backend requires building with the `{0}` feature")]
    Disabled(&'static str),
    /// Backend keeps its data within the process and can not be shared with other modules
    #[error("the {0} backend is local to a single process, select a shared backend instead")]
    ProcessLocal(&'static str),
    /// Backend requires a setting which has not been provided
    #[error("the {backend} backend requires {setting} to be set")]
    MissingSetting {
        /// Backend which has been selected
        backend: &'static str,
        /// Name of the environment variable that is missing
        setting: &'static str,
    },
}

/// Options for connecting to the Redis server
#[derive(Debug, StructOpt)]
pub struct RedisOptions {
    /// Redis database server URL
    #[structopt(
        short = "r",
        long = "redis",
        env = "REDIS",
        global = true,
        default_value = "redis://localhost/",
        value_name = "url"
    )]
    pub url: String,
}

impl RedisOptions {
    fn factory(&self) -> Result<RedisFactory, BoxedError> {
        RedisFactory::new(&self.url)
    }
}

/// Transport used for the source queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    /// Process local queue, lost on exit
    ///
    /// No other process can send to it, so it only serves to try out the control surface.
    Memory,
    /// Simulated queue on top of a Redis stream
    Redis,
    /// AWS Simple Queue Service
    Sqs,
}

impl FromStr for QueueBackend {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "sqs" => Ok(Self::Sqs),
            _ => Err(BackendError::Unknown(s.to_owned(), "memory, redis, sqs")),
        }
    }
}

/// Transport used for the partitioned log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogBackend {
    /// Process local log, lost on exit
    ///
    /// Only usable by the relay itself, the readers run in their own processes and refuse it.
    Memory,
    /// One Redis stream per partition
    Redis,
    /// Kafka cluster
    Kafka,
}

impl FromStr for LogBackend {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "kafka" => Ok(Self::Kafka),
            _ => Err(BackendError::Unknown(s.to_owned(), "memory, redis, kafka")),
        }
    }
}

/// Options for the queue messages are pulled from
#[derive(Debug, StructOpt)]
pub struct QueueOptions {
    /// Queue implementation to use [memory, redis, sqs]
    #[structopt(
        name = "queue-backend",
        long = "queue-backend",
        env = "QUEUE_BACKEND",
        default_value = "redis",
        value_name = "backend"
    )]
    pub backend: QueueBackend,

    /// Name of the stream backing the simulated queue
    #[structopt(long, env, default_value = "sqs-queue-1")]
    pub simulated_queue: String,

    /// Seconds a received message stays invisible before it is handed out again.
    /// Only applies to the simulated queues, SQS uses the timeout configured on the queue.
    #[structopt(long, env, default_value = "30", parse(try_from_str = parse_seconds))]
    pub visibility_timeout: Duration,

    /// URL of the SQS queue
    #[structopt(long, env)]
    pub sqs_queue_url: Option<String>,

    /// Region the SQS queue lives in
    #[structopt(long, env = "AWS_REGION", default_value = "us-east-1")]
    pub aws_region: String,

    /// Alternative SQS endpoint, e.g. for local emulators
    #[structopt(long, env)]
    pub sqs_endpoint: Option<String>,

    /// Access key used instead of the default AWS credential chain
    #[structopt(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub aws_access_key_id: Option<String>,

    /// Secret key used instead of the default AWS credential chain
    #[structopt(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub aws_secret_access_key: Option<String>,
}

impl QueueOptions {
    /// Instantiates the configured queue
    pub async fn connect(&self, redis: &RedisOptions) -> Result<SharedQueue, BoxedError> {
        debug!(backend = ?self.backend, "Connecting to queue");

        match self.backend {
            QueueBackend::Memory => Ok(Arc::new(MemoryQueue::new(self.visibility_timeout))),
            QueueBackend::Redis => Ok(Arc::new(RedisStreamQueue::new(
                redis.factory()?,
                &self.simulated_queue,
                self.visibility_timeout,
            ))),
            QueueBackend::Sqs => self.connect_sqs().await,
        }
    }

    #[cfg(feature = "sqs")]
    async fn connect_sqs(&self) -> Result<SharedQueue, BoxedError> {
        use library::communication::implementation::sqs::{SqsQueue, SqsSettings};

        let queue_url = self
            .sqs_queue_url
            .clone()
            .ok_or(BackendError::MissingSetting {
                backend: "sqs",
                setting: "SQS_QUEUE_URL",
            })?;

        let credentials = self
            .aws_access_key_id
            .clone()
            .zip(self.aws_secret_access_key.clone());

        let settings = SqsSettings {
            queue_url,
            region: self.aws_region.clone(),
            credentials,
            endpoint: self.sqs_endpoint.clone(),
        };

        Ok(Arc::new(SqsQueue::connect(settings).await?))
    }

    #[cfg(not(feature = "sqs"))]
    async fn connect_sqs(&self) -> Result<SharedQueue, BoxedError> {
        Err(BackendError::Disabled("sqs").into())
    }
}

/// Options for the partitioned log messages are published to
#[derive(Debug, StructOpt)]
pub struct LogOptions {
    /// Log implementation to use [memory, redis, kafka]
    #[structopt(
        name = "log-backend",
        long = "log-backend",
        env = "LOG_BACKEND",
        default_value = "redis",
        value_name = "backend"
    )]
    pub backend: LogBackend,

    /// Topic records are published to and read from
    #[structopt(long, env = "KAFKA_TOPIC", default_value = "sqs-data")]
    pub topic: String,

    /// Comma separated list of Kafka brokers
    #[structopt(long, env, default_value = "localhost:9092")]
    pub kafka_bootstrap_servers: String,

    /// Protocol used to communicate with the Kafka brokers
    #[structopt(long, env, default_value = "PLAINTEXT")]
    pub kafka_security_protocol: String,

    /// SASL mechanism, credentials are only used if all SASL options are set
    #[structopt(long, env)]
    pub kafka_sasl_mechanism: Option<String>,

    /// SASL username
    #[structopt(long, env)]
    pub kafka_sasl_username: Option<String>,

    /// SASL password
    #[structopt(long, env, hide_env_values = true)]
    pub kafka_sasl_password: Option<String>,

    /// Approximate number of records kept per partition by the Redis log
    #[structopt(long, env, default_value = "100000")]
    pub log_retention: usize,
}

impl LogOptions {
    /// Instantiates the configured log for publishing, topics are created with the given layout
    pub fn publisher(
        &self,
        redis: &RedisOptions,
        default_spec: TopicSpec,
        client_id: &str,
    ) -> Result<SharedLog, BoxedError> {
        debug!(backend = ?self.backend, "Connecting to log");

        match self.backend {
            LogBackend::Memory => Ok(Arc::new(MemoryLog::new(default_spec))),
            LogBackend::Redis => Ok(Arc::new(RedisStreamLog::new(
                redis.factory()?,
                default_spec,
                self.log_retention,
            ))),
            LogBackend::Kafka => self.kafka_publisher(client_id),
        }
    }

    /// Instantiates the configured log for reading through consumer groups
    pub fn subscriber(
        &self,
        redis: &RedisOptions,
        client_id: &str,
    ) -> Result<SharedSubscriber, BoxedError> {
        debug!(backend = ?self.backend, "Connecting to log");

        match self.backend {
            LogBackend::Memory => Err(BackendError::ProcessLocal("memory").into()),
            LogBackend::Redis => Ok(Arc::new(RedisStreamLog::new(
                redis.factory()?,
                TopicSpec::default(),
                self.log_retention,
            ))),
            LogBackend::Kafka => self.kafka_subscriber(client_id),
        }
    }

    #[cfg(feature = "kafka")]
    fn kafka_settings(&self, client_id: &str) -> KafkaSettings {
        let sasl = match (
            &self.kafka_sasl_mechanism,
            &self.kafka_sasl_username,
            &self.kafka_sasl_password,
        ) {
            (Some(mechanism), Some(username), Some(password)) => Some(SaslSettings {
                mechanism: mechanism.clone(),
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };

        KafkaSettings {
            bootstrap_servers: self.kafka_bootstrap_servers.clone(),
            security_protocol: self.kafka_security_protocol.clone(),
            sasl,
            client_id: client_id.to_owned(),
        }
    }

    #[cfg(feature = "kafka")]
    fn kafka_publisher(&self, client_id: &str) -> Result<SharedLog, BoxedError> {
        Ok(Arc::new(KafkaLog::new(self.kafka_settings(client_id))?))
    }

    #[cfg(feature = "kafka")]
    fn kafka_subscriber(&self, client_id: &str) -> Result<SharedSubscriber, BoxedError> {
        Ok(Arc::new(KafkaLog::new(self.kafka_settings(client_id))?))
    }

    #[cfg(not(feature = "kafka"))]
    fn kafka_publisher(&self, _client_id: &str) -> Result<SharedLog, BoxedError> {
        Err(BackendError::Disabled("kafka").into())
    }

    #[cfg(not(feature = "kafka"))]
    fn kafka_subscriber(&self, _client_id: &str) -> Result<SharedSubscriber, BoxedError> {
        Err(BackendError::Disabled("kafka").into())
    }
}
