use super::{AdminCredentials, RelayConfig};
use crate::options::{LogOptions, QueueOptions, RedisOptions};
use library::communication::log::TopicSpec;
use library::communication::queue::MAX_RECEIVE_BATCH;
use library::helpers::parse_seconds;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use structopt::StructOpt;

/// Options for the relay module
#[derive(Debug, StructOpt)]
pub struct Options {
    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub redis: RedisOptions,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub queue: QueueOptions,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub log: LogOptions,

    /// Address the control surface binds to
    #[structopt(long, env = "APP_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port the control surface listens on
    #[structopt(long, env = "APP_PORT", default_value = "5000")]
    pub port: u16,

    /// Username accepted by the admin login
    #[structopt(long, env, default_value = "admin")]
    pub admin_username: String,

    /// Password accepted by the admin login
    #[structopt(long, env, default_value = "admin", hide_env_values = true)]
    pub admin_password: String,

    /// Tag written into the source field of every record
    #[structopt(long, env, default_value = "aws-sqs")]
    pub source_tag: String,

    /// Maximum number of messages pulled at once, values above ten are capped
    #[structopt(long, env, default_value = "10")]
    pub batch_size: usize,

    /// Seconds a single receive call waits for messages
    #[structopt(long, env, default_value = "20", parse(try_from_str = parse_seconds))]
    pub receive_wait: Duration,

    /// Seconds to wait for the log to confirm a batch
    #[structopt(long, env, default_value = "10", parse(try_from_str = parse_seconds))]
    pub flush_timeout: Duration,

    /// Seconds to pause after an empty or failed batch
    #[structopt(long, env, default_value = "5", parse(try_from_str = parse_seconds))]
    pub poll_interval: Duration,

    /// Seconds the relay may take to finish its current batch when being stopped
    #[structopt(long, env, default_value = "10", parse(try_from_str = parse_seconds))]
    pub stop_timeout: Duration,

    /// Number of partitions used when the topic is created
    #[structopt(long, env, default_value = "3")]
    pub topic_partitions: u32,

    /// Replication factor used when the topic is created
    #[structopt(long, env, default_value = "3")]
    pub topic_replication: u32,

    /// Copy queue attributes into the published records
    #[structopt(long, env, default_value = "false", parse(try_from_str))]
    pub forward_attributes: bool,

    /// Start relaying right away instead of waiting for the control surface
    #[structopt(long, env, default_value = "false", parse(try_from_str))]
    pub autostart: bool,
}

impl Options {
    /// Layout used for topics created by the relay
    pub fn topic_spec(&self) -> TopicSpec {
        TopicSpec::new(self.topic_partitions, self.topic_replication)
    }

    /// Tuning parameters of the relay loop
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            topic: self.log.topic.clone(),
            source: self.source_tag.clone(),
            batch_size: self.batch_size.min(MAX_RECEIVE_BATCH),
            receive_wait: self.receive_wait,
            flush_timeout: self.flush_timeout,
            backoff: self.poll_interval,
            stop_timeout: self.stop_timeout,
            topic_spec: self.topic_spec(),
            forward_attributes: self.forward_attributes,
        }
    }

    /// Login accepted by the admin endpoint
    pub fn credentials(&self) -> AdminCredentials {
        AdminCredentials {
            username: self.admin_username.clone(),
            password: self.admin_password.clone(),
        }
    }

    /// Socket address of the control surface
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn derive_relay_config() {
        let options = Options::from_iter_safe(&[
            "relay",
            "--topic",
            "events",
            "--batch-size",
            "25",
            "--poll-interval",
            "1",
            "--forward-attributes",
            "true",
        ])
        .unwrap();

        let config = options.relay_config();

        assert_eq!(config.topic, "events");
        assert_eq!(config.batch_size, MAX_RECEIVE_BATCH);
        assert_eq!(config.backoff, Duration::from_secs(1));
        assert!(config.forward_attributes);
    }

    #[test]
    fn bind_to_configured_address() {
        let options =
            Options::from_iter_safe(&["relay", "--host", "127.0.0.1", "--port", "8080"]).unwrap();

        assert_eq!(options.address(), "127.0.0.1:8080".parse().unwrap());
    }
}
