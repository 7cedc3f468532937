//! Trait implementations using [`rdkafka`]

mod log;
mod subscription;

pub use self::log::*;

use rdkafka::ClientConfig;

/// SASL credentials for authenticated clusters
#[derive(Debug, Clone)]
pub struct SaslSettings {
    /// Mechanism, e.g. `PLAIN` or `SCRAM-SHA-512`
    pub mechanism: String,
    /// Username to authenticate as
    pub username: String,
    /// Password for the user
    pub password: String,
}

/// Connection parameters shared by producers, consumers and the admin client
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    /// Comma separated list of `host:port` pairs
    pub bootstrap_servers: String,
    /// Protocol used to communicate with brokers, e.g. `PLAINTEXT` or `SASL_SSL`
    pub security_protocol: String,
    /// Credentials, only applied if present
    pub sasl: Option<SaslSettings>,
    /// Client identifier reported to the brokers
    pub client_id: String,
}

impl KafkaSettings {
    /// Base configuration every client is created from
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("security.protocol", &self.security_protocol)
            .set("client.id", &self.client_id);

        if let Some(sasl) = &self.sasl {
            config
                .set("sasl.mechanism", &sasl.mechanism)
                .set("sasl.username", &sasl.username)
                .set("sasl.password", &sasl.password);
        }

        config
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = self.client_config();
        config
            .set("message.max.bytes", "1000000")
            .set("compression.type", "snappy")
            .set("retries", "5")
            .set("retry.backoff.ms", "500");
        config
    }

    fn consumer_config(&self, group: &str) -> ClientConfig {
        let mut config = self.client_config();
        config
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");
        config
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings(sasl: Option<SaslSettings>) -> KafkaSettings {
        KafkaSettings {
            bootstrap_servers: "localhost:9092".into(),
            security_protocol: "PLAINTEXT".into(),
            sasl,
            client_id: "queue-relay".into(),
        }
    }

    #[test]
    fn omit_sasl_without_credentials() {
        let config = settings(None).client_config();

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("sasl.mechanism"), None);
    }

    #[test]
    fn apply_sasl_credentials() {
        let config = settings(Some(SaslSettings {
            mechanism: "PLAIN".into(),
            username: "relay".into(),
            password: "secret".into(),
        }))
        .client_config();

        assert_eq!(config.get("sasl.mechanism"), Some("PLAIN"));
        assert_eq!(config.get("sasl.username"), Some("relay"));
    }

    #[test]
    fn disable_auto_commit_for_consumers() {
        let config = settings(None).consumer_config("analytics-processor");

        assert_eq!(config.get("group.id"), Some("analytics-processor"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
    }
}
