//! Trait implementations using [`aws_sdk_sqs`]

use super::json::JsonQueue;
use crate::communication::queue::{AckToken, MessageId, RawQueue, RawQueueMessage};
use crate::BoxedError;
use async_trait::async_trait;
use aws_sdk_sqs::config::{Builder as SqsConfigBuilder, Credentials, Region};
use aws_sdk_sqs::types::{Message, MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Maximum long-poll duration accepted by the service
const MAX_WAIT_SECONDS: u64 = 20;

#[derive(Debug, Error)]
enum SqsError {
    #[error("no AWS credentials found, configure them explicitly or through the environment")]
    MissingCredentials,
    #[error("queue returned a message without an identifier")]
    MissingMessageId,
    #[error("queue returned a message without a receipt handle")]
    MissingReceiptHandle,
}

/// Connection parameters for the queue service
#[derive(Debug, Clone)]
pub struct SqsSettings {
    /// URL of the queue to operate on
    pub queue_url: String,
    /// Region the queue lives in
    pub region: String,
    /// Explicit credentials as `(access key id, secret access key)`, the default chain is used otherwise
    pub credentials: Option<(String, String)>,
    /// Alternative endpoint, e.g. for local emulators
    pub endpoint: Option<String>,
}

/// Queue backed by the AWS Simple Queue Service
pub struct SqsQueue {
    client: Client,
    queue_url: String,
}

impl SqsQueue {
    /// Builds a client from the given settings
    pub async fn connect(settings: SqsSettings) -> Result<Self, BoxedError> {
        let mut builder = SqsConfigBuilder::new()
            .behavior_version(aws_sdk_sqs::config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));

        // Explicit credentials take precedence over the default chain
        if let Some((access_key, secret_key)) = settings.credentials {
            let credentials = Credentials::new(access_key, secret_key, None, None, "queue-relay");
            builder = builder.credentials_provider(credentials);
        } else {
            let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(Region::new(settings.region.clone()))
                .load()
                .await;
            let provider = aws_config
                .credentials_provider()
                .ok_or(SqsError::MissingCredentials)?
                .clone();
            builder = builder.credentials_provider(provider);
        }

        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            queue_url: settings.queue_url,
        })
    }
}

fn convert_message(message: &Message) -> Result<RawQueueMessage, SqsError> {
    let id = message.message_id().ok_or(SqsError::MissingMessageId)?;
    let token = message
        .receipt_handle()
        .ok_or(SqsError::MissingReceiptHandle)?;

    let attributes = message
        .attributes()
        .map(|attributes| {
            attributes
                .iter()
                .map(|(key, value)| (key.as_str().to_owned(), value.clone()))
                .collect()
        })
        .unwrap_or_default();

    let custom_attributes = message
        .message_attributes()
        .map(|attributes| {
            attributes
                .iter()
                .filter_map(|(key, value)| {
                    value
                        .string_value()
                        .map(|value| (key.clone(), value.to_owned()))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(RawQueueMessage {
        id: MessageId::new(id),
        body: message.body().unwrap_or_default().to_owned(),
        ack_token: AckToken::new(token),
        attributes,
        custom_attributes,
    })
}

#[async_trait]
impl RawQueue for SqsQueue {
    #[instrument(skip(self))]
    async fn receive_raw(
        &self,
        max_count: usize,
        wait: Duration,
    ) -> Result<Vec<RawQueueMessage>, BoxedError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(i32::try_from(max_count)?)
            .wait_time_seconds(wait.as_secs().min(MAX_WAIT_SECONDS) as i32)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All")
            .send()
            .await?;

        let messages = output
            .messages()
            .iter()
            .map(convert_message)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(count = messages.len(), "Received batch");
        Ok(messages)
    }

    async fn delete_raw(&self, token: &AckToken) -> Result<bool, BoxedError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(token.as_str())
            .send()
            .await?;

        Ok(true)
    }

    async fn send_raw(&self, body: &str) -> Result<MessageId, BoxedError> {
        let output = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await?;

        let id = output.message_id().ok_or(SqsError::MissingMessageId)?;
        Ok(MessageId::new(id))
    }

    async fn depth_raw(&self) -> Result<u64, BoxedError> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await?;

        let empty = HashMap::new();
        let attributes = output.attributes().unwrap_or(&empty);

        let mut depth = 0;
        for name in &[
            QueueAttributeName::ApproximateNumberOfMessages,
            QueueAttributeName::ApproximateNumberOfMessagesNotVisible,
        ] {
            if let Some(value) = attributes.get(name) {
                depth += value.parse::<u64>()?;
            }
        }

        Ok(depth)
    }
}

impl JsonQueue for SqsQueue {}
