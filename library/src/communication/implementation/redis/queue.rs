use super::super::json::JsonQueue;
use super::factory::ConnectionSlot;
use super::{RedisFactory, RedisStreamError, STREAM_ID_ADDITIONS, STREAM_ID_HEAD, STREAM_ID_NEW};
use crate::communication::queue::{AckToken, MessageId, RawQueue, RawQueueMessage};
use crate::BoxedError;
use async_trait::async_trait;
use chrono::Utc;
use lazy_static::lazy_static;
use redis::aio::Connection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const FIELD_MESSAGE_ID: &str = "message_id";
const FIELD_BODY: &str = "body";
const FIELD_SENT_TIMESTAMP: &str = "sent_timestamp";

const ATTRIBUTE_RECEIVE_COUNT: &str = "ApproximateReceiveCount";
const ATTRIBUTE_SENT_TIMESTAMP: &str = "SentTimestamp";

const CONSUMER_GROUP: &str = "queue-consumers";
const TOKEN_DELIMITER: char = '|';

lazy_static! {
    static ref ACKNOWLEDGE_SCRIPT: Script = Script::new(include_str!("acknowledge.lua"));
}

/// Splits an acknowledgement token into the stream entry id and the delivery id
fn split_token(token: &AckToken) -> Result<(&str, &str), RedisStreamError> {
    token
        .as_str()
        .split_once(TOKEN_DELIMITER)
        .filter(|(entry, delivery)| !entry.is_empty() && !delivery.is_empty())
        .ok_or_else(|| RedisStreamError::MalformedToken(token.to_string()))
}

fn join_token(entry_id: &str, delivery_id: &str) -> AckToken {
    AckToken::new(format!("{}{}{}", entry_id, TOKEN_DELIMITER, delivery_id))
}

/// `XPENDING` limited to deliveries that have been idle for at least `min_idle` milliseconds
///
/// Redis applies the filter before the count so expired entries are found no matter how many
/// younger deliveries precede them. Requires Redis 6.2 or newer.
fn expired_deliveries(key: &str, min_idle: usize, count: usize) -> redis::Cmd {
    let mut cmd = redis::cmd("XPENDING");
    cmd.arg(key)
        .arg(CONSUMER_GROUP)
        .arg("IDLE")
        .arg(min_idle)
        .arg("-")
        .arg("+")
        .arg(count);
    cmd
}

fn millis(duration: Duration) -> usize {
    duration.as_millis().try_into().unwrap_or(usize::MAX)
}

/// Queue simulated on top of a single redis stream
///
/// Messages are appended with `XADD` and handed out through a consumer group. Deliveries which
/// have not been acknowledged within the visibility timeout are claimed again and handed out
/// with a fresh token. Acknowledging removes the entry from the stream entirely, which keeps
/// `XLEN` equal to the number of messages that still await processing.
pub struct RedisStreamQueue {
    factory: RedisFactory,
    key: String,
    deliveries_key: String,
    consumer: String,
    visibility_timeout: Duration,
    reader: ConnectionSlot<Connection>,
    group_ready: AtomicBool,
}

impl RedisStreamQueue {
    /// Creates a new instance operating on the stream with the given name
    pub fn new(factory: RedisFactory, queue: &str, visibility_timeout: Duration) -> Self {
        Self {
            factory,
            key: queue.to_owned(),
            deliveries_key: format!("{}.deliveries", queue),
            consumer: Uuid::new_v4().to_string(),
            visibility_timeout,
            reader: ConnectionSlot::default(),
            group_ready: AtomicBool::new(false),
        }
    }

    async fn ensure_group(&self) -> Result<(), BoxedError> {
        if self.group_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut con = self.factory.shared().await?;

        // Fails if the group already exists which is fine
        con.xgroup_create_mkstream::<_, _, _, ()>(&self.key, CONSUMER_GROUP, STREAM_ID_HEAD)
            .await
            .ok();

        self.group_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Claims deliveries whose visibility timeout has expired
    async fn reclaim_expired(
        &self,
        max_count: usize,
    ) -> Result<Vec<(StreamId, usize)>, BoxedError> {
        let mut con = self.factory.shared().await?;
        let min_idle = millis(self.visibility_timeout);

        let pending: StreamPendingCountReply = expired_deliveries(&self.key, min_idle, max_count)
            .query_async(&mut con)
            .await?;

        let expired: HashMap<String, usize> = pending
            .ids
            .into_iter()
            .map(|entry| (entry.id, entry.times_delivered))
            .collect();

        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&String> = expired.keys().collect();
        let claimed: StreamClaimReply = con
            .xclaim(&self.key, CONSUMER_GROUP, &self.consumer, min_idle, ids.as_slice())
            .await?;

        debug!(count = claimed.ids.len(), "Reclaimed expired deliveries");

        Ok(claimed
            .ids
            .into_iter()
            .map(|entry| {
                let deliveries = expired.get(&entry.id).copied().unwrap_or_default() + 1;
                (entry, deliveries)
            })
            .collect())
    }

    /// Reads entries that have never been delivered, blocking for up to `wait` if given
    async fn read_new(
        &self,
        max_count: usize,
        wait: Option<Duration>,
    ) -> Result<Vec<(StreamId, usize)>, BoxedError> {
        let mut options = StreamReadOptions::default()
            .group(CONSUMER_GROUP, &self.consumer)
            .count(max_count);

        // A block duration of zero would block indefinitely
        if let Some(wait) = wait.map(millis).filter(|ms| *ms > 0) {
            options = options.block(wait);
        }

        // Cancelled reads drop the connection, failed ones are not handed back either
        let mut con = match self.reader.checkout().await {
            Some(con) => con,
            None => self.factory.owned().await?,
        };

        let reply = con
            .xread_options::<_, _, Option<StreamReadReply>>(
                &[&self.key],
                &[STREAM_ID_ADDITIONS],
                &options,
            )
            .await?;

        self.reader.checkin(con).await;

        Ok(reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|stream| stream.ids)
            .map(|entry| (entry, 1))
            .collect())
    }

    /// Records the current delivery of each entry and assembles the messages
    async fn register_deliveries(
        &self,
        entries: Vec<(StreamId, usize)>,
    ) -> Result<Vec<RawQueueMessage>, BoxedError> {
        let mut pipe = redis::pipe();
        let mut messages = Vec::with_capacity(entries.len());

        for (entry, deliveries) in entries {
            let delivery_id = Uuid::new_v4().to_string();
            pipe.hset(&self.deliveries_key, &entry.id, &delivery_id)
                .ignore();
            messages.push(build_message(entry, &delivery_id, deliveries));
        }

        if !messages.is_empty() {
            let mut con = self.factory.shared().await?;
            pipe.query_async::<_, ()>(&mut con).await?;
        }

        Ok(messages)
    }
}

fn build_message(entry: StreamId, delivery_id: &str, deliveries: usize) -> RawQueueMessage {
    let id: String = entry
        .get(FIELD_MESSAGE_ID)
        .unwrap_or_else(|| entry.id.clone());

    let body: String = entry.get(FIELD_BODY).unwrap_or_else(|| {
        warn!(entry = %entry.id, "Stream entry is missing its body");
        String::new()
    });

    let mut attributes = HashMap::new();
    attributes.insert(ATTRIBUTE_RECEIVE_COUNT.to_owned(), deliveries.to_string());
    if let Some(sent) = entry.get::<String>(FIELD_SENT_TIMESTAMP) {
        attributes.insert(ATTRIBUTE_SENT_TIMESTAMP.to_owned(), sent);
    }

    RawQueueMessage {
        id: MessageId::new(id),
        body,
        ack_token: join_token(&entry.id, delivery_id),
        attributes,
        custom_attributes: HashMap::new(),
    }
}

#[async_trait]
impl RawQueue for RedisStreamQueue {
    /// Receives messages using the following steps:
    ///
    /// 1. Create the stream and/or consumer group if it does not exist
    /// 2. Claim deliveries whose visibility timeout expired
    /// 3. Fill up the batch with new entries, blocking only if nothing was claimed
    #[instrument(skip(self), fields(queue = %self.key))]
    async fn receive_raw(
        &self,
        max_count: usize,
        wait: Duration,
    ) -> Result<Vec<RawQueueMessage>, BoxedError> {
        self.ensure_group().await?;

        let mut entries = self.reclaim_expired(max_count).await?;

        if entries.len() < max_count {
            let wait = if entries.is_empty() { Some(wait) } else { None };
            let fresh = self.read_new(max_count - entries.len(), wait).await?;
            entries.extend(fresh);
        }

        self.register_deliveries(entries).await
    }

    async fn delete_raw(&self, token: &AckToken) -> Result<bool, BoxedError> {
        let (entry_id, delivery_id) = split_token(token)?;
        let mut con = self.factory.shared().await?;

        let deleted: i32 = ACKNOWLEDGE_SCRIPT
            .key(&self.key)
            .key(&self.deliveries_key)
            .arg(entry_id)
            .arg(delivery_id)
            .arg(CONSUMER_GROUP)
            .invoke_async(&mut con)
            .await?;

        Ok(deleted == 1)
    }

    async fn send_raw(&self, body: &str) -> Result<MessageId, BoxedError> {
        let id = Uuid::new_v4().to_string();
        let sent = Utc::now().timestamp_millis().to_string();
        let mut con = self.factory.shared().await?;

        con.xadd::<_, _, _, _, String>(
            &self.key,
            STREAM_ID_NEW,
            &[
                (FIELD_MESSAGE_ID, id.as_str()),
                (FIELD_BODY, body),
                (FIELD_SENT_TIMESTAMP, sent.as_str()),
            ],
        )
        .await?;

        Ok(MessageId::new(id))
    }

    async fn depth_raw(&self) -> Result<u64, BoxedError> {
        let mut con = self.factory.shared().await?;
        Ok(con.xlen(&self.key).await?)
    }
}

impl JsonQueue for RedisStreamQueue {}
