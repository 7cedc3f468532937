use crate::BoxedError;
use futures::lock::Mutex;
use redis::aio::{Connection, ConnectionManager};
use redis::Client;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Factory for redis connections
///
/// Commands that may block (e.g. `XREADGROUP` with `BLOCK`) must use an
/// [`owned`](RedisFactory::owned) connection so they do not stall other users.
/// Everything else goes through a shared, automatically reconnecting connection.
#[derive(Clone)]
pub struct RedisFactory {
    client: Client,
    shared: Arc<OnceCell<ConnectionManager>>,
}

impl RedisFactory {
    /// Creates a new factory for the server at the given URL
    ///
    /// No connection is established until one is requested.
    pub fn new(url: &str) -> Result<Self, BoxedError> {
        Ok(Self {
            client: Client::open(url)?,
            shared: Arc::new(OnceCell::new()),
        })
    }

    /// Establishes an individual connection for long-running, blocking operations
    pub async fn owned(&self) -> Result<Connection, BoxedError> {
        Ok(self.client.get_async_connection().await?)
    }

    /// Retrieves a handle to the shared connection, establishing it if necessary
    pub async fn shared(&self) -> Result<ConnectionManager, BoxedError> {
        let manager = self
            .shared
            .get_or_try_init(|| self.client.get_tokio_connection_manager())
            .await?;

        Ok(manager.clone())
    }
}

/// Cache for a single connection that is lent out for the duration of one command
///
/// A connection is only returned to the slot after its command completed. When the future
/// driving the command is dropped halfway, the connection goes with it instead of being reused
/// with an unread reply pending on the socket.
pub(super) struct ConnectionSlot<C> {
    idle: Mutex<Option<C>>,
}

impl<C> Default for ConnectionSlot<C> {
    fn default() -> Self {
        Self {
            idle: Mutex::new(None),
        }
    }
}

impl<C> ConnectionSlot<C> {
    /// Takes the idle connection, if any
    pub(super) async fn checkout(&self) -> Option<C> {
        self.idle.lock().await.take()
    }

    /// Returns a connection whose last command has completed
    pub(super) async fn checkin(&self, connection: C) {
        *self.idle.lock().await = Some(connection);
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn command(slot: &ConnectionSlot<u32>, duration: Duration) {
        let connection = slot.checkout().await.unwrap_or(0) + 1;
        sleep(duration).await;
        slot.checkin(connection).await;
    }

    #[tokio::test]
    async fn reuse_connection_after_completed_command() {
        let slot = ConnectionSlot::default();

        command(&slot, Duration::from_millis(1)).await;
        command(&slot, Duration::from_millis(1)).await;

        assert_eq!(slot.checkout().await, Some(2));
    }

    #[tokio::test]
    async fn discard_connection_of_cancelled_command() {
        let slot = ConnectionSlot::default();
        slot.checkin(7).await;

        let slow = command(&slot, Duration::from_secs(60));
        assert!(timeout(Duration::from_millis(10), slow).await.is_err());

        assert_eq!(slot.checkout().await, None);
    }
}
