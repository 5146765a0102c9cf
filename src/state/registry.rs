//! Connection registry: the single owner of live connection records

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::directory::ChannelDirectory;
use super::router::DeliverySink;
use crate::error::{RelayError, Result};
use crate::types::{ChannelId, ConnectionId, SessionState};

/// One live transport session
#[derive(Clone)]
pub struct Connection {
    pub id: ConnectionId,
    /// Client-declared at join, not unique
    pub user_id: Option<String>,
    pub channel: Option<ChannelId>,
    pub state: SessionState,
    pub connected_at: DateTime<Utc>,
    sink: Arc<dyn DeliverySink>,
}

impl Connection {
    pub fn sink(&self) -> Arc<dyn DeliverySink> {
        self.sink.clone()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("channel", &self.channel)
            .field("state", &self.state)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    directory: Arc<ChannelDirectory>,
}

impl ConnectionRegistry {
    pub fn new(directory: Arc<ChannelDirectory>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            directory,
        }
    }

    /// Register a freshly accepted transport. Starts in `Connecting`.
    pub async fn register(&self, sink: Arc<dyn DeliverySink>) -> ConnectionId {
        let id = ConnectionId::new();
        let connection = Connection {
            id,
            user_id: None,
            channel: None,
            state: SessionState::Connecting,
            connected_at: Utc::now(),
            sink,
        };
        self.connections.write().await.insert(id, connection);
        tracing::debug!("Registered connection {}", id);
        id
    }

    pub async fn lookup(&self, id: ConnectionId) -> Result<Connection> {
        self.connections
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(RelayError::NotFound(id))
    }

    pub async fn sink(&self, id: ConnectionId) -> Result<Arc<dyn DeliverySink>> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(Connection::sink)
            .ok_or(RelayError::NotFound(id))
    }

    /// Apply `f` to a connection under the registry write lock
    pub async fn update<T>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut connections = self.connections.write().await;
        let connection = connections.get_mut(&id).ok_or(RelayError::NotFound(id))?;
        f(connection)
    }

    /// Remove a connection and clear its channel membership before returning.
    ///
    /// Only the first caller for a given id gets `Ok`; later calls see `NotFound`.
    pub async fn remove(&self, id: ConnectionId) -> Result<Connection> {
        let mut connection = self
            .connections
            .write()
            .await
            .remove(&id)
            .ok_or(RelayError::NotFound(id))?;

        self.directory.leave(id).await;
        connection.state = SessionState::Disconnected;
        tracing::debug!("Removed connection {}", id);
        Ok(connection)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::types::Signal;

    struct NullSink;

    #[async_trait::async_trait]
    impl DeliverySink for NullSink {
        async fn deliver(&self, _signal: Arc<Signal>) -> std::result::Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn registry() -> (Arc<ChannelDirectory>, ConnectionRegistry) {
        let directory = Arc::new(ChannelDirectory::new());
        (directory.clone(), ConnectionRegistry::new(directory))
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let (_, registry) = registry();
        let id = registry.register(Arc::new(NullSink)).await;

        let conn = registry.lookup(id).await.unwrap();
        assert_eq!(conn.id, id);
        assert_eq!(conn.state, SessionState::Connecting);
        assert!(conn.user_id.is_none());
        assert!(conn.channel.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_lookup_unknown_is_not_found() {
        let (_, registry) = registry();
        let id = ConnectionId::new();
        assert_eq!(
            registry.lookup(id).await.unwrap_err(),
            RelayError::NotFound(id)
        );
    }

    #[tokio::test]
    async fn test_remove_clears_directory_membership() {
        let (directory, registry) = registry();
        let id = registry.register(Arc::new(NullSink)).await;
        let channel = ChannelId::new("20").unwrap();
        directory.join(&channel, id).await;

        let removed = registry.remove(id).await.unwrap();
        assert_eq!(removed.state, SessionState::Disconnected);
        assert!(directory.members_of(&channel).await.is_empty());
        assert!(registry.lookup(id).await.is_err());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_twice_only_succeeds_once() {
        let (_, registry) = registry();
        let id = registry.register(Arc::new(NullSink)).await;

        assert!(registry.remove(id).await.is_ok());
        assert_eq!(
            registry.remove(id).await.unwrap_err(),
            RelayError::NotFound(id)
        );
    }

    #[tokio::test]
    async fn test_update_is_applied() {
        let (_, registry) = registry();
        let id = registry.register(Arc::new(NullSink)).await;

        registry
            .update(id, |c| {
                c.user_id = Some("alice".to_string());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(
            registry.lookup(id).await.unwrap().user_id.as_deref(),
            Some("alice")
        );
    }
}
