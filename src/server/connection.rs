//! Request-scoped tenant connections.
//!
//! Every request that needs the database opens its own connection with the
//! credentials it was routed to and releases it before the response is sent.
//! Connections are never pooled across requests because two requests may
//! belong to two different tenants.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::routing::ConnectionDescriptor;
use crate::db::TenantStore;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("connecting to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    #[error("connecting to {target} failed: {cause}")]
    Failed { target: String, cause: String },
}

/// Establishes a live connection for a resolved descriptor.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn TenantStore>, ConnectionError>;
}

#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    timeout: Duration,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, timeout: Duration) -> Self {
        Self { connector, timeout }
    }

    /// Open a connection bounded by the establishment timeout.
    pub async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<ScopedConnection, ConnectionError> {
        let target = descriptor.to_string();

        match tokio::time::timeout(self.timeout, self.connector.connect(descriptor)).await {
            Ok(Ok(store)) => {
                debug!(tenant = %target, "opened request connection");
                Ok(ScopedConnection {
                    store: Some(store),
                    target,
                    opened_at: Instant::now(),
                })
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ConnectionError::Timeout {
                target,
                timeout: self.timeout,
            }),
        }
    }
}

/// A connection owned by exactly one request.
///
/// Call [`ScopedConnection::release`] once the request's work is done, whatever
/// its outcome. If the request unwinds first, dropping the handle closes the
/// socket.
pub struct ScopedConnection {
    store: Option<Box<dyn TenantStore>>,
    target: String,
    opened_at: Instant,
}

impl ScopedConnection {
    pub fn store(&mut self) -> &mut dyn TenantStore {
        // `release` consumes the handle, so the store is present until then.
        self.store
            .as_deref_mut()
            .expect("request connection used after release")
    }

    pub async fn release(mut self) {
        if let Some(store) = self.store.take() {
            if let Err(err) = store.close().await {
                warn!(tenant = %self.target, error = %err, "closing request connection failed");
            }
            debug!(
                tenant = %self.target,
                held_ms = self.opened_at.elapsed().as_millis() as u64,
                "released request connection"
            );
        }
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        if self.store.take().is_some() {
            warn!(tenant = %self.target, "request connection dropped without release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{MemoryConnector, MemoryState};

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: "localhost".into(),
            port: 5432,
            database: "site".into(),
            user: "postgres".into(),
            password: String::new(),
        }
    }

    #[tokio::test]
    async fn release_closes_the_connection() {
        let connector = MemoryConnector::new(MemoryState::shared());
        let manager = ConnectionManager::new(Arc::new(connector.clone()), DEFAULT_CONNECT_TIMEOUT);

        let conn = manager.open(&descriptor()).await.unwrap();
        assert_eq!(connector.open_connections(), 1);

        conn.release().await;
        assert_eq!(connector.open_connections(), 0);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn drop_without_release_still_closes() {
        let connector = MemoryConnector::new(MemoryState::shared());
        let manager = ConnectionManager::new(Arc::new(connector.clone()), DEFAULT_CONNECT_TIMEOUT);

        {
            let _conn = manager.open(&descriptor()).await.unwrap();
            assert_eq!(connector.open_connections(), 1);
        }

        assert_eq!(connector.open_connections(), 0);
    }

    #[tokio::test]
    async fn slow_connect_times_out() {
        let connector =
            MemoryConnector::new(MemoryState::shared()).with_connect_delay(Duration::from_secs(60));
        let manager = ConnectionManager::new(Arc::new(connector), Duration::from_millis(20));

        let err = manager.open(&descriptor()).await.err().unwrap();

        assert!(matches!(err, ConnectionError::Timeout { .. }));
    }

    #[tokio::test]
    async fn refused_connection_carries_cause() {
        let connector = MemoryConnector::new(MemoryState::shared()).refusing("password authentication failed");
        let manager = ConnectionManager::new(Arc::new(connector), DEFAULT_CONNECT_TIMEOUT);

        let err = manager.open(&descriptor()).await.err().unwrap();

        assert_eq!(
            err,
            ConnectionError::Failed {
                target: "postgres@localhost:5432/site".into(),
                cause: "password authentication failed".into(),
            }
        );
    }
}
