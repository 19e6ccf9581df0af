//! Many outbound connections sharing one session manager.
//!
//! A [`MultiClient`] bundles a manager, a read handler and a connect handler.
//! Every connection it opens is registered in the same partitioned table and
//! reported to the same callback handler.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::callback::SessionHandler;
use crate::client::parse_remote;
use crate::error::ClientError;
use crate::handler::{ConnectHandler, ConnectState, ReadHandler};
use crate::manager::{SessionManager, DEFAULT_DIVIDE};
use crate::session::{ConnectionId, Session, DEFAULT_IDLE_TIMEOUT};
use crate::transport::AddressFamily;

/// Multi-client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiClientConfig {
    /// Bytes read per receive
    pub read_buffer_size: usize,
    /// Session table partitions
    pub divide: usize,
    /// Idle timeout of new sessions in milliseconds
    pub idle_timeout_ms: u64,
}

impl Default for MultiClientConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 2048,
            divide: DEFAULT_DIVIDE,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
        }
    }
}

/// One connection opened by a [`MultiClient`]
#[derive(Debug, Clone)]
pub struct MultiClientConnection {
    session: Session,
}

impl MultiClientConnection {
    /// Connection id the session is registered under
    pub fn connection_id(&self) -> ConnectionId {
        self.session.connection_id()
    }

    /// The connection's session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Whether the session is still open
    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }
}

/// Shared manager and handlers for many outbound connections
pub struct MultiClient {
    manager: Arc<SessionManager>,
    connect: ConnectHandler,
}

impl MultiClient {
    /// Create the bundle and start its timeout scanner and close worker.
    /// Must be called inside a tokio runtime.
    pub fn new<H: SessionHandler>(config: MultiClientConfig, handler: Arc<H>) -> Self {
        let manager = SessionManager::new(config.divide);
        let read = ReadHandler::new(
            handler,
            Arc::clone(&manager),
            config.read_buffer_size,
            Duration::from_millis(config.idle_timeout_ms),
        );
        manager.start_timeout_task();
        info!("Multi client ready -> divide:{}", manager.divide());

        Self {
            manager,
            connect: ConnectHandler::new(read),
        }
    }

    /// Open a connection to `host:port`.
    ///
    /// With `connection_id` set, the session is registered under that id;
    /// an id that is already live yields [`ClientError::DuplicateConnection`].
    pub async fn connect(
        &self,
        family: AddressFamily,
        host: &str,
        port: u16,
        connection_id: Option<ConnectionId>,
    ) -> Result<MultiClientConnection, ClientError> {
        let remote = parse_remote(host, port)?;
        let mut state = ConnectState::new(family, remote);
        if let Some(connection_id) = connection_id {
            state.connection_id = connection_id;
        }

        let session = self.connect.prepare(state).await?;
        Ok(MultiClientConnection { session })
    }

    /// Close one connection. The close callback fires with `SelfClose`.
    pub fn disconnect(&self, connection: &MultiClientConnection) {
        debug!("Disconnect {}", connection.session);
        connection.session.close();
    }

    /// Look up a live session by connection id
    pub fn session(&self, connection_id: ConnectionId) -> Option<Session> {
        self.manager.get(connection_id)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.manager.session_count()
    }

    /// Close every connection with `Shutdown` and stop the background tasks
    pub async fn shutdown(&self) {
        info!("Shutting down multi client");
        self.manager.shutdown_timeout_task().await;
        self.connect.shutdown().await;
    }
}
