//! Single-connection TCP client.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::callback::SessionHandler;
use crate::error::ClientError;
use crate::handler::{ConnectHandler, ConnectState, ReadHandler};
use crate::manager::SessionManager;
use crate::session::{Session, DEFAULT_IDLE_TIMEOUT};
use crate::transport::AddressFamily;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Family of the local socket
    pub family: AddressFamily,
    /// Target host, as an IP address
    pub host: String,
    /// Target port
    pub port: u16,
    /// Bytes read per receive
    pub read_buffer_size: usize,
    /// Idle timeout of the session in milliseconds
    pub idle_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            family: AddressFamily::Ipv4,
            host: "127.0.0.1".to_string(),
            port: 8710,
            read_buffer_size: 2048,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ClientConfig {
    /// Idle timeout of the session
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Resolve the target address
    pub fn remote_addr(&self) -> Result<SocketAddr, ClientError> {
        parse_remote(&self.host, self.port)
    }
}

pub(crate) fn parse_remote(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    let ip: IpAddr = host.parse().map_err(|source| ClientError::Address {
        host: host.to_string(),
        source,
    })?;
    Ok(SocketAddr::new(ip, port))
}

/// A connected client owning exactly one session
pub struct Client {
    manager: Arc<SessionManager>,
    connect: ConnectHandler,
    session: Session,
}

impl Client {
    /// Connect to the configured server. `on_open` has run when this returns.
    pub async fn connect<H: SessionHandler>(
        config: ClientConfig,
        handler: Arc<H>,
    ) -> Result<Self, ClientError> {
        let remote = config.remote_addr()?;

        let manager = SessionManager::new(1);
        let read = ReadHandler::new(
            handler,
            Arc::clone(&manager),
            config.read_buffer_size,
            config.idle_timeout(),
        );
        let connect = ConnectHandler::new(read);

        let session = match connect.prepare(ConnectState::new(config.family, remote)).await {
            Ok(session) => session,
            Err(e) => {
                connect.shutdown().await;
                return Err(e);
            }
        };
        manager.start_timeout_task();

        Ok(Self {
            manager,
            connect,
            session,
        })
    }

    /// The client's session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Whether the session is still live
    pub fn is_connected(&self) -> bool {
        self.manager.session_count() > 0
    }

    /// Close the session with `Shutdown` and stop the background tasks
    pub async fn disconnect(&self) {
        info!("Disconnecting {}", self.session);
        self.manager.shutdown_timeout_task().await;
        self.connect.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.read_buffer_size, 2048);
        assert_eq!(config.family, AddressFamily::Ipv4);
        assert_eq!(config.remote_addr().unwrap().to_string(), "127.0.0.1:8710");
    }

    #[test]
    fn test_host_must_be_ip() {
        let config = ClientConfig {
            host: "localhost".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.remote_addr(), Err(ClientError::Address { .. })));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        struct Ignore;
        #[async_trait::async_trait]
        impl SessionHandler for Ignore {
            async fn on_message(&self, _session: &Session, _message: bytes::Bytes) {}
        }

        let config = ClientConfig {
            port,
            ..Default::default()
        };
        let result = Client::connect(config, Arc::new(Ignore)).await;
        assert!(matches!(result, Err(ClientError::Connect { .. })));
    }
}
