//! TCP server: listener, accept loop and session lifecycle.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::callback::SessionHandler;
use crate::error::ServerError;
use crate::handler::{AcceptHandler, ReadHandler};
use crate::manager::{SessionManager, DEFAULT_DIVIDE};
use crate::session::{Session, DEFAULT_IDLE_TIMEOUT};
use crate::transport::{effective_host, listen_tcp, AddressFamily, ListenOptions, DEFAULT_IPV4_HOST};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket family
    pub family: AddressFamily,
    /// Bind host; an IPv6 server left on `0.0.0.0` binds `::`
    pub host: String,
    /// Bind port; 0 picks an ephemeral port
    pub port: u16,
    /// Pending-connection backlog
    pub backlog: i32,
    /// Bytes read per receive
    pub read_buffer_size: usize,
    /// `SO_RCVBUF` of the listening socket; 0 keeps the system default
    pub receive_buffer_size: usize,
    /// Session table partitions
    pub divide: usize,
    /// Accept IPv4-mapped connections on an IPv6 listener
    pub dual_stack: bool,
    /// Idle timeout of new sessions in milliseconds
    pub idle_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            family: AddressFamily::Ipv4,
            host: DEFAULT_IPV4_HOST.to_string(),
            port: 8710,
            backlog: 1024,
            read_buffer_size: 4096,
            receive_buffer_size: 128 * 1024 * 1024,
            divide: DEFAULT_DIVIDE,
            dual_stack: false,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ServerConfig {
    /// Idle timeout of new sessions
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Resolve the bind address
    pub fn bind_addr(&self) -> Result<SocketAddr, ServerError> {
        let host = effective_host(self.family, &self.host);
        let ip: IpAddr = host.parse().map_err(|source| ServerError::Address {
            host: host.to_string(),
            source,
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// A running server
pub struct Server {
    manager: Arc<SessionManager>,
    read: Arc<ReadHandler>,
    accept: Arc<AcceptHandler>,
}

impl Server {
    /// Bind, start the timeout scanner and close worker, and begin accepting.
    pub async fn start<H: SessionHandler>(
        config: ServerConfig,
        handler: Arc<H>,
    ) -> Result<Self, ServerError> {
        let addr = config.bind_addr()?;
        let options = ListenOptions {
            family: config.family,
            dual_stack: config.dual_stack,
            backlog: config.backlog,
            receive_buffer_size: config.receive_buffer_size,
        };
        let listener = listen_tcp(addr, &options).map_err(|source| ServerError::Listen {
            addr: addr.to_string(),
            source,
        })?;

        let manager = SessionManager::new(config.divide);
        let read = ReadHandler::new(
            handler,
            Arc::clone(&manager),
            config.read_buffer_size,
            config.idle_timeout(),
        );
        manager.start_timeout_task();

        let accept = AcceptHandler::start(listener, Arc::clone(&read)).map_err(|source| {
            ServerError::Listen {
                addr: addr.to_string(),
                source,
            }
        })?;

        info!(
            "Server listening on {} -> divide:{}, read_buffer:{}",
            accept.local_addr(),
            manager.divide(),
            config.read_buffer_size
        );

        Ok(Self {
            manager,
            read,
            accept,
        })
    }

    /// Bound listening address
    pub fn local_addr(&self) -> SocketAddr {
        self.accept.local_addr()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.manager.session_count()
    }

    /// Snapshot of live sessions
    pub fn sessions(&self) -> Vec<Session> {
        self.manager.sessions()
    }

    /// Session manager backing this server
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Resolves once the accept loop has stopped
    pub async fn wait_for(&self) {
        self.accept.wait_for().await;
    }

    /// Stop accepting, close every session with `Shutdown`, and wait for the
    /// close worker to finish. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!("Shutting down server on {}", self.local_addr());
        self.accept.shutdown().await;
        self.manager.shutdown_timeout_task().await;
        self.read.shutdown().await;
        info!("Server on {} stopped", self.local_addr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8710);
        assert_eq!(config.backlog, 1024);
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.divide, 10);
        assert!(!config.dual_stack);
        assert_eq!(config.idle_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_ipv6_bind_addr_uses_unspecified_v6() {
        let config = ServerConfig {
            family: AddressFamily::Ipv6,
            ..Default::default()
        };
        assert_eq!(config.bind_addr().unwrap().to_string(), "[::]:8710");
    }

    #[test]
    fn test_bad_host_is_rejected() {
        let config = ServerConfig {
            host: "not-an-ip".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.bind_addr(), Err(ServerError::Address { .. })));
    }
}
