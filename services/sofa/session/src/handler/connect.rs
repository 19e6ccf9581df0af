//! Client connect path.

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::read::ReadHandler;
use super::split_stream;
use crate::error::ClientError;
use crate::manager::Registration;
use crate::session::{ConnectionId, Session};
use crate::transport::{connect_tcp, AddressFamily};

/// One outbound connection attempt
#[derive(Debug, Clone)]
pub struct ConnectState {
    /// Id the new session is registered under
    pub connection_id: ConnectionId,
    /// Target endpoint
    pub remote: SocketAddr,
    /// Family of the local socket
    pub family: AddressFamily,
}

impl ConnectState {
    /// Attempt to reach `remote` under a fresh connection id
    pub fn new(family: AddressFamily, remote: SocketAddr) -> Self {
        Self {
            connection_id: ConnectionId::new(),
            remote,
            family,
        }
    }
}

/// Opens outbound connections and registers a session for each
pub struct ConnectHandler {
    read: Arc<ReadHandler>,
}

impl ConnectHandler {
    /// Create a handler feeding sessions to `read`
    pub fn new(read: Arc<ReadHandler>) -> Self {
        Self { read }
    }

    /// Connect, register the session, fire `on_open` and start reading.
    ///
    /// No retry: a failed attempt is logged and returned to the caller.
    pub async fn prepare(&self, state: ConnectState) -> Result<Session, ClientError> {
        let manager = self.read.manager();
        if manager.is_shut_down() {
            return Err(ClientError::Shutdown);
        }

        let stream = match connect_tcp(state.family, state.remote).await {
            Ok(stream) => stream,
            Err(source) => {
                warn!("Connect to {} failed: {}", state.remote, source);
                return Err(ClientError::Connect {
                    addr: state.remote.to_string(),
                    source,
                });
            }
        };

        let (parts, reader) = split_stream(stream);
        match manager.generate(state.connection_id, parts) {
            Registration::Created(session) => {
                info!("Connected session:{}", session);
                self.read.open(session.clone(), reader).await;
                Ok(session)
            }
            Registration::Existing(session) => {
                debug!("Connection id already in use by {}", session);
                Err(ClientError::DuplicateConnection(state.connection_id))
            }
            Registration::Rejected => Err(ClientError::Shutdown),
        }
    }

    /// Shut down the owned read handler
    pub async fn shutdown(&self) {
        self.read.shutdown().await;
    }
}
