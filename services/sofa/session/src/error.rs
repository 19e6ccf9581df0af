//! Error types surfaced to callers of the session engine.

use std::net::AddrParseError;
use std::time::Duration;
use thiserror::Error;

use crate::session::ConnectionId;

/// Errors starting a server
#[derive(Error, Debug)]
pub enum ServerError {
    /// Host string is not an IP address
    #[error("invalid host '{host}': {source}")]
    Address {
        /// The rejected host
        host: String,
        /// Parse failure
        #[source]
        source: AddrParseError,
    },

    /// Socket creation, option, bind or listen failed
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        /// The address we tried to bind
        addr: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },
}

/// Errors opening an outbound connection
#[derive(Error, Debug)]
pub enum ClientError {
    /// Host string is not an IP address
    #[error("invalid host '{host}': {source}")]
    Address {
        /// The rejected host
        host: String,
        /// Parse failure
        #[source]
        source: AddrParseError,
    },

    /// The TCP connect failed
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Target address
        addr: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// A live session already uses this connection id
    #[error("connection id {0} is already registered")]
    DuplicateConnection(ConnectionId),

    /// The client has been shut down
    #[error("client is shut down")]
    Shutdown,
}

/// Errors sending on a session. The session is force-closed before this is returned.
#[derive(Error, Debug)]
pub enum SendError {
    /// The write did not complete within the timeout
    #[error("send of {len} bytes to {session} timed out after {timeout:?}")]
    Timeout {
        /// Session description
        session: String,
        /// Payload length
        len: usize,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// The socket write failed
    #[error("send of {len} bytes to {session} failed: {source}")]
    Io {
        /// Session description
        session: String,
        /// Payload length
        len: usize,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// A synchronous send was attempted outside a multi-thread runtime
    #[error("blocking send requires a multi-thread tokio runtime")]
    Runtime,
}
