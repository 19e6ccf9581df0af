//! Callback-driven TCP sessions for sofa: accept/connect/read loops,
//! partitioned session table, idle timeouts and exactly-once close.
//!
//! This crate turns raw TCP sockets into [`Session`]s and reports their
//! lifecycle to a [`SessionHandler`]. For every session the handler sees
//! `on_open`, then zero or more `on_message`, then exactly one `on_close`,
//! never two at once.
//!
//! ## Features
//!
//! - **Server**: listener with backlog, receive buffer and dual-stack options
//! - **Client / MultiClient**: one or many outbound sessions, optionally under
//!   caller-chosen connection ids
//! - **Session Table**: partitioned by connection id, one lock per partition
//! - **Idle Timeouts**: a scanner visits one partition per tick
//! - **Close Queue**: every close trigger funnels through a single worker
//!
//! ## Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use sofa_session::{CloseReason, Server, ServerConfig, Session, SessionHandler};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Counter;
//!
//! #[async_trait]
//! impl SessionHandler for Counter {
//!     async fn on_open(&self, session: &Session) {
//!         session.set_value("inc", 0u32);
//!         session.change_idle_timeout(Duration::from_secs(5));
//!         let _ = session.send_default("inc:0").await;
//!     }
//!
//!     async fn on_message(&self, session: &Session, _message: Bytes) {
//!         let inc = session.value::<u32>("inc").unwrap_or(0) + 1;
//!         session.set_value("inc", inc);
//!         if inc > 3 {
//!             session.close();
//!             return;
//!         }
//!         let _ = session.send_default(format!("inc:{}", inc)).await;
//!     }
//!
//!     async fn on_close(&self, session: &Session, reason: CloseReason) {
//!         println!("{} closed: {}", session, reason);
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::start(ServerConfig::default(), Arc::new(Counter)).await?;
//! println!("Listening on {}", server.local_addr());
//!
//! tokio::signal::ctrl_c().await?;
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attributes;
pub mod callback;
pub mod client;
pub mod close_queue;
pub mod error;
pub mod handler;
pub mod manager;
pub mod multi_client;
pub mod reason;
pub mod server;
pub mod session;
pub mod transport;

// Re-export main types
pub use attributes::Attributes;
pub use callback::SessionHandler;
pub use client::{Client, ClientConfig};
pub use close_queue::{CloseQueue, CloseRequest};
pub use error::{ClientError, SendError, ServerError};
pub use manager::{Registration, SessionManager};
pub use multi_client::{MultiClient, MultiClientConfig, MultiClientConnection};
pub use reason::CloseReason;
pub use server::{Server, ServerConfig};
pub use session::{ConnectionId, Session, DEFAULT_IDLE_TIMEOUT, DEFAULT_SEND_TIMEOUT};
pub use transport::AddressFamily;

#[cfg(test)]
pub(crate) mod test_util {
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    /// A connected pair of loopback sockets
    pub async fn loopback() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    /// Poll `check` for up to two seconds
    pub async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }
}
