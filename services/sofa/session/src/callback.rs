//! Callback contract invoked by the accept/connect/read handlers.
//!
//! There is a single async method set. Synchronous handlers simply do their
//! work inline and return; there is no separate sync mode to detect.
//!
//! For any one session the engine never runs two of these concurrently, and
//! runs them in event order: `on_open`, zero or more `on_message`, then exactly
//! one `on_close`. A handler that blocks stalls only its own session.

use async_trait::async_trait;
use bytes::Bytes;

use crate::reason::CloseReason;
use crate::session::Session;

/// Trait for handling session events
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// The session was registered. Runs before any message is delivered.
    async fn on_open(&self, _session: &Session) {}

    /// A chunk of bytes arrived. Chunks are not message-delimited: several
    /// sends from the peer may arrive together, or one send may be split.
    async fn on_message(&self, session: &Session, message: Bytes);

    /// The session closed. Fires exactly once per session.
    async fn on_close(&self, _session: &Session, _reason: CloseReason) {}
}
