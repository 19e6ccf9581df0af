//! Close queue feeding the close worker.
//!
//! Any trigger (timeout scan, self close, shutdown sweep) pushes a
//! [`CloseRequest`]; a single worker owned by the session manager drains it.

use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::reason::CloseReason;
use crate::session::Session;

/// A request to finalize one session
#[derive(Clone)]
pub struct CloseRequest {
    /// Session to close
    pub session: Session,
    /// Why it is closing
    pub reason: CloseReason,
}

impl CloseRequest {
    /// Create a request
    pub fn new(session: Session, reason: CloseReason) -> Self {
        Self { session, reason }
    }
}

impl fmt::Debug for CloseRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseRequest")
            .field("connection_id", &self.session.connection_id())
            .field("reason", &self.reason)
            .finish()
    }
}

/// Producer side; cheap to clone
#[derive(Clone, Debug)]
pub struct CloseQueue {
    tx: mpsc::UnboundedSender<CloseRequest>,
}

/// Consumer side, owned by the close worker
#[derive(Debug)]
pub struct CloseReceiver {
    rx: mpsc::UnboundedReceiver<CloseRequest>,
}

/// Create a connected queue pair
pub fn close_queue() -> (CloseQueue, CloseReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CloseQueue { tx }, CloseReceiver { rx })
}

impl CloseQueue {
    /// Enqueue a request. Returns false once the worker has gone away.
    pub fn push(&self, request: CloseRequest) -> bool {
        match self.tx.send(request) {
            Ok(()) => true,
            Err(e) => {
                debug!("Close queue is closed, dropping {:?}", e.0);
                false
            }
        }
    }
}

impl CloseReceiver {
    /// Wait for the next request
    pub async fn next(&mut self) -> Option<CloseRequest> {
        self.rx.recv().await
    }

    /// Take a request if one is already queued
    pub fn try_next(&mut self) -> Option<CloseRequest> {
        self.rx.try_recv().ok()
    }
}
