//! Close reasons reported to `on_close`.

use std::fmt;

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The peer closed the connection (zero-byte read, reset, or a socket torn down underneath a read).
    PeerClose,
    /// Local code called [`Session::close`](crate::Session::close), or a send failed.
    SelfClose,
    /// The read loop hit an I/O error other than a graceful disconnect.
    Failed,
    /// The idle deadline elapsed without traffic.
    Timeout,
    /// The owning server or client was shut down.
    Shutdown,
}

impl CloseReason {
    /// Classify a read error.
    ///
    /// Resets and aborts are the peer going away, not a local failure.
    pub fn from_read_error(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => CloseReason::PeerClose,
            _ => CloseReason::Failed,
        }
    }

    /// Static label, used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::PeerClose => "PeerClose",
            CloseReason::SelfClose => "SelfClose",
            CloseReason::Failed => "Failed",
            CloseReason::Timeout => "Timeout",
            CloseReason::Shutdown => "Shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
