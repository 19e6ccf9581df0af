//! Event handlers driving sessions: accepting, connecting and reading.
//!
//! The read handler owns close finalization. Accept and connect handlers
//! register sessions, fire `on_open` and hand the read half to the read
//! handler.

mod accept;
mod connect;
mod read;

pub use accept::AcceptHandler;
pub use connect::{ConnectHandler, ConnectState};
pub use read::ReadHandler;

use tokio::net::TcpStream;

use crate::session::SessionParts;

/// Split an established stream into session parts and the read half
pub(crate) fn split_stream(stream: TcpStream) -> (SessionParts, tokio::net::tcp::OwnedReadHalf) {
    let local_addr = stream.local_addr().ok();
    let remote_addr = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    (
        SessionParts {
            local_addr,
            remote_addr,
            writer,
        },
        reader,
    )
}
