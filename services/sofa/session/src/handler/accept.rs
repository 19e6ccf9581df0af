//! Server accept loop.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::read::ReadHandler;
use super::split_stream;
use crate::manager::Registration;
use crate::session::ConnectionId;

/// Pause after a failed accept so a persistent error (e.g. descriptor
/// exhaustion) does not spin the loop
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Accepts connections and registers a session for each
pub struct AcceptHandler {
    read: Arc<ReadHandler>,
    local_addr: SocketAddr,
    token: CancellationToken,
    stopped: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AcceptHandler {
    /// Start accepting on `listener`
    pub fn start(listener: TcpListener, read: Arc<ReadHandler>) -> std::io::Result<Arc<Self>> {
        let local_addr = listener.local_addr()?;
        let accept = Arc::new(Self {
            read,
            local_addr,
            token: CancellationToken::new(),
            stopped: CancellationToken::new(),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(Arc::clone(&accept).run(listener));
        *accept.task.lock() = Some(task);
        Ok(accept)
    }

    /// Bound address of the listener
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn run(self: Arc<Self>, listener: TcpListener) {
        info!("Start accepting on {}", self.local_addr);

        loop {
            let accepted = tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    debug!("Accepted TCP connection from {}", remote);
                    let accept = Arc::clone(&self);
                    tokio::spawn(async move { accept.complete(stream).await });
                }
                Err(e) => {
                    if self.token.is_cancelled() {
                        break;
                    }
                    warn!("Accept error on {}: {}", self.local_addr, e);
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
            }
        }

        drop(listener);
        info!("Stop accepting on {}", self.local_addr);
        self.stopped.cancel();
    }

    async fn complete(&self, stream: TcpStream) {
        let (parts, reader) = split_stream(stream);
        let manager = self.read.manager();
        match manager.generate(ConnectionId::new(), parts) {
            Registration::Created(session) => self.read.open(session, reader).await,
            Registration::Existing(session) => {
                warn!("Connection id collision with {}, dropping socket", session);
            }
            Registration::Rejected => debug!("Dropping connection accepted during shutdown"),
        }
    }

    /// Resolves once the accept loop has exited
    pub async fn wait_for(&self) {
        self.stopped.cancelled().await;
    }

    /// Cancel the accept loop and wait for it to exit. The listening socket
    /// is closed when this returns.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Accept task ended abnormally: {}", e);
            }
        }
        info!("Shutdown accept handler on {}", self.local_addr);
    }
}
