//! Front/back TCP relay built on a server and a multi client.
//!
//! Each accepted front session gets a fresh connection id and a backend
//! connection opened through the shared [`MultiClient`] under the same id.
//! The pair meets in a [`Space`] keyed by that id. Bytes for a side that has
//! not attached yet are queued and flushed on attach. When either side
//! closes, the other is closed too.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sofa_session::{
    AddressFamily, CloseReason, ConnectionId, MultiClient, Session, SessionHandler,
    DEFAULT_SEND_TIMEOUT,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{component_debug, component_info, component_warn};

const CONNECTION_ID_KEY: &str = "connection_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Front,
    Back,
}

#[derive(Default)]
struct SpaceState {
    front: Option<Session>,
    back: Option<Session>,
    to_front: VecDeque<Bytes>,
    to_back: VecDeque<Bytes>,
}

impl SpaceState {
    fn side(&mut self, side: Side) -> (&mut Option<Session>, &mut VecDeque<Bytes>) {
        match side {
            Side::Front => (&mut self.front, &mut self.to_front),
            Side::Back => (&mut self.back, &mut self.to_back),
        }
    }
}

/// Meeting point of one front/back pair.
///
/// The lock is held across sends so queued bytes always go out before
/// anything sent after them.
#[derive(Default)]
pub struct Space {
    state: Mutex<SpaceState>,
}

impl Space {
    /// Attach `session` as `side` and flush what was queued for it
    async fn attach(&self, side: Side, session: Session) {
        let mut state = self.state.lock().await;
        let (slot, queue) = state.side(side);
        while let Some(message) = queue.pop_front() {
            if let Err(e) = session.send(&message, DEFAULT_SEND_TIMEOUT).await {
                warn!("Flush to {:?} failed: {}", side, e);
                queue.clear();
                break;
            }
            debug!("Flush proxy -> {:?} ({})", side, message.len());
        }
        *slot = Some(session);
    }

    /// Send toward `side`, queueing while it is not attached
    async fn send(&self, side: Side, message: Bytes) {
        let mut state = self.state.lock().await;
        let (slot, queue) = state.side(side);
        match slot {
            Some(session) => {
                let len = message.len();
                if let Err(e) = session.send(&message, DEFAULT_SEND_TIMEOUT).await {
                    warn!("Send to {:?} failed: {}", side, e);
                } else {
                    debug!("Send proxy -> {:?} ({})", side, len);
                }
            }
            None => queue.push_back(message),
        }
    }

    /// Detach `session` from whichever side it holds and close the other side.
    /// Returns true once both sides are gone.
    async fn detach(&self, session: &Session) -> bool {
        let mut state = self.state.lock().await;
        let (closed, other) = if state.front.as_ref().is_some_and(|s| s.ptr_eq(session)) {
            (Side::Front, Side::Back)
        } else if state.back.as_ref().is_some_and(|s| s.ptr_eq(session)) {
            (Side::Back, Side::Front)
        } else {
            return state.front.is_none() && state.back.is_none();
        };

        let (slot, queue) = state.side(closed);
        *slot = None;
        queue.clear();
        if let (Some(peer), _) = state.side(other) {
            peer.close();
        }
        state.front.is_none() && state.back.is_none()
    }

    #[cfg(test)]
    async fn queued(&self, side: Side) -> usize {
        let mut state = self.state.lock().await;
        state.side(side).1.len()
    }
}

/// Spaces by connection id
#[derive(Default)]
pub struct FrontBackHolder {
    spaces: DashMap<ConnectionId, Arc<Space>>,
}

impl FrontBackHolder {
    fn allocate(&self, connection_id: ConnectionId) -> Arc<Space> {
        Arc::clone(self.spaces.entry(connection_id).or_default().value())
    }

    fn get(&self, connection_id: ConnectionId) -> Option<Arc<Space>> {
        self.spaces.get(&connection_id).map(|space| Arc::clone(space.value()))
    }

    async fn release(&self, connection_id: ConnectionId, session: &Session) {
        let Some(space) = self.get(connection_id) else {
            return;
        };
        if space.detach(session).await {
            component_debug!("proxy", "Release space {}", connection_id);
            self.spaces.remove(&connection_id);
        }
    }

    /// Number of live pairs
    pub fn pair_count(&self) -> usize {
        self.spaces.len()
    }
}

/// Server-side callbacks: front connections
pub struct FrontHandler {
    holder: Arc<FrontBackHolder>,
    multi_client: Arc<MultiClient>,
    backends: Vec<SocketAddr>,
    family: AddressFamily,
    forward_no: AtomicUsize,
}

impl FrontHandler {
    pub fn new(
        holder: Arc<FrontBackHolder>,
        multi_client: Arc<MultiClient>,
        backends: Vec<SocketAddr>,
        family: AddressFamily,
    ) -> Self {
        Self {
            holder,
            multi_client,
            backends,
            family,
            forward_no: AtomicUsize::new(0),
        }
    }

    fn next_backend(&self) -> Option<SocketAddr> {
        if self.backends.is_empty() {
            return None;
        }
        let index = self.forward_no.fetch_add(1, Ordering::Relaxed) % self.backends.len();
        Some(self.backends[index])
    }
}

#[async_trait]
impl SessionHandler for FrontHandler {
    async fn on_open(&self, session: &Session) {
        let Some(backend) = self.next_backend() else {
            component_warn!("proxy", "No backend configured, closing {}", session);
            session.close();
            return;
        };

        let connection_id = ConnectionId::new();
        session.set_value(CONNECTION_ID_KEY, connection_id);
        component_info!("proxy", "Front open {} -> backend:{}", session, backend);

        let space = self.holder.allocate(connection_id);
        space.attach(Side::Front, session.clone()).await;

        let connected = self
            .multi_client
            .connect(
                self.family,
                &backend.ip().to_string(),
                backend.port(),
                Some(connection_id),
            )
            .await;
        if let Err(e) = connected {
            component_warn!("proxy", "Backend {} unavailable: {}", backend, e);
            session.close();
        }
    }

    async fn on_message(&self, session: &Session, message: Bytes) {
        let Some(connection_id) = session.value::<ConnectionId>(CONNECTION_ID_KEY) else {
            return;
        };
        if let Some(space) = self.holder.get(connection_id) {
            space.send(Side::Back, message).await;
        }
    }

    async fn on_close(&self, session: &Session, reason: CloseReason) {
        let Some(connection_id) = session.value::<ConnectionId>(CONNECTION_ID_KEY) else {
            return;
        };
        component_info!("proxy", "Front close {}, reason:{}", connection_id, reason);
        self.holder.release(connection_id, session).await;
    }
}

/// Multi-client callbacks: backend connections
pub struct BackHandler {
    holder: Arc<FrontBackHolder>,
}

impl BackHandler {
    pub fn new(holder: Arc<FrontBackHolder>) -> Self {
        Self { holder }
    }
}

#[async_trait]
impl SessionHandler for BackHandler {
    async fn on_open(&self, session: &Session) {
        match self.holder.get(session.connection_id()) {
            Some(space) => {
                component_info!("proxy", "Back open {}", session);
                space.attach(Side::Back, session.clone()).await;
            }
            None => {
                component_debug!("proxy", "Front already gone, closing {}", session);
                session.close();
            }
        }
    }

    async fn on_message(&self, session: &Session, message: Bytes) {
        if let Some(space) = self.holder.get(session.connection_id()) {
            space.send(Side::Front, message).await;
        }
    }

    async fn on_close(&self, session: &Session, reason: CloseReason) {
        component_info!(
            "proxy",
            "Back close {}, reason:{}",
            session.connection_id(),
            reason
        );
        self.holder.release(session.connection_id(), session).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sofa_session::{Client, ClientConfig, MultiClientConfig, Server, ServerConfig};
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl SessionHandler for Echo {
        async fn on_message(&self, session: &Session, message: Bytes) {
            let _ = session.send_default(message).await;
        }
    }

    struct Collect {
        received: parking_lot::Mutex<Vec<u8>>,
    }

    #[async_trait]
    impl SessionHandler for Collect {
        async fn on_message(&self, _session: &Session, message: Bytes) {
            self.received.lock().extend_from_slice(&message);
        }
    }

    fn local_server() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            receive_buffer_size: 0,
            ..Default::default()
        }
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_holder_allocates_once() {
        let holder = FrontBackHolder::default();
        let id = ConnectionId::new();
        let first = holder.allocate(id);
        let second = holder.allocate(id);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(holder.pair_count(), 1);

        first.send(Side::Back, Bytes::from_static(b"early")).await;
        assert_eq!(first.queued(Side::Back).await, 1);
        assert_eq!(first.queued(Side::Front).await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_relay_round_trip() {
        let backend = Server::start(local_server(), Arc::new(Echo)).await.unwrap();

        let holder = Arc::new(FrontBackHolder::default());
        let multi_client = Arc::new(MultiClient::new(
            MultiClientConfig::default(),
            Arc::new(BackHandler::new(Arc::clone(&holder))),
        ));
        let proxy = Server::start(
            local_server(),
            Arc::new(FrontHandler::new(
                Arc::clone(&holder),
                Arc::clone(&multi_client),
                vec![backend.local_addr()],
                AddressFamily::Ipv4,
            )),
        )
        .await
        .unwrap();

        let collect = Arc::new(Collect {
            received: parking_lot::Mutex::new(Vec::new()),
        });
        let client = Client::connect(
            ClientConfig {
                port: proxy.local_addr().port(),
                ..Default::default()
            },
            Arc::clone(&collect),
        )
        .await
        .unwrap();

        client.session().send_default(b"ping through proxy").await.unwrap();
        assert!(eventually(|| collect.received.lock().as_slice() == b"ping through proxy").await);
        assert_eq!(multi_client.session_count(), 1);

        // Closing the front closes the back and frees the space
        client.disconnect().await;
        assert!(eventually(|| multi_client.session_count() == 0).await);
        assert!(eventually(|| holder.pair_count() == 0).await);

        proxy.shutdown().await;
        multi_client.shutdown().await;
        backend.shutdown().await;
    }
}
