//! Per-connection session state.
//!
//! A [`Session`] is a cheap clonable handle. The engine keeps one copy in the
//! session table and hands references to callbacks, which may clone it to
//! keep talking to the peer from elsewhere.
//!
//! Two locks live on every session:
//! - `state` guards flags, attributes and the idle deadline. It is a plain
//!   mutex held only for short, non-async sections, so callbacks can call
//!   `set_value`/`close` while their own dispatch is in progress.
//! - `dispatch` is held across every callback invocation and the close
//!   finalization, so one session never runs two callbacks at once and its
//!   callbacks run in event order.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::attributes::Attributes;
use crate::close_queue::{CloseQueue, CloseRequest};
use crate::error::SendError;
use crate::reason::CloseReason;

/// Idle timeout applied to new sessions
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout used by [`Session::send_default`]
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(1500);

/// Identity of one logical connection.
///
/// Unlike the OS socket handle, a connection id is never reused by the
/// system; it is the key of the session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Partition index for a table split `divide` ways
    pub fn partition(&self, divide: usize) -> usize {
        let divide = divide.max(1) as u128;
        (self.0.as_u128() % divide) as usize
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for ConnectionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Socket pieces a session is built from
pub struct SessionParts {
    /// Local endpoint, if the socket reported one
    pub local_addr: Option<SocketAddr>,
    /// Remote endpoint, if the socket reported one
    pub remote_addr: Option<SocketAddr>,
    /// Write half; the read half stays with the read loop
    pub writer: OwnedWriteHalf,
}

/// Mutable session state, guarded by the state lock
#[derive(Debug)]
struct SessionState {
    attributes: Attributes,
    idle_timeout: Duration,
    /// `None` until the first refresh; a session that was never refreshed cannot time out
    deadline: Option<Instant>,
    self_closed: bool,
    close_callback_fired: bool,
    shutdown_requested: bool,
    timeout_requested: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            attributes: Attributes::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            deadline: None,
            self_closed: false,
            close_callback_fired: false,
            shutdown_requested: false,
            timeout_requested: false,
        }
    }

    fn is_open(&self) -> bool {
        !self.close_callback_fired && !self.shutdown_requested && !self.self_closed
    }

    fn is_timeout(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if now > deadline)
    }

    fn refresh(&mut self, now: Instant) {
        self.deadline = Some(now + self.idle_timeout);
    }
}

struct SessionInner {
    connection_id: ConnectionId,
    partition: usize,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    state: Mutex<SessionState>,
    dispatch: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Cancelled once the socket is released; stops the read loop
    released: CancellationToken,
    close_queue: CloseQueue,
}

/// Handle to one connection, shared by the engine and callback code
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        connection_id: ConnectionId,
        partition: usize,
        parts: SessionParts,
        close_queue: CloseQueue,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                connection_id,
                partition,
                local_addr: parts.local_addr,
                remote_addr: parts.remote_addr,
                state: Mutex::new(SessionState::new()),
                dispatch: tokio::sync::Mutex::new(()),
                writer: tokio::sync::Mutex::new(Some(parts.writer)),
                released: CancellationToken::new(),
                close_queue,
            }),
        }
    }

    /// Connection id
    pub fn connection_id(&self) -> ConnectionId {
        self.inner.connection_id
    }

    /// Local endpoint
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Remote endpoint
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// True until the session self-closes, is asked to shut down, or its close callback fires
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().is_open()
    }

    /// Whether both handles refer to the same session
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Close the session.
    ///
    /// Idempotent. Message delivery stops immediately; the close callback
    /// fires later, with [`CloseReason::SelfClose`], from the close worker.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.is_open() {
                return;
            }
            state.self_closed = true;
        }
        debug!("Self close requested for {}", self);
        self.inner
            .close_queue
            .push(CloseRequest::new(self.clone(), CloseReason::SelfClose));
    }

    /// Change the idle timeout and restart the idle clock
    pub fn change_idle_timeout(&self, idle_timeout: Duration) {
        let mut state = self.inner.state.lock();
        state.idle_timeout = idle_timeout;
        state.refresh(Instant::now());
    }

    /// Current idle timeout
    pub fn idle_timeout(&self) -> Duration {
        self.inner.state.lock().idle_timeout
    }

    /// Store a value under `name`, replacing any previous value
    pub fn set_value<T: Any + Send + Sync>(&self, name: impl Into<String>, value: T) {
        self.inner.state.lock().attributes.set(name, value);
    }

    /// Clone out the value under `name` if it exists and is a `T`
    pub fn value<T: Any + Clone>(&self, name: &str) -> Option<T> {
        self.inner.state.lock().attributes.get::<T>(name).cloned()
    }

    /// Run `f` against the value under `name` without cloning it.
    ///
    /// The state lock is held while `f` runs. Do not call back into this
    /// session from `f`, and do not touch the session table (`SessionManager::get`,
    /// `sessions`, `session_count` on a server or client): the timeout scanner
    /// takes a partition lock and then session state locks, so the reverse
    /// order can deadlock.
    pub fn with_value<T: Any, R>(&self, name: &str, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut state = self.inner.state.lock();
        f(state.attributes.get_mut::<T>(name))
    }

    /// Remove the value under `name`
    pub fn clear_value(&self, name: &str) -> bool {
        self.inner.state.lock().attributes.remove(name)
    }

    /// Whether any value is stored under `name`
    pub fn has_value(&self, name: &str) -> bool {
        self.inner.state.lock().attributes.contains(name)
    }

    /// Send bytes, waiting at most `timeout`.
    ///
    /// A no-op once the session is no longer open. On timeout or socket error
    /// the session is force-closed and the error returned.
    pub async fn send(&self, message: impl AsRef<[u8]>, timeout: Duration) -> Result<(), SendError> {
        if !self.is_open() {
            return Ok(());
        }

        let message = message.as_ref();
        let write = async {
            let mut writer = self.inner.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => writer.write_all(message).await.map(|()| true),
                None => Ok(false),
            }
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(true)) => {
                debug!("Send to {} ({})", self, message.len());
                Ok(())
            }
            Ok(Ok(false)) => Ok(()),
            Ok(Err(source)) => {
                debug!("Send to {} failed: {}", self, source);
                self.close();
                Err(SendError::Io {
                    session: self.to_string(),
                    len: message.len(),
                    source,
                })
            }
            Err(_) => {
                debug!("Send to {} timed out after {:?}", self, timeout);
                self.close();
                Err(SendError::Timeout {
                    session: self.to_string(),
                    len: message.len(),
                    timeout,
                })
            }
        }
    }

    /// Send UTF-8 text
    pub async fn send_str(&self, message: &str, timeout: Duration) -> Result<(), SendError> {
        self.send(message.as_bytes(), timeout).await
    }

    /// Send bytes with [`DEFAULT_SEND_TIMEOUT`]
    pub async fn send_default(&self, message: impl AsRef<[u8]>) -> Result<(), SendError> {
        self.send(message, DEFAULT_SEND_TIMEOUT).await
    }

    /// Synchronous send for non-async call sites.
    ///
    /// Must run on a multi-thread tokio runtime; elsewhere it returns
    /// [`SendError::Runtime`] without touching the socket.
    pub fn send_blocking(&self, message: impl AsRef<[u8]>, timeout: Duration) -> Result<(), SendError> {
        let handle = Handle::try_current().map_err(|_| SendError::Runtime)?;
        if handle.runtime_flavor() != RuntimeFlavor::MultiThread {
            return Err(SendError::Runtime);
        }
        tokio::task::block_in_place(|| handle.block_on(self.send(message, timeout)))
    }

    pub(crate) fn partition(&self) -> usize {
        self.inner.partition
    }

    /// Serializes callback dispatch for this session
    pub(crate) async fn lock_dispatch(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.dispatch.lock().await
    }

    /// Restart the idle clock
    pub(crate) fn update_timeout(&self) {
        self.inner.state.lock().refresh(Instant::now());
    }

    /// Mark that a timeout close was requested. Returns true once, when the
    /// deadline has passed and the session is neither self-closed nor closed.
    pub(crate) fn request_timeout(&self, now: Instant) -> bool {
        let mut state = self.inner.state.lock();
        if state.self_closed
            || state.close_callback_fired
            || state.timeout_requested
            || !state.is_timeout(now)
        {
            return false;
        }
        state.timeout_requested = true;
        true
    }

    /// Whether a received chunk may be handed to `on_message`
    pub(crate) fn can_deliver(&self) -> bool {
        let state = self.inner.state.lock();
        !state.self_closed && !state.close_callback_fired && !state.is_timeout(Instant::now())
    }

    /// Mark that a shutdown close was requested. Returns false when the session
    /// self-closed or was already asked.
    pub(crate) fn request_shutdown(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.self_closed || state.shutdown_requested {
            return false;
        }
        state.shutdown_requested = true;
        true
    }

    /// Check-and-set of the close-fired flag. True exactly once per session.
    pub(crate) fn mark_close_fired(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.close_callback_fired {
            return false;
        }
        state.close_callback_fired = true;
        true
    }

    pub(crate) fn close_fired(&self) -> bool {
        self.inner.state.lock().close_callback_fired
    }

    /// Resolves once the socket has been released
    pub(crate) fn released(&self) -> CancellationToken {
        self.inner.released.clone()
    }

    /// Release the socket: stop the read loop and shut the write side down
    pub(crate) async fn release(&self) {
        self.inner.released.cancel();
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown of {} write side failed: {}", self, e);
            }
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId:{}, Local:", self.inner.connection_id)?;
        match self.inner.local_addr {
            Some(addr) => write!(f, "{}", addr)?,
            None => f.write_str("-")?,
        }
        f.write_str(", Remote:")?;
        match self.inner.remote_addr {
            Some(addr) => write!(f, "{}", addr),
            None => f.write_str("-"),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.inner.connection_id)
            .field("local_addr", &self.inner.local_addr)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close_queue::close_queue;
    use crate::test_util::loopback;
    use tokio::io::AsyncReadExt;

    async fn session_pair() -> (Session, tokio::net::TcpStream, crate::close_queue::CloseReceiver) {
        let (local, peer) = loopback().await;
        let (queue, rx) = close_queue();
        let parts = SessionParts {
            local_addr: local.local_addr().ok(),
            remote_addr: local.peer_addr().ok(),
            writer: local.into_split().1,
        };
        (Session::new(ConnectionId::new(), 0, parts, queue), peer, rx)
    }

    #[test]
    fn test_partition_is_stable() {
        let id = ConnectionId::new();
        assert_eq!(id.partition(10), id.partition(10));
        assert!(id.partition(10) < 10);
        assert_eq!(id.partition(1), 0);
        assert_eq!(id.partition(0), 0);
    }

    #[tokio::test]
    async fn test_never_refreshed_session_does_not_time_out() {
        let (session, _peer, _rx) = session_pair().await;
        let later = Instant::now() + Duration::from_secs(3600);
        assert!(!session.request_timeout(later));

        session.update_timeout();
        assert!(session.request_timeout(later));
    }

    #[tokio::test]
    async fn test_change_idle_timeout_moves_deadline() {
        let (session, _peer, _rx) = session_pair().await;
        session.change_idle_timeout(Duration::from_millis(0));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!session.can_deliver());

        session.change_idle_timeout(Duration::from_secs(60));
        assert!(!session.request_timeout(Instant::now()));
        assert!(session.can_deliver());
    }

    #[tokio::test]
    async fn test_timeout_requested_once() {
        let (session, _peer, _rx) = session_pair().await;
        session.change_idle_timeout(Duration::from_millis(0));
        let later = Instant::now() + Duration::from_millis(10);
        assert!(session.request_timeout(later));
        assert!(!session.request_timeout(later + Duration::from_secs(1)));
    }

    #[test]
    fn test_connection_id_from_uuid() {
        let uuid = Uuid::new_v4();
        let id = ConnectionId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), &uuid);
        assert_eq!(ConnectionId::from(uuid), id);
        assert_eq!(id.to_string(), uuid.to_string());
        assert_ne!(ConnectionId::new(), id);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _peer, mut rx) = session_pair().await;
        session.close();
        session.close();
        assert!(!session.is_open());

        let request = rx.try_next().unwrap();
        assert_eq!(request.reason, CloseReason::SelfClose);
        assert!(request.session.ptr_eq(&session));
        assert!(rx.try_next().is_none());
    }

    #[tokio::test]
    async fn test_close_fired_once() {
        let (session, _peer, _rx) = session_pair().await;
        assert!(session.mark_close_fired());
        assert!(!session.mark_close_fired());
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_shutdown_request_skips_self_closed() {
        let (session, _peer, _rx) = session_pair().await;
        assert!(session.request_shutdown());
        assert!(!session.request_shutdown());

        let (other, _peer2, _rx2) = session_pair().await;
        other.close();
        assert!(!other.request_shutdown());
    }

    #[tokio::test]
    async fn test_attributes() {
        let (session, _peer, _rx) = session_pair().await;
        session.set_value("inc", 0i32);
        session.with_value::<i32, _>("inc", |v| {
            if let Some(v) = v {
                *v += 1;
            }
        });
        assert_eq!(session.value::<i32>("inc"), Some(1));
        assert_eq!(session.value::<String>("inc"), None);
        assert!(session.clear_value("inc"));
        assert!(!session.has_value("inc"));
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (session, mut peer, _rx) = session_pair().await;
        session.send_str("inc:0", DEFAULT_SEND_TIMEOUT).await.unwrap();

        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"inc:0");
    }

    #[tokio::test]
    async fn test_send_after_close_is_noop() {
        let (session, mut peer, _rx) = session_pair().await;
        session.close();
        session.send_default(b"late").await.unwrap();
        session.release().await;

        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_send_blocking_rejects_current_thread_runtime() {
        let (session, _peer, _rx) = session_pair().await;
        let result = session.send_blocking(b"x", DEFAULT_SEND_TIMEOUT);
        assert!(matches!(result, Err(SendError::Runtime)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_blocking_on_multi_thread() {
        let (session, mut peer, _rx) = session_pair().await;
        let sender = session.clone();
        tokio::spawn(async move { sender.send_blocking(b"sync", DEFAULT_SEND_TIMEOUT) })
            .await
            .unwrap()
            .unwrap();

        let mut buf = [0u8; 8];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"sync");
    }

    #[tokio::test]
    async fn test_display() {
        let (session, _peer, _rx) = session_pair().await;
        let text = session.to_string();
        assert!(text.starts_with(&format!("ConnectionId:{}", session.connection_id())));
        assert!(text.contains("Remote:127.0.0.1:"));
    }
}
