//! Read loop and close finalization.

use bytes::Bytes;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, warn};

use crate::callback::SessionHandler;
use crate::manager::SessionManager;
use crate::reason::CloseReason;
use crate::session::Session;

/// Drives reads for every session of one server or client and finalizes
/// sessions when they close.
pub struct ReadHandler {
    handler: Arc<dyn SessionHandler>,
    manager: Arc<SessionManager>,
    read_buffer_size: usize,
    idle_timeout: Duration,
}

impl ReadHandler {
    /// Create the handler and start the manager's close worker on it.
    ///
    /// New sessions start with `idle_timeout`; callbacks may change it per session.
    pub fn new(
        handler: Arc<dyn SessionHandler>,
        manager: Arc<SessionManager>,
        read_buffer_size: usize,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let read = Arc::new(Self {
            handler,
            manager: Arc::clone(&manager),
            read_buffer_size: read_buffer_size.max(1),
            idle_timeout,
        });

        let worker: Weak<Self> = Arc::downgrade(&read);
        manager.start_close_task(move |request| {
            let worker = worker.upgrade();
            async move {
                match worker {
                    Some(read) => read.finalize(request.session, request.reason).await,
                    None => debug!("Read handler gone, dropping {:?}", request),
                }
            }
        });

        read
    }

    /// The session manager this handler finalizes into
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Fire `on_open` for a freshly registered session, then start reading it
    pub(crate) async fn open(self: &Arc<Self>, session: Session, reader: OwnedReadHalf) {
        {
            let _dispatch = session.lock_dispatch().await;
            session.change_idle_timeout(self.idle_timeout);
            self.handler.on_open(&session).await;
        }
        self.prepare(session, reader);
    }

    /// Spawn the read loop for `session`
    pub(crate) fn prepare(self: &Arc<Self>, session: Session, reader: OwnedReadHalf) {
        let read = Arc::clone(self);
        tokio::spawn(async move {
            let state = ReadState {
                buffer: vec![0u8; read.read_buffer_size],
                reader,
                close_reason: None,
            };
            read.run(session, state).await;
        });
    }

    async fn run(&self, session: Session, mut state: ReadState) {
        let released = session.released();
        debug!("Start reading {}", session);

        loop {
            let received = tokio::select! {
                _ = released.cancelled() => break,
                received = state.reader.read(&mut state.buffer) => received,
            };

            match received {
                Ok(0) => {
                    state.close_reason = Some(CloseReason::PeerClose);
                    break;
                }
                Ok(n) => {
                    self.complete(&session, &state.buffer[..n]).await;
                    if session.close_fired() {
                        break;
                    }
                }
                Err(e) => {
                    let reason = CloseReason::from_read_error(&e);
                    if reason == CloseReason::Failed {
                        warn!("Read from {} failed: {}", session, e);
                    } else {
                        debug!("Read from {} ended: {}", session, e);
                    }
                    state.close_reason = Some(reason);
                    break;
                }
            }
        }

        match state.close_reason {
            Some(reason) => self.finalize(session, reason).await,
            None => debug!("Stop reading {}", session),
        }
    }

    /// Deliver one received chunk under the session's dispatch lock
    async fn complete(&self, session: &Session, received: &[u8]) {
        let _dispatch = session.lock_dispatch().await;
        if !session.can_deliver() {
            return;
        }
        session.update_timeout();
        self.handler
            .on_message(session, Bytes::copy_from_slice(received))
            .await;
    }

    /// Close `session` for `reason`.
    ///
    /// Every close trigger ends here. The socket is released, `on_close`
    /// fires if it has not fired yet, and the session leaves the table.
    pub(crate) async fn finalize(&self, session: Session, reason: CloseReason) {
        {
            let _dispatch = session.lock_dispatch().await;
            session.release().await;
            if session.mark_close_fired() {
                debug!("Close session:{}, reason:{}", session, reason);
                self.handler.on_close(&session, reason).await;
            }
        }
        self.manager.remove_session(&session);
    }

    /// Stop the close worker once everything queued has been finalized
    pub async fn shutdown(&self) {
        self.manager.shutdown_close_task().await;
    }
}

/// State of one session's read cycle
struct ReadState {
    buffer: Vec<u8>,
    reader: OwnedReadHalf,
    close_reason: Option<CloseReason>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::split_stream;
    use crate::session::{ConnectionId, DEFAULT_IDLE_TIMEOUT};
    use crate::test_util::{eventually, loopback};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::io::AsyncWriteExt;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SessionHandler for Recorder {
        async fn on_open(&self, _session: &Session) {
            self.events.lock().push("open".to_string());
        }

        async fn on_message(&self, _session: &Session, message: Bytes) {
            self.events
                .lock()
                .push(format!("message:{}", String::from_utf8_lossy(&message)));
        }

        async fn on_close(&self, _session: &Session, reason: CloseReason) {
            self.events.lock().push(format!("close:{}", reason));
        }
    }

    async fn wait_for_events(recorder: &Recorder, count: usize) -> Vec<String> {
        for _ in 0..200 {
            if recorder.events.lock().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        recorder.events.lock().clone()
    }

    #[tokio::test]
    async fn test_peer_close_finalizes_once() {
        let recorder = Arc::new(Recorder::default());
        let manager = SessionManager::new(2);
        let read = ReadHandler::new(recorder.clone(), Arc::clone(&manager), 64, DEFAULT_IDLE_TIMEOUT);

        let (local, mut peer) = loopback().await;
        let (parts, reader) = split_stream(local);
        let session = manager
            .generate(ConnectionId::new(), parts)
            .created()
            .unwrap();
        read.open(session.clone(), reader).await;

        peer.write_all(b"hello").await.unwrap();
        wait_for_events(&recorder, 2).await;
        drop(peer);

        let events = wait_for_events(&recorder, 3).await;
        assert_eq!(events, vec!["open", "message:hello", "close:PeerClose"]);
        assert!(eventually(|| manager.session_count() == 0).await);

        // A late finalization for the same session is a no-op
        read.finalize(session, CloseReason::Timeout).await;
        assert_eq!(recorder.events.lock().len(), 3);

        read.shutdown().await;
    }

    #[tokio::test]
    async fn test_self_close_stops_delivery() {
        let recorder = Arc::new(Recorder::default());
        let manager = SessionManager::new(1);
        let read = ReadHandler::new(recorder.clone(), Arc::clone(&manager), 64, DEFAULT_IDLE_TIMEOUT);

        let (local, mut peer) = loopback().await;
        let (parts, reader) = split_stream(local);
        let session = manager
            .generate(ConnectionId::new(), parts)
            .created()
            .unwrap();
        read.open(session.clone(), reader).await;

        session.close();
        let events = wait_for_events(&recorder, 2).await;
        assert_eq!(events, vec!["open", "close:SelfClose"]);

        // Writes after the close are never delivered
        let _ = peer.write_all(b"late").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.events.lock().len(), 2);
        assert_eq!(manager.session_count(), 0);

        read.shutdown().await;
    }
}
