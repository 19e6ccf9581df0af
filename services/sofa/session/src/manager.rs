//! Session manager: partitioned session table, timeout scanner and close worker.
//!
//! The table is split into `divide` partitions, each an independently locked
//! map from connection id to session. A session's partition is fixed when it
//! is generated. The timeout scanner visits one partition per tick, so a full
//! sweep takes about one second whatever the partition count. The close
//! worker drains the close queue and is the only place, besides a read loop
//! that saw its peer go away, where sessions are finalized and removed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::close_queue::{close_queue, CloseQueue, CloseReceiver, CloseRequest};
use crate::reason::CloseReason;
use crate::session::{ConnectionId, Session, SessionParts};

/// Default number of partitions
pub const DEFAULT_DIVIDE: usize = 10;

/// Time for the timeout scanner to visit every partition once
const SWEEP_PERIOD: Duration = Duration::from_millis(1000);

/// Outcome of [`SessionManager::generate`]
#[derive(Debug, Clone)]
pub enum Registration {
    /// A new session was inserted
    Created(Session),
    /// A session with this connection id already exists; the supplied socket was dropped
    Existing(Session),
    /// The manager is shutting down; the supplied socket was dropped
    Rejected,
}

impl Registration {
    /// The newly created session, if any
    pub fn created(self) -> Option<Session> {
        match self {
            Registration::Created(session) => Some(session),
            _ => None,
        }
    }
}

type Partition = Mutex<HashMap<ConnectionId, Session>>;

/// Partitioned session table plus its background tasks
#[derive(Debug)]
pub struct SessionManager {
    divide: usize,
    partitions: Vec<Partition>,
    session_count: AtomicUsize,
    close_queue: CloseQueue,
    close_rx: Mutex<Option<CloseReceiver>>,
    shut_down: AtomicBool,
    timeout_token: CancellationToken,
    close_token: CancellationToken,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
    close_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Create a manager with `divide` partitions (at least one)
    pub fn new(divide: usize) -> Arc<Self> {
        let divide = divide.max(1);
        let (close_queue, close_rx) = close_queue();
        Arc::new(Self {
            divide,
            partitions: (0..divide).map(|_| Mutex::new(HashMap::new())).collect(),
            session_count: AtomicUsize::new(0),
            close_queue,
            close_rx: Mutex::new(Some(close_rx)),
            shut_down: AtomicBool::new(false),
            timeout_token: CancellationToken::new(),
            close_token: CancellationToken::new(),
            timeout_task: Mutex::new(None),
            close_task: Mutex::new(None),
        })
    }

    /// Number of partitions
    pub fn divide(&self) -> usize {
        self.divide
    }

    /// Producer handle for the close queue
    pub fn close_queue(&self) -> &CloseQueue {
        &self.close_queue
    }

    /// Whether shutdown has begun
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Register a session for `connection_id`, or return the one already registered.
    pub fn generate(&self, connection_id: ConnectionId, parts: SessionParts) -> Registration {
        let index = connection_id.partition(self.divide);
        let mut partition = self.partitions[index].lock();

        // Checked under the partition lock so a shutdown sweep cannot miss a late insert
        if self.is_shut_down() {
            debug!("Reject session {} during shutdown", connection_id);
            return Registration::Rejected;
        }

        if let Some(existing) = partition.get(&connection_id) {
            debug!("Session {} already registered", existing);
            return Registration::Existing(existing.clone());
        }

        let session = Session::new(connection_id, index, parts, self.close_queue.clone());
        partition.insert(connection_id, session.clone());
        self.session_count.fetch_add(1, Ordering::AcqRel);
        debug!("Generate session:{}", session);
        Registration::Created(session)
    }

    /// Look a session up without removing it
    pub fn get(&self, connection_id: ConnectionId) -> Option<Session> {
        let index = connection_id.partition(self.divide);
        self.partitions[index].lock().get(&connection_id).cloned()
    }

    /// Remove a session; removing an absent id is a no-op
    pub fn remove(&self, connection_id: ConnectionId) -> Option<Session> {
        let index = connection_id.partition(self.divide);
        let removed = self.partitions[index].lock().remove(&connection_id);
        if let Some(session) = &removed {
            self.session_count.fetch_sub(1, Ordering::AcqRel);
            debug!("Remove session:{}", session);
        }
        removed
    }

    /// Remove `session` only if it is still the entry registered under its id
    pub(crate) fn remove_session(&self, session: &Session) -> bool {
        let mut partition = self.partitions[session.partition()].lock();
        let registered = partition
            .get(&session.connection_id())
            .is_some_and(|current| current.ptr_eq(session));
        if !registered {
            return false;
        }
        partition.remove(&session.connection_id());
        self.session_count.fetch_sub(1, Ordering::AcqRel);
        debug!("Remove session:{}", session);
        true
    }

    /// Number of live sessions. For observability only.
    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Acquire)
    }

    /// Snapshot of all live sessions
    pub fn sessions(&self) -> Vec<Session> {
        self.partitions
            .iter()
            .flat_map(|partition| partition.lock().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Queue a timeout close for every expired session in one partition.
    /// Returns how many requests were queued.
    pub(crate) fn scan_partition(&self, index: usize, now: Instant) -> usize {
        let partition = self.partitions[index].lock();
        let mut queued = 0;
        for session in partition.values() {
            if session.request_timeout(now) {
                debug!("Session timed out:{}", session);
                self.close_queue
                    .push(CloseRequest::new(session.clone(), CloseReason::Timeout));
                queued += 1;
            }
        }
        queued
    }

    /// Queue a shutdown close for every session not already closing on its own.
    /// Returns how many requests were queued.
    pub(crate) fn sweep_shutdown(&self) -> usize {
        let mut queued = 0;
        for partition in &self.partitions {
            let partition = partition.lock();
            for session in partition.values() {
                if session.request_shutdown() {
                    self.close_queue
                        .push(CloseRequest::new(session.clone(), CloseReason::Shutdown));
                    queued += 1;
                }
            }
        }
        queued
    }

    /// Start the timeout scanner. Later calls are ignored.
    pub fn start_timeout_task(self: &Arc<Self>) {
        let mut task = self.timeout_task.lock();
        if task.is_some() || self.timeout_token.is_cancelled() {
            return;
        }

        let manager = Arc::clone(self);
        let token = self.timeout_token.clone();
        let period = (SWEEP_PERIOD / self.divide as u32).max(Duration::from_millis(1));

        *task = Some(tokio::spawn(async move {
            info!("Start timeout task -> divide:{}", manager.divide);

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            let mut index = 0;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Cancel timeout task");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.scan_partition(index, Instant::now());
                        index = (index + 1) % manager.divide;
                    }
                }
            }
        }));
    }

    /// Stop the timeout scanner and queue a shutdown close for every session.
    ///
    /// Runs the sweep once; later calls return 0.
    pub async fn shutdown_timeout_task(&self) -> usize {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }

        self.timeout_token.cancel();
        let task = self.timeout_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Timeout task ended abnormally: {}", e);
            }
        }

        info!("Closing connections at shutdown");
        let queued = self.sweep_shutdown();
        info!("Shutdown timeout task -> divide:{}, closing:{}", self.divide, queued);
        queued
    }

    /// Start the close worker. `completed` runs once per dequeued request,
    /// each on its own task. Later calls are ignored.
    pub fn start_close_task<F, Fut>(self: &Arc<Self>, completed: F)
    where
        F: Fn(CloseRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut task = self.close_task.lock();
        if task.is_some() {
            return;
        }
        let Some(mut rx) = self.close_rx.lock().take() else {
            return;
        };

        let token = self.close_token.clone();
        *task = Some(tokio::spawn(async move {
            info!("Start close task");

            let mut inflight = JoinSet::new();
            loop {
                tokio::select! {
                    biased;

                    request = rx.next() => match request {
                        Some(request) => {
                            debug!("Close state:{:?}", request);
                            inflight.spawn(completed(request));
                        }
                        None => break,
                    },

                    Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                        if let Err(e) = joined {
                            warn!("Close handling failed: {}", e);
                        }
                    }

                    _ = token.cancelled() => {
                        // Drain what the shutdown sweep queued before stopping
                        while let Some(request) = rx.try_next() {
                            debug!("Close state:{:?}", request);
                            inflight.spawn(completed(request));
                        }
                        break;
                    }
                }
            }

            while let Some(joined) = inflight.join_next().await {
                if let Err(e) = joined {
                    warn!("Close handling failed: {}", e);
                }
            }
            info!("Cancel close task");
        }));
    }

    /// Stop the close worker after it has finished every queued request
    pub async fn shutdown_close_task(&self) {
        self.close_token.cancel();
        let task = self.close_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Close task ended abnormally: {}", e);
            }
            info!("Shutdown close task");
        }
    }
}
