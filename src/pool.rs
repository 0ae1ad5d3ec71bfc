//! Connection pool.
//!
//! All pool state (the idle list, the allocated set, the pending-request
//! queue, and the counters) lives on a single background task and is
//! mutated only there; callers talk to it over an `mpsc` channel. This is
//! the same serialization discipline as a dispatch queue, expressed as an
//! actor instead of a queue of closures.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, Result};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections (idle + allocated) the pool will open.
    pub maximum_connections: usize,
    /// Maximum number of requests allowed to wait for a connection at once.
    pub maximum_pending_requests: usize,
    /// How long a request may wait in the pending queue before it fails.
    pub pending_request_timeout: Duration,
    /// How long a connection may stay allocated before it is force-closed.
    pub allocated_connection_timeout: Duration,
    /// Interval at which a metrics snapshot is logged. `None` disables it.
    pub metrics_logging_interval: Option<Duration>,
    /// Whether logging a metrics snapshot also resets the delta counters.
    pub metrics_reset_when_logged: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            maximum_connections: 10,
            maximum_pending_requests: 200,
            pending_request_timeout: Duration::from_secs(10),
            allocated_connection_timeout: Duration::from_secs(30),
            metrics_logging_interval: Some(Duration::from_secs(3600)),
            metrics_reset_when_logged: true,
        }
    }
}

/// A snapshot of the pool's counters.
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    pub connections_at_start_of_period: usize,
    pub connections_at_end_of_period: usize,
    pub successful_requests: u64,
    pub unsuccessful_requests_error: u64,
    pub unsuccessful_requests_timed_out: u64,
    pub unsuccessful_requests_too_busy: u64,
    pub allocated_connections_closed_by_requestor: u64,
    pub allocated_connections_timed_out: u64,
    pub connections_created: u64,
    /// Lowest size the pending-request queue reached during this period.
    pub minimum_pending_requests: usize,
    /// Highest size the pending-request queue reached during this period.
    pub maximum_pending_requests: usize,
}

enum PoolMessage {
    Acquire {
        respond_to: oneshot::Sender<Result<PooledEntry>>,
    },
    Release {
        id: u64,
        conn: Connection,
        closed_by_requestor: bool,
    },
    Metrics {
        reset: bool,
        respond_to: oneshot::Sender<PoolMetrics>,
    },
    Close {
        force: bool,
        respond_to: oneshot::Sender<()>,
    },
    /// Sent back to the actor by the spawned task performing a connect, so
    /// the slow TCP/TLS handshake never blocks the actor's message loop.
    ConnectionEstablished {
        id: u64,
        respond_to: oneshot::Sender<Result<PooledEntry>>,
        result: Result<Connection>,
    },
}

struct PooledEntry {
    id: u64,
    conn: Connection,
}

struct IdleSlot {
    id: u64,
    conn: Connection,
    released_at: Instant,
}

struct PendingRequest {
    respond_to: oneshot::Sender<Result<PooledEntry>>,
    enqueued_at: Instant,
}

struct Actor {
    db_config: Config,
    pool_config: PoolConfig,
    idle: VecDeque<IdleSlot>,
    allocated: HashMap<u64, Instant>,
    pending: VecDeque<PendingRequest>,
    next_id: u64,
    closed: bool,
    metrics: PoolMetrics,
    /// A sender back into this actor's own inbox, handed to spawned connect
    /// tasks so they can report their result without the actor awaiting them.
    self_tx: mpsc::Sender<PoolMessage>,
}

impl Actor {
    fn connections_in_use_or_pending(&self) -> usize {
        self.allocated.len() + self.pending.len()
    }

    /// Update the pending-queue high/low water marks after a change to
    /// `self.pending`'s length.
    fn note_pending_len(&mut self) {
        let len = self.pending.len();
        self.metrics.minimum_pending_requests = self.metrics.minimum_pending_requests.min(len);
        self.metrics.maximum_pending_requests = self.metrics.maximum_pending_requests.max(len);
    }

    async fn handle_acquire(&mut self, respond_to: oneshot::Sender<Result<PooledEntry>>) {
        if self.closed {
            let _ = respond_to.send(Err(Error::ConnectionPoolClosed));
            return;
        }

        if self.pending.is_empty() {
            if let Some(slot) = self.idle.pop_back() {
                self.allocated.insert(
                    slot.id,
                    Instant::now() + self.pool_config.allocated_connection_timeout,
                );
                self.metrics.successful_requests += 1;
                let _ = respond_to.send(Ok(PooledEntry {
                    id: slot.id,
                    conn: slot.conn,
                }));
                return;
            }
        }

        if self.connections_in_use_or_pending() < self.pool_config.maximum_connections {
            let id = self.next_id;
            self.next_id += 1;
            // Reserve the slot now so a second Acquire arriving before this
            // connect resolves doesn't also see spare capacity.
            self.allocated.insert(
                id,
                Instant::now() + self.pool_config.allocated_connection_timeout,
            );
            let db_config = self.db_config.clone();
            let self_tx = self.self_tx.clone();
            tokio::spawn(async move {
                let result = Connection::connect(&db_config).await;
                let _ = self_tx
                    .send(PoolMessage::ConnectionEstablished { id, respond_to, result })
                    .await;
            });
            return;
        }

        if self.pending.len() < self.pool_config.maximum_pending_requests {
            self.pending.push_back(PendingRequest {
                respond_to,
                enqueued_at: Instant::now(),
            });
            self.note_pending_len();
            return;
        }

        self.metrics.unsuccessful_requests_too_busy += 1;
        let _ = respond_to.send(Err(Error::TooManyRequestsForConnections));
    }

    fn handle_connection_established(
        &mut self,
        id: u64,
        respond_to: oneshot::Sender<Result<PooledEntry>>,
        result: Result<Connection>,
    ) {
        if self.closed {
            self.allocated.remove(&id);
            let _ = respond_to.send(Err(Error::ConnectionPoolClosed));
            return;
        }

        match result {
            Ok(conn) => {
                self.metrics.connections_created += 1;
                self.metrics.successful_requests += 1;
                let _ = respond_to.send(Ok(PooledEntry { id, conn }));
            }
            Err(e) => {
                self.allocated.remove(&id);
                self.metrics.unsuccessful_requests_error += 1;
                let _ = respond_to.send(Err(e));
            }
        }
    }

    fn handle_release(&mut self, id: u64, conn: Connection, closed_by_requestor: bool) {
        let Some(_deadline) = self.allocated.remove(&id) else {
            tracing::warn!(connection_id = id, "released a connection not tracked as allocated by this pool");
            return;
        };

        if closed_by_requestor {
            self.metrics.allocated_connections_closed_by_requestor += 1;
            return;
        }

        if conn.is_broken() {
            return;
        }

        if conn.in_transaction() {
            tracing::warn!(connection_id = id, "connection released while an explicit transaction was open; closing it");
            return;
        }

        if self.closed {
            return;
        }

        if let Some(pending) = self.pending.pop_front() {
            self.note_pending_len();
            self.allocated.insert(
                id,
                Instant::now() + self.pool_config.allocated_connection_timeout,
            );
            self.metrics.successful_requests += 1;
            let _ = pending.respond_to.send(Ok(PooledEntry { id, conn }));
            return;
        }

        self.idle.push_back(IdleSlot {
            id,
            conn,
            released_at: Instant::now(),
        });
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();

        loop {
            let expired = self
                .pending
                .front()
                .is_some_and(|front| now.duration_since(front.enqueued_at) >= self.pool_config.pending_request_timeout);
            if !expired {
                break;
            }
            let Some(request) = self.pending.pop_front() else {
                break;
            };
            self.note_pending_len();
            self.metrics.unsuccessful_requests_timed_out += 1;
            let _ = request.respond_to.send(Err(Error::TimedOutAcquiringConnection));
        }

        let expired: Vec<u64> = self
            .allocated
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.allocated.remove(&id);
            self.metrics.allocated_connections_timed_out += 1;
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let pending_deadline = self
            .pending
            .front()
            .map(|r| r.enqueued_at + self.pool_config.pending_request_timeout);
        let allocated_deadline = self.allocated.values().min().copied();
        match (pending_deadline, allocated_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    fn snapshot_metrics(&mut self, reset: bool) -> PoolMetrics {
        let connections_at_end = self.allocated.len() + self.idle.len();
        let snapshot = PoolMetrics {
            connections_at_start_of_period: self.metrics.connections_at_start_of_period,
            connections_at_end_of_period: connections_at_end,
            ..self.metrics.clone()
        };
        if reset {
            self.metrics = PoolMetrics {
                connections_at_start_of_period: connections_at_end,
                ..PoolMetrics::default()
            };
        }
        snapshot
    }

    fn close(&mut self, force: bool) {
        self.closed = true;
        self.idle.clear();
        if force {
            self.allocated.clear();
        }
        while let Some(request) = self.pending.pop_front() {
            let _ = request.respond_to.send(Err(Error::ConnectionPoolClosed));
        }
        self.note_pending_len();
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PoolMessage>) {
        loop {
            let wakeup = self.next_wakeup();
            let metrics_interval = self.pool_config.metrics_logging_interval;

            tokio::select! {
                message = rx.recv() => {
                    match message {
                        Some(PoolMessage::Acquire { respond_to }) => self.handle_acquire(respond_to).await,
                        Some(PoolMessage::Release { id, conn, closed_by_requestor }) => {
                            self.handle_release(id, conn, closed_by_requestor);
                        }
                        Some(PoolMessage::Metrics { reset, respond_to }) => {
                            let snapshot = self.snapshot_metrics(reset);
                            let _ = respond_to.send(snapshot);
                        }
                        Some(PoolMessage::Close { force, respond_to }) => {
                            self.close(force);
                            let _ = respond_to.send(());
                        }
                        Some(PoolMessage::ConnectionEstablished { id, respond_to, result }) => {
                            self.handle_connection_established(id, respond_to, result);
                        }
                        None => break,
                    }
                }
                () = async {
                    match wakeup {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.sweep_timeouts();
                }
                () = async {
                    match metrics_interval {
                        Some(interval) => tokio::time::sleep(interval).await,
                        None => std::future::pending().await,
                    }
                } => {
                    let snapshot = self.snapshot_metrics(self.pool_config.metrics_reset_when_logged);
                    tracing::info!(?snapshot, "connection pool metrics");
                }
            }
        }
    }
}

/// A connection acquired from a [`ConnectionPool`]. Returned to the pool on drop.
pub struct PooledConnection {
    conn: std::mem::ManuallyDrop<Connection>,
    id: u64,
    pool_tx: mpsc::Sender<PoolMessage>,
    closed_by_requestor: bool,
}

impl PooledConnection {
    /// Close this connection rather than returning it to the pool.
    pub fn close(mut self) {
        self.closed_by_requestor = true;
        drop(self);
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // SAFETY: `conn` is never accessed again after this take.
        let conn = unsafe { std::mem::ManuallyDrop::take(&mut self.conn) };
        let message = PoolMessage::Release {
            id: self.id,
            conn,
            closed_by_requestor: self.closed_by_requestor,
        };
        let tx = self.pool_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(message).await;
        });
    }
}

/// A pool of PostgreSQL connections to a single server, backed by a single
/// background task.
#[derive(Clone)]
pub struct ConnectionPool {
    tx: mpsc::Sender<PoolMessage>,
}

const MESSAGE_QUEUE_CAPACITY: usize = 256;

impl ConnectionPool {
    /// Start a pool's background task. Connections are created lazily.
    pub fn new(db_config: Config, pool_config: PoolConfig) -> Self {
        let (tx, rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        let actor = Actor {
            db_config,
            pool_config,
            idle: VecDeque::new(),
            allocated: HashMap::new(),
            pending: VecDeque::new(),
            next_id: 0,
            closed: false,
            metrics: PoolMetrics::default(),
            self_tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// Acquire a connection, creating one if needed and the pool has capacity.
    pub async fn acquire_connection(&self) -> Result<PooledConnection> {
        let (respond_to, response) = oneshot::channel();
        self.tx
            .send(PoolMessage::Acquire { respond_to })
            .await
            .map_err(|_| Error::ConnectionPoolClosed)?;
        let entry = response.await.map_err(|_| Error::ConnectionPoolClosed)??;
        Ok(PooledConnection {
            conn: std::mem::ManuallyDrop::new(entry.conn),
            id: entry.id,
            pool_tx: self.tx.clone(),
            closed_by_requestor: false,
        })
    }

    /// Acquire a connection, run `op` against it, and release it regardless
    /// of whether `op` succeeds.
    pub async fn with_connection<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut conn = self.acquire_connection().await?;
        op(&mut conn).await
    }

    /// Snapshot the pool's metrics, optionally resetting the delta counters.
    pub async fn metrics(&self, reset: bool) -> PoolMetrics {
        let (respond_to, response) = oneshot::channel();
        if self
            .tx
            .send(PoolMessage::Metrics { reset, respond_to })
            .await
            .is_err()
        {
            return PoolMetrics::default();
        }
        response.await.unwrap_or_default()
    }

    /// Shut the pool down. If `force`, allocated connections are dropped
    /// immediately; otherwise they are closed as they are released.
    pub async fn close(&self, force: bool) {
        let (respond_to, response) = oneshot::channel();
        if self
            .tx
            .send(PoolMessage::Close { force, respond_to })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
    }
}
