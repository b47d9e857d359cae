use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::handshake::server::{ErrorResponse, Request, Response},
    tungstenite::protocol::frame::coding::CloseCode,
    tungstenite::protocol::CloseFrame,
    tungstenite::{Message, Utf8Bytes},
    WebSocketStream,
};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde_json::Value;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, interval_at, sleep, timeout};

use crate::cache::TtlCache;
use crate::metrics::METRICS;
use crate::schema::{RefreshRequest, TelemetrySample};
use crate::util::dedupe_ids;

/// Header carrying the caller-asserted pool identifier. Collectors send
/// it as `X-Headplane-Tailnet-ID`; header names match case-insensitively.
pub const POOL_ID_HEADER: &str = "x-headplane-tailnet-id";

pub const ERR_INVALID_TAILNET_ID: &str = "ERR_INVALID_TAILNET_ID";
pub const ERR_UNAUTHORIZED: &str = "ERR_UNAUTHORIZED";
pub const ERR_INTERNAL_ERROR: &str = "ERR_INTERNAL_ERROR";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_DRAIN: Duration = Duration::from_secs(2);
const OUTBOUND_QUEUE: usize = 64;

/// Socket pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Address to listen on, e.g. "0.0.0.0:3001"
    pub listen: String,

    /// Shared secret, expected as `Authorization: Bearer <auth_key>`
    pub auth_key: String,

    /// Interval between WebSocket pings to each member
    pub keepalive: Duration,
}

impl PoolConfig {
    pub fn new(listen: impl Into<String>, auth_key: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            auth_key: auth_key.into(),
            keepalive: Duration::from_secs(30),
        }
    }
}

/// ============================================================
/// Member
/// ============================================================
///
/// Bookkeeping for one accepted collector connection.
///
/// The outbound queue and the keepalive timer live in the same record
/// so they are always inserted and removed together.
struct Member {
    /// Distinguishes this connection from a later one that reused the
    /// same identifier.
    conn_id: u64,

    /// Frames to write to this member's socket
    outbound: mpsc::Sender<Message>,

    /// Periodic ping task, aborted on removal
    keepalive: JoinHandle<()>,
}

struct Shared {
    members: Mutex<HashMap<String, Member>>,
    cache: Arc<TtlCache<TelemetrySample>>,
    bearer: String,
    keepalive: Duration,
    next_conn: AtomicU64,
}

impl Shared {
    fn lock_members(&self) -> MutexGuard<'_, HashMap<String, Member>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `member`, replacing any live connection under the same
    /// identifier. The replaced record is torn down here.
    ///
    /// The shutdown flag is checked under the members lock, so a pool
    /// that is draining never gains a new record. A rejected member is
    /// handed back to the caller.
    fn register(
        &self,
        pool_id: &str,
        member: Member,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> std::result::Result<(), Member> {
        let replaced = {
            let mut members = self.lock_members();
            if *shutdown_rx.borrow() {
                return Err(member);
            }
            members.insert(pool_id.to_string(), member)
        };

        match replaced {
            Some(old) => {
                old.keepalive.abort();
                let _ = old
                    .outbound
                    .try_send(close_message(CloseCode::Normal, "replaced"));
                info!(target: "pool", "Collector {} reconnected, replacing previous connection", pool_id);
            }
            None => {
                METRICS.pool_members_active.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Removes the record for `pool_id` if it still belongs to
    /// `conn_id`, cancelling its keepalive in the same step.
    fn unregister(&self, pool_id: &str, conn_id: u64) {
        let mut members = self.lock_members();
        let owned = members
            .get(pool_id)
            .is_some_and(|m| m.conn_id == conn_id);

        if owned {
            if let Some(member) = members.remove(pool_id) {
                member.keepalive.abort();
                METRICS.pool_members_active.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Merges an unsolicited `{nodeID: payload}` object into the cache.
    fn merge(&self, pool_id: &str, raw: &str) {
        let samples: HashMap<String, Value> = match serde_json::from_str(raw) {
            Ok(samples) => samples,
            Err(e) => {
                METRICS.samples_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(target: "pool", "Dropping unparseable message from {}: {}", pool_id, e);
                return;
            }
        };

        let count = samples.len();
        for (node_id, payload) in samples {
            let sample = TelemetrySample::new(node_id.clone(), payload);
            self.cache.set(node_id, sample);
        }

        METRICS.samples_received.fetch_add(count, Ordering::Relaxed);
        debug!(target: "pool", "Cached {} samples from {}", count, pool_id);
    }
}

/// ============================================================
/// PoolManager
/// ============================================================
///
/// Accepts authenticated WebSocket connections from remote collectors.
///
/// Responsibilities:
/// - Reject connections missing an identifier or a valid bearer token
/// - Keep each member alive with periodic pings
/// - Fan out refresh requests to every member
/// - Merge whatever members push into the shared cache
///
/// Design constraints:
/// - Never blocks callers: refresh requests are queued with `try_send`
/// - Requests and answers are not correlated
/// - A failing member never affects another member
pub struct PoolManager {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Binds the pool listener, logging configuration faults instead of
/// returning them. `None` means the pool is disabled.
pub async fn start(config: PoolConfig, cache: Arc<TtlCache<TelemetrySample>>) -> Option<PoolManager> {
    match PoolManager::bind(config, cache).await {
        Ok(pool) => {
            info!(target: "pool", "Accepting collector connections on {}", pool.local_addr());
            Some(pool)
        }
        Err(e) => {
            error!(target: "pool", "Collector socket pool disabled: {:#}", e);
            None
        }
    }
}

impl PoolManager {

    /// Binds the listener and starts accepting connections.
    pub async fn bind(config: PoolConfig, cache: Arc<TtlCache<TelemetrySample>>) -> Result<Self> {
        if config.auth_key.is_empty() {
            anyhow::bail!("pool `auth_key` is not set");
        }

        let listener = TcpListener::bind(&config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            members: Mutex::new(HashMap::new()),
            cache,
            bearer: format!("Bearer {}", config.auth_key),
            keepalive: config.keepalive,
            next_conn: AtomicU64::new(1),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, shared.clone(), shutdown_rx));

        Ok(Self {
            shared,
            local_addr,
            shutdown_tx,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Identifiers of every currently registered member.
    pub fn member_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.lock_members().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn member_count(&self) -> usize {
        self.shared.lock_members().len()
    }

    /// Broadcasts one `{"NodeIDs": [...]}` message to every member.
    ///
    /// Fire-and-forget. Returns how many members the request was
    /// queued for; a member with a full queue is skipped.
    pub fn request_refresh(&self, node_ids: &[String]) -> usize {
        let node_ids = dedupe_ids(node_ids);
        if node_ids.is_empty() {
            return 0;
        }

        let payload = match serde_json::to_string(&RefreshRequest { node_ids }) {
            Ok(payload) => payload,
            Err(e) => {
                error!(target: "pool", "Failed to encode refresh request: {}", e);
                return 0;
            }
        };

        let members = self.shared.lock_members();
        let mut reached = 0;

        for (pool_id, member) in members.iter() {
            match member.outbound.try_send(Message::Text(payload.clone().into())) {
                Ok(()) => reached += 1,
                Err(e) => debug!(target: "pool", "Skipping refresh for {}: {}", pool_id, e),
            }
        }

        if reached > 0 {
            METRICS.refresh_broadcasts.fetch_add(1, Ordering::Relaxed);
        }
        reached
    }

    /// Stops accepting and cancels every keepalive timer. Sockets stay
    /// open until `shutdown`.
    pub fn stop_timers(&self) {
        let _ = self.shutdown_tx.send(true);

        for member in self.shared.lock_members().values() {
            member.keepalive.abort();
        }
    }

    /// Stops accepting, cancels every keepalive, then closes every
    /// member socket.
    pub async fn shutdown(&self) {
        self.stop_timers();

        let members: Vec<(String, Member)> = self.shared.lock_members().drain().collect();
        for (pool_id, member) in members {
            let _ = member
                .outbound
                .try_send(close_message(CloseCode::Normal, "shutting down"));
            METRICS.pool_members_active.fetch_sub(1, Ordering::Relaxed);
            debug!(target: "pool", "Closed collector {}", pool_id);
        }

        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn close_message(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    }))
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(
                        shared.clone(),
                        stream,
                        peer,
                        shutdown_rx.clone(),
                    ));
                }
                Err(e) => {
                    warn!(target: "pool", "Accept failed: {}", e);
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    debug!(target: "pool", "Accept loop stopped");
}

fn header_value(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Sends a close frame and waits briefly for the peer to acknowledge.
async fn close_with(ws: &mut WebSocketStream<TcpStream>, code: CloseCode, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    };

    if ws.close(Some(frame)).await.is_ok() {
        let _ = timeout(CLOSE_DRAIN, async {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;
    }
}

/// Runs one collector connection from handshake to teardown.
async fn handle_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
) {
    let mut pool_id: Option<String> = None;
    let mut authorization: Option<String> = None;

    let callback = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        pool_id = header_value(req, POOL_ID_HEADER);
        authorization = header_value(req, "authorization");
        Ok(resp)
    };

    let mut ws = match timeout(HANDSHAKE_TIMEOUT, accept_hdr_async(stream, callback)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(target: "pool", "WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!(target: "pool", "WebSocket handshake with {} timed out", peer);
            return;
        }
    };

    // ------------------------------------------------------------
    // AUTHENTICATION
    // ------------------------------------------------------------
    let Some(pool_id) = pool_id else {
        METRICS.pool_rejections.fetch_add(1, Ordering::Relaxed);
        warn!(target: "pool", "Rejecting a collector connection without a pool identifier");
        close_with(&mut ws, CloseCode::Policy, ERR_INVALID_TAILNET_ID).await;
        return;
    };

    if authorization.as_deref() != Some(shared.bearer.as_str()) {
        METRICS.pool_rejections.fetch_add(1, Ordering::Relaxed);
        warn!(target: "pool", "Rejecting an unauthorized collector connection");
        warn!(target: "pool", "Collector source IP: {}", peer.ip());
        close_with(&mut ws, CloseCode::Policy, ERR_UNAUTHORIZED).await;
        return;
    }

    // ------------------------------------------------------------
    // REGISTRATION
    // ------------------------------------------------------------
    let conn_id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
    let (outbound, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let keepalive = spawn_keepalive(outbound.clone(), shared.keepalive);

    let member = Member { conn_id, outbound, keepalive };
    if let Err(member) = shared.register(&pool_id, member, &shutdown_rx) {
        member.keepalive.abort();
        close_with(&mut ws, CloseCode::Away, "shutting down").await;
        return;
    }
    info!(target: "pool", "Collector {} connected from {}", pool_id, peer);

    // ------------------------------------------------------------
    // CONNECTION LOOP
    // ------------------------------------------------------------
    let (mut write, mut read) = ws.split();

    let outcome = loop {
        tokio::select! {
            out = outbound_rx.recv() => match out {
                Some(Message::Close(frame)) => {
                    let _ = write.send(Message::Close(frame)).await;
                    break Ok(());
                }
                Some(msg) => {
                    if let Err(e) = write.send(msg).await {
                        break Err(e);
                    }
                }
                // Record removed elsewhere and every sender dropped
                None => break Ok(()),
            },

            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.merge(&pool_id, text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => shared.merge(&pool_id, text),
                    Err(_) => warn!(target: "pool", "Dropping non UTF-8 frame from {}", pool_id),
                },
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                // Ping/pong are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e),
            }
        }
    };

    shared.unregister(&pool_id, conn_id);

    match outcome {
        Ok(()) => info!(target: "pool", "Collector {} disconnected", pool_id),
        Err(e) => {
            error!(target: "pool", "Collector {} connection error: {}", pool_id, e);
            error!(target: "pool", "Closing collector {} connection", pool_id);
            let _ = write
                .send(close_message(CloseCode::Error, ERR_INTERNAL_ERROR))
                .await;
        }
    }
}

/// Queues a WebSocket ping for the member every `every` until its
/// queue closes or the task is aborted.
fn spawn_keepalive(outbound: mpsc::Sender<Message>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);

        loop {
            ticker.tick().await;
            if outbound.send(Message::Ping(Default::default())).await.is_err() {
                break;
            }
        }
    })
}
