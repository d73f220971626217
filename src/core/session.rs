/// Per-client proxy session
///
/// One session per accepted client connection. The relay loop reads one
/// whole message at a time, routes it against the current topology
/// snapshot, forwards it verbatim over a pooled backend connection and
/// relays the correlated response back. Responses reach the client in the
/// order their requests were forwarded.
///
/// Pinning: an operation that must observe its own effects (a write, a
/// primary read, a cursor continuation) binds the session to the backend
/// connection that served it; later operations of that kind reuse the pin.
/// Ordinary reads keep using the shared pool. The pin is an explicit field
/// holding the pool checkout guard, so every exit path (client EOF, frame
/// error, backend failure, idle eviction, shutdown) releases it by drop.
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};

use crate::core::pool::{BackendPool, PooledConn};
use crate::error::{EsclusaError, EsclusaResult};
use crate::protocol::{read_message, WireMessage};
use crate::routing::{route, MemberSelector, RoutingDecision};
use crate::topology::ReplicaSetView;
use crate::utils::{format_bytes, format_duration};

/// Session-level limits
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// A session silent for this long is forcibly closed
    pub idle_timeout: Duration,
    /// Framing ceiling on a single message
    pub max_message_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(3600),
            max_message_size: crate::protocol::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Counters reported when a session ends
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub messages_forwarded: u64,
    pub replies_relayed: u64,
    pub bytes_to_backend: u64,
    pub bytes_to_client: u64,
}

/// Where an exchange failed; decides whether the backend connection is
/// still trustworthy
enum ExchangeError {
    /// The backend side failed; the connection must be discarded
    Backend(EsclusaError),
    /// The client side failed; the backend connection is still clean
    Client(io::Error),
}

pub struct ProxySession {
    client: TcpStream,
    client_addr: SocketAddr,
    pool: Arc<BackendPool>,
    topology: watch::Receiver<Arc<ReplicaSetView>>,
    selector: Arc<dyn MemberSelector>,
    config: SessionConfig,
    shutdown: watch::Receiver<bool>,
}

impl ProxySession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: TcpStream,
        client_addr: SocketAddr,
        pool: Arc<BackendPool>,
        topology: watch::Receiver<Arc<ReplicaSetView>>,
        selector: Arc<dyn MemberSelector>,
        config: SessionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            client_addr,
            pool,
            topology,
            selector,
            config,
            shutdown,
        }
    }

    /// Relay until the client disconnects, the session is evicted, or a
    /// connection-fatal error occurs
    pub async fn run(self) -> EsclusaResult<SessionStats> {
        let ProxySession {
            client,
            client_addr,
            pool,
            topology,
            selector,
            config,
            mut shutdown,
        } = self;
        let started = Instant::now();
        let (mut client_rd, mut client_wr) = client.into_split();
        let mut pinned: Option<PooledConn> = None;
        let mut stats = SessionStats::default();

        let outcome: EsclusaResult<()> = loop {
            let msg = tokio::select! {
                read = timeout(
                    config.idle_timeout,
                    read_message(&mut client_rd, config.max_message_size),
                ) => match read {
                    Err(_) => {
                        info!("Evicting idle session from {}", client_addr);
                        break Ok(());
                    }
                    Ok(Ok(None)) => {
                        debug!("Client {} disconnected", client_addr);
                        break Ok(());
                    }
                    Ok(Ok(Some(msg))) => msg,
                    Ok(Err(e)) => {
                        warn!("Bad frame from client {}: {}", client_addr, e);
                        break Err(e.into());
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Session from {} stopping on shutdown", client_addr);
                        break Ok(());
                    }
                    continue;
                }
            };

            let class = msg.classify();
            let reuse_pin = class.sticky() && pinned.is_some();

            if reuse_pin {
                let conn = pinned.as_mut().expect("pin checked above");
                match relay_exchange(conn, &msg, &mut client_wr, &mut stats, &config).await {
                    Ok(()) => {}
                    Err(ExchangeError::Backend(e)) => {
                        let mut dead = pinned.take().expect("pin checked above");
                        dead.mark_broken();
                        drop(dead);
                        warn!(
                            "Pinned connection for {} failed: {}; pin torn down",
                            client_addr, e
                        );
                        if msg.expects_reply() {
                            break Err(e);
                        }
                        // fire-and-forget: the next operation may retry on
                        // a fresh connection
                    }
                    Err(ExchangeError::Client(e)) => {
                        debug!("Client {} went away mid-relay: {}", client_addr, e);
                        break Ok(());
                    }
                }
                continue;
            }

            let view = topology.borrow().clone();
            let target = match route(&view, class, selector.as_ref()) {
                RoutingDecision::Route { target } => target,
                RoutingDecision::Error { message } => {
                    warn!("Cannot route for client {}: {}", client_addr, message);
                    break Err(EsclusaError::NoRoutableMember(message));
                }
            };

            let mut conn = match pool.acquire(target).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Acquire failed for client {}: {}", client_addr, e);
                    break Err(e);
                }
            };

            match relay_exchange(&mut conn, &msg, &mut client_wr, &mut stats, &config).await {
                Ok(()) => {
                    if class.sticky() {
                        pinned = Some(conn);
                    }
                    // otherwise the checkout guard drops here and the
                    // connection returns to the pool
                }
                Err(ExchangeError::Backend(e)) => {
                    conn.mark_broken();
                    drop(conn);
                    if msg.expects_reply() {
                        break Err(e);
                    }
                    warn!(
                        "Backend {} failed on fire-and-forget from {}: {}",
                        target, client_addr, e
                    );
                }
                Err(ExchangeError::Client(e)) => {
                    debug!("Client {} went away mid-relay: {}", client_addr, e);
                    break Ok(());
                }
            }
        };

        // Every exit path funnels here: the pin (if any) drops and its
        // connection goes back to the pool or is closed.
        drop(pinned);

        info!(
            "Session from {} closed after {}: {} messages, {} replies, {} out / {} in",
            client_addr,
            format_duration(started.elapsed()),
            stats.messages_forwarded,
            stats.replies_relayed,
            format_bytes(stats.bytes_to_backend),
            format_bytes(stats.bytes_to_client),
        );
        outcome.map(|_| stats)
    }
}

/// Forward one message and, when one is owed, relay the correlated reply
async fn relay_exchange(
    conn: &mut PooledConn,
    msg: &WireMessage,
    client_wr: &mut OwnedWriteHalf,
    stats: &mut SessionStats,
    config: &SessionConfig,
) -> Result<(), ExchangeError> {
    let member = conn.member();
    let stream = conn.stream_mut();

    stream
        .write_all(msg.as_bytes())
        .await
        .map_err(|e| ExchangeError::Backend(EsclusaError::unreachable(member, e.to_string())))?;
    stats.messages_forwarded += 1;
    stats.bytes_to_backend += msg.len() as u64;

    if !msg.expects_reply() {
        return Ok(());
    }

    let reply = read_message(stream, config.max_message_size)
        .await
        .map_err(|e| ExchangeError::Backend(e.into()))?
        .ok_or_else(|| {
            ExchangeError::Backend(EsclusaError::unreachable(member, "closed mid-exchange"))
        })?;
    if reply.header.response_to != msg.header.request_id {
        return Err(ExchangeError::Backend(EsclusaError::ProtocolDesync {
            expected: msg.header.request_id,
            got: reply.header.response_to,
        }));
    }

    client_wr
        .write_all(reply.as_bytes())
        .await
        .map_err(ExchangeError::Client)?;
    stats.replies_relayed += 1;
    stats.bytes_to_client += reply.len() as u64;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pool::PoolConfig;
    use crate::protocol::{build_message, OpCode, DEFAULT_MAX_MESSAGE_SIZE};
    use crate::routing::RoundRobin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn query(request_id: i32, flags: i32) -> WireMessage {
        let mut payload = Vec::new();
        payload.extend_from_slice(&flags.to_le_bytes());
        payload.extend_from_slice(b"test.coll\0");
        payload.extend_from_slice(&0i32.to_le_bytes());
        payload.extend_from_slice(&(-1i32).to_le_bytes());
        payload.extend_from_slice(&5i32.to_le_bytes());
        payload.push(0);
        WireMessage::from_bytes(build_message(request_id, 0, OpCode::Query, &payload)).unwrap()
    }

    fn insert(request_id: i32) -> WireMessage {
        WireMessage::from_bytes(build_message(request_id, 0, OpCode::Insert, &[0u8; 12])).unwrap()
    }

    /// A fake member that answers every reply-expecting message with an
    /// OP_REPLY correlated via `response_to` (shifted by `skew` to script
    /// desyncs), and counts accepted connections
    async fn spawn_member(accepts: Arc<AtomicUsize>, skew: i32) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                accepts.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    while let Ok(Some(msg)) =
                        read_message(&mut stream, DEFAULT_MAX_MESSAGE_SIZE).await
                    {
                        if msg.expects_reply() {
                            let raw = build_message(
                                900,
                                msg.header.request_id + skew,
                                OpCode::Reply,
                                &[0u8; 20],
                            );
                            if stream.write_all(&raw).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    struct Fixture {
        client: TcpStream,
        session: JoinHandle<EsclusaResult<SessionStats>>,
        pool: Arc<BackendPool>,
        shutdown_tx: watch::Sender<bool>,
        _view_tx: watch::Sender<Arc<ReplicaSetView>>,
    }

    async fn start_session(
        primary: Option<SocketAddr>,
        secondaries: Vec<SocketAddr>,
        pool_config: PoolConfig,
        session_config: SessionConfig,
    ) -> Fixture {
        let view = ReplicaSetView {
            generation: 1,
            set_name: Some("rs0".to_string()),
            primary,
            secondaries,
            members: Vec::new(),
        };
        let (view_tx, view_rx) = watch::channel(Arc::new(view));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = Arc::new(BackendPool::new(pool_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(proxy_addr).await.unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();

        let session = ProxySession::new(
            server_side,
            peer,
            Arc::clone(&pool),
            view_rx,
            Arc::new(RoundRobin::new()),
            session_config,
            shutdown_rx,
        );
        Fixture {
            client,
            session: tokio::spawn(session.run()),
            pool,
            shutdown_tx,
            _view_tx: view_tx,
        }
    }

    fn quick_pool() -> PoolConfig {
        PoolConfig {
            max_total: 4,
            per_member: 4,
            acquire_timeout: Duration::from_millis(300),
            connect_timeout: Duration::from_secs(1),
        }
    }

    async fn read_reply(client: &mut TcpStream) -> WireMessage {
        read_message(client, DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let member = spawn_member(Arc::clone(&accepts), 0).await;
        let mut fixture =
            start_session(Some(member), vec![], quick_pool(), SessionConfig::default()).await;

        fixture
            .client
            .write_all(query(41, 0).as_bytes())
            .await
            .unwrap();
        let reply = read_reply(&mut fixture.client).await;

        assert_eq!(reply.header.op_code, OpCode::Reply);
        assert_eq!(reply.header.response_to, 41);

        drop(fixture.client);
        let stats = fixture.session.await.unwrap().unwrap();
        assert_eq!(stats.messages_forwarded, 1);
        assert_eq!(stats.replies_relayed, 1);
    }

    #[tokio::test]
    async fn test_responses_delivered_in_request_order() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let member = spawn_member(Arc::clone(&accepts), 0).await;
        let mut fixture =
            start_session(Some(member), vec![], quick_pool(), SessionConfig::default()).await;

        for request_id in [7, 8, 9] {
            fixture
                .client
                .write_all(query(request_id, 0).as_bytes())
                .await
                .unwrap();
        }
        for request_id in [7, 8, 9] {
            let reply = read_reply(&mut fixture.client).await;
            assert_eq!(reply.header.response_to, request_id);
        }
    }

    #[tokio::test]
    async fn test_write_establishes_pin() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let member = spawn_member(Arc::clone(&accepts), 0).await;
        let mut fixture =
            start_session(Some(member), vec![], quick_pool(), SessionConfig::default()).await;

        // fire-and-forget write, then a primary read over the same pin
        fixture
            .client
            .write_all(insert(1).as_bytes())
            .await
            .unwrap();
        fixture
            .client
            .write_all(query(2, 0).as_bytes())
            .await
            .unwrap();
        let reply = read_reply(&mut fixture.client).await;
        assert_eq!(reply.header.response_to, 2);

        // one backend connection served both, and it is still checked out
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.pool.occupancy().in_use, 1);

        // client disconnect releases the pin
        drop(fixture.client);
        fixture.session.await.unwrap().unwrap();
        assert_eq!(fixture.pool.occupancy().in_use, 0);
        assert_eq!(fixture.pool.occupancy().idle, 1);
    }

    #[tokio::test]
    async fn test_ordinary_read_does_not_pin() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let member = spawn_member(Arc::clone(&accepts), 0).await;
        let mut fixture =
            start_session(Some(member), vec![], quick_pool(), SessionConfig::default()).await;

        let slave_ok = 1 << 2;
        fixture
            .client
            .write_all(query(3, slave_ok).as_bytes())
            .await
            .unwrap();
        let reply = read_reply(&mut fixture.client).await;
        assert_eq!(reply.header.response_to, 3);

        // connection goes straight back to the idle set while the session
        // stays open; the release happens just after the reply is relayed
        for _ in 0..50 {
            if fixture.pool.occupancy().in_use == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fixture.pool.occupancy().in_use, 0);
        assert_eq!(fixture.pool.occupancy().idle, 1);
    }

    #[tokio::test]
    async fn test_desync_reply_closes_session() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let member = spawn_member(Arc::clone(&accepts), 7).await;
        let mut fixture =
            start_session(Some(member), vec![], quick_pool(), SessionConfig::default()).await;

        fixture
            .client
            .write_all(query(5, 0).as_bytes())
            .await
            .unwrap();

        let err = fixture.session.await.unwrap().unwrap_err();
        assert!(matches!(err, EsclusaError::ProtocolDesync { .. }));
        // the poisoned connection was discarded, not pooled
        assert_eq!(fixture.pool.occupancy().idle, 0);
        assert_eq!(fixture.pool.occupancy().in_use, 0);
    }

    #[tokio::test]
    async fn test_idle_session_evicted() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let member = spawn_member(Arc::clone(&accepts), 0).await;
        let fixture = start_session(
            Some(member),
            vec![],
            quick_pool(),
            SessionConfig {
                idle_timeout: Duration::from_millis(50),
                max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            },
        )
        .await;

        let stats = fixture.session.await.unwrap().unwrap();
        assert_eq!(stats.messages_forwarded, 0);
    }

    #[tokio::test]
    async fn test_chatty_client_releases_pin() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let member = spawn_member(Arc::clone(&accepts), 0).await;
        let mut fixture =
            start_session(Some(member), vec![], quick_pool(), SessionConfig::default()).await;

        // burst of fire-and-forget writes, never reading anything back
        for request_id in 0..16 {
            fixture
                .client
                .write_all(insert(request_id).as_bytes())
                .await
                .unwrap();
        }
        drop(fixture.client);

        fixture.session.await.unwrap().unwrap();
        let occupancy = fixture.pool.occupancy();
        assert_eq!(occupancy.in_use, 0);
        assert!(occupancy.open <= 1);
    }

    #[tokio::test]
    async fn test_no_primary_fails_write() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let member = spawn_member(Arc::clone(&accepts), 0).await;
        let mut fixture =
            start_session(None, vec![member], quick_pool(), SessionConfig::default()).await;

        fixture
            .client
            .write_all(insert(1).as_bytes())
            .await
            .unwrap();

        let err = fixture.session.await.unwrap().unwrap_err();
        assert!(matches!(err, EsclusaError::NoRoutableMember(_)));
    }

    #[tokio::test]
    async fn test_reads_survive_without_primary() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let member = spawn_member(Arc::clone(&accepts), 0).await;
        let mut fixture =
            start_session(None, vec![member], quick_pool(), SessionConfig::default()).await;

        let slave_ok = 1 << 2;
        fixture
            .client
            .write_all(query(11, slave_ok).as_bytes())
            .await
            .unwrap();
        let reply = read_reply(&mut fixture.client).await;
        assert_eq!(reply.header.response_to, 11);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_surfaces_to_client() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let member = spawn_member(Arc::clone(&accepts), 0).await;
        let mut fixture = start_session(
            Some(member),
            vec![],
            PoolConfig {
                max_total: 0,
                per_member: 1,
                acquire_timeout: Duration::from_millis(50),
                connect_timeout: Duration::from_secs(1),
            },
            SessionConfig::default(),
        )
        .await;

        fixture
            .client
            .write_all(query(1, 0).as_bytes())
            .await
            .unwrap();

        let err = fixture.session.await.unwrap().unwrap_err();
        assert!(matches!(err, EsclusaError::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn test_backend_closing_mid_exchange_fails_session() {
        // a member that accepts and immediately closes
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let member = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
        let mut fixture =
            start_session(Some(member), vec![], quick_pool(), SessionConfig::default()).await;

        fixture
            .client
            .write_all(query(1, 0).as_bytes())
            .await
            .unwrap();

        let err = fixture.session.await.unwrap().unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(fixture.pool.occupancy().idle, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_waiting_session() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let member = spawn_member(Arc::clone(&accepts), 0).await;
        let fixture =
            start_session(Some(member), vec![], quick_pool(), SessionConfig::default()).await;

        fixture.shutdown_tx.send(true).unwrap();

        let stats = fixture.session.await.unwrap().unwrap();
        assert_eq!(stats.messages_forwarded, 0);
    }

    #[tokio::test]
    async fn test_bad_frame_from_client_closes_session() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let member = spawn_member(Arc::clone(&accepts), 0).await;
        let mut fixture =
            start_session(Some(member), vec![], quick_pool(), SessionConfig::default()).await;

        // negative declared length
        let mut raw = build_message(1, 0, OpCode::Query, &[0u8; 8]).to_vec();
        raw[0..4].copy_from_slice(&(-1i32).to_le_bytes());
        fixture.client.write_all(&raw).await.unwrap();

        let err = fixture.session.await.unwrap().unwrap_err();
        assert!(err.is_connection_fatal());

        // the client-facing socket is closed
        let mut buf = [0u8; 1];
        let n = fixture.client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
