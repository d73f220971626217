/// Backend connection pool
///
/// Owns every connection the proxy holds toward the cluster. Capacity is
/// deliberately small and shared: many client sessions funnel into a few
/// persistent backend connections per member, bounded per member and by a
/// global ceiling across all members.
///
/// Checkouts are scoped: `acquire` hands out a `PooledConn` guard whose
/// drop either returns the connection to the idle set or closes it, so a
/// connection can never be released twice or leak on an abnormal exit
/// path. Capacity accounting rides on semaphore permits owned by the
/// guard.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::connection::{ConnectResult, Dialer};
use crate::error::EsclusaError;

/// Pool sizing and timeouts
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Global ceiling on open backend connections across all members
    pub max_total: usize,
    /// Ceiling on open connections per cluster member
    pub per_member: usize,
    /// How long an acquire may wait before failing with pool exhaustion
    pub acquire_timeout: Duration,
    /// Backend dial timeout
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 64,
            per_member: 8,
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-member state: its capacity gate, idle connections, open count
#[derive(Debug)]
struct MemberSlot {
    addr: SocketAddr,
    limit: Arc<Semaphore>,
    idle: Mutex<Vec<TcpStream>>,
    open: AtomicUsize,
    retired: AtomicBool,
}

impl MemberSlot {
    fn new(addr: SocketAddr, per_member: usize) -> Self {
        Self {
            addr,
            limit: Arc::new(Semaphore::new(per_member)),
            idle: Mutex::new(Vec::new()),
            open: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
        }
    }
}

/// A checked-out backend connection.
///
/// Exclusively owned by one session while held. Dropping the guard
/// releases the capacity it occupies: a healthy connection goes back to
/// the idle set, a broken or retired one is closed.
#[derive(Debug)]
pub struct PooledConn {
    stream: Option<TcpStream>,
    slot: Arc<MemberSlot>,
    healthy: bool,
    _member_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

impl PooledConn {
    /// The member this connection is open to
    pub fn member(&self) -> SocketAddr {
        self.slot.addr
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("stream present until drop")
    }

    /// Flag the connection as unusable; it will be closed instead of
    /// returned to the idle set
    pub fn mark_broken(&mut self) {
        self.healthy = false;
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        if self.healthy && !self.slot.retired.load(Ordering::Acquire) {
            // Return before the permits (held by self) are released, so
            // the next acquire granted a permit always sees this
            // connection in the idle set.
            self.slot.idle.lock().unwrap().push(stream);
            debug!("Returned connection to idle set for {}", self.slot.addr);
        } else {
            self.slot.open.fetch_sub(1, Ordering::AcqRel);
            debug!("Discarded backend connection to {}", self.slot.addr);
        }
    }
}

/// Per-member occupancy snapshot
#[derive(Debug, Clone, Default)]
pub struct MemberOccupancy {
    pub open: usize,
    pub idle: usize,
}

/// Whole-pool occupancy snapshot for observability
#[derive(Debug, Clone)]
pub struct PoolOccupancy {
    pub capacity: usize,
    pub in_use: usize,
    pub open: usize,
    pub idle: usize,
    pub members: HashMap<SocketAddr, MemberOccupancy>,
}

/// The pool itself; one per proxy instance, shared by all sessions
pub struct BackendPool {
    config: PoolConfig,
    dialer: Dialer,
    global: Arc<Semaphore>,
    members: Mutex<HashMap<SocketAddr, Arc<MemberSlot>>>,
}

impl BackendPool {
    pub fn new(config: PoolConfig) -> Self {
        let dialer = Dialer::new(config.connect_timeout);
        let global = Arc::new(Semaphore::new(config.max_total));
        Self {
            config,
            dialer,
            global,
            members: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, member: SocketAddr) -> Arc<MemberSlot> {
        let mut members = self.members.lock().unwrap();
        members
            .entry(member)
            .or_insert_with(|| Arc::new(MemberSlot::new(member, self.config.per_member)))
            .clone()
    }

    /// Check out a connection to `member`.
    ///
    /// Reuses an idle connection when one exists, dials a new one while
    /// under capacity, and otherwise waits until a connection is released
    /// or the acquire timeout elapses.
    pub async fn acquire(&self, member: SocketAddr) -> Result<PooledConn, EsclusaError> {
        let deadline = Instant::now() + self.config.acquire_timeout;

        let global_permit = timeout_at(deadline, self.global.clone().acquire_owned())
            .await
            .map_err(|_| EsclusaError::PoolExhausted { member })?
            .map_err(|_| EsclusaError::internal("pool semaphore closed"))?;

        let slot = self.slot(member);
        let member_permit = timeout_at(deadline, slot.limit.clone().acquire_owned())
            .await
            .map_err(|_| EsclusaError::PoolExhausted { member })?
            .map_err(|_| EsclusaError::internal("member semaphore closed"))?;

        let reused = slot.idle.lock().unwrap().pop();
        let stream = match reused {
            Some(stream) => stream,
            None => match self.dialer.connect(member).await {
                ConnectResult::Success(stream) => {
                    slot.open.fetch_add(1, Ordering::AcqRel);
                    stream
                }
                ConnectResult::Timeout => {
                    return Err(EsclusaError::unreachable(member, "connect timeout"))
                }
                ConnectResult::ConnectionRefused => {
                    return Err(EsclusaError::unreachable(member, "connection refused"))
                }
                ConnectResult::NetworkError(e) => {
                    return Err(EsclusaError::unreachable(member, e.to_string()))
                }
            },
        };

        Ok(PooledConn {
            stream: Some(stream),
            slot,
            healthy: true,
            _member_permit: member_permit,
            _global_permit: global_permit,
        })
    }

    /// Close the idle connections to a member while keeping it usable;
    /// applied when a member changes role but remains in the cluster
    pub fn shrink(&self, member: SocketAddr) {
        let slot = self.members.lock().unwrap().get(&member).cloned();
        if let Some(slot) = slot {
            let drained: Vec<TcpStream> = slot.idle.lock().unwrap().drain(..).collect();
            slot.open.fetch_sub(drained.len(), Ordering::AcqRel);
            debug!(
                "Shrank member {}: closed {} idle connections",
                member,
                drained.len()
            );
        }
    }

    /// Close every pooled connection to a member that left the cluster or
    /// became unreachable. Checked-out connections die on release because
    /// the slot is retired.
    pub fn drop_member(&self, member: SocketAddr) {
        let slot = self.members.lock().unwrap().remove(&member);
        if let Some(slot) = slot {
            slot.retired.store(true, Ordering::Release);
            let drained: Vec<TcpStream> = slot.idle.lock().unwrap().drain(..).collect();
            slot.open.fetch_sub(drained.len(), Ordering::AcqRel);
            debug!(
                "Dropped member {}: closed {} idle connections",
                member,
                drained.len()
            );
        }
    }

    /// Current pool occupancy for observability
    pub fn occupancy(&self) -> PoolOccupancy {
        let members = self.members.lock().unwrap();
        let mut per_member = HashMap::new();
        let mut open = 0;
        let mut idle = 0;
        for (addr, slot) in members.iter() {
            let slot_open = slot.open.load(Ordering::Acquire);
            let slot_idle = slot.idle.lock().unwrap().len();
            open += slot_open;
            idle += slot_idle;
            per_member.insert(
                *addr,
                MemberOccupancy {
                    open: slot_open,
                    idle: slot_idle,
                },
            );
        }
        PoolOccupancy {
            capacity: self.config.max_total,
            in_use: self.config.max_total - self.global.available_permits(),
            open,
            idle,
            members: per_member,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}
