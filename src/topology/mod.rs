/// Replica-set topology tracking
///
/// A background task probes every known member on a fixed interval for its
/// self-reported role and member list, merges the results, and publishes an
/// immutable `ReplicaSetView` snapshot through a watch channel. Sessions
/// read whatever snapshot is current and never block on a probe cycle.
pub mod probe;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::pool::BackendPool;
use crate::core::{Member, MemberRole};
use crate::error::EsclusaResult;

/// What one probe of one member yields
#[derive(Debug, Clone)]
pub struct ProbeReply {
    pub role: MemberRole,
    pub hosts: Vec<String>,
    pub round_trip: Duration,
    pub set_name: Option<String>,
}

/// The describe-membership exchange, behind a seam so tests can script
/// cluster behavior
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, member: SocketAddr) -> EsclusaResult<ProbeReply>;
}

/// Immutable snapshot of the replica set as last observed.
///
/// Replaced wholesale each probe cycle; at most one member is primary per
/// generation, and a contested election publishes no primary at all.
#[derive(Debug, Clone)]
pub struct ReplicaSetView {
    pub generation: u64,
    pub set_name: Option<String>,
    pub primary: Option<SocketAddr>,
    pub secondaries: Vec<SocketAddr>,
    pub members: Vec<Member>,
}

impl ReplicaSetView {
    pub fn empty() -> Self {
        Self {
            generation: 0,
            set_name: None,
            primary: None,
            secondaries: Vec::new(),
            members: Vec::new(),
        }
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Members that may serve ordinary reads: the primary plus all
    /// secondaries
    pub fn readable_members(&self) -> Vec<SocketAddr> {
        let mut members = Vec::with_capacity(self.secondaries.len() + 1);
        if let Some(primary) = self.primary {
            members.push(primary);
        }
        members.extend(self.secondaries.iter().copied());
        members
    }
}

/// Tracker timing and damping knobs
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failed cycles before a member's pooled connections are
    /// dropped and, once it also vanishes from membership reports, the
    /// member itself is forgotten
    pub removal_grace_cycles: u32,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            removal_grace_cycles: 3,
        }
    }
}

struct MemberState {
    member: Member,
    missed_cycles: u32,
}

impl MemberState {
    fn new(addr: SocketAddr) -> Self {
        Self {
            member: Member::new(addr),
            missed_cycles: 0,
        }
    }
}

/// Owns the per-member state machine and the published view
pub struct TopologyTracker {
    prober: Arc<dyn Prober>,
    config: TopologyConfig,
    pool: Option<Arc<BackendPool>>,
    seeds: Vec<SocketAddr>,
    members: HashMap<SocketAddr, MemberState>,
    set_name: Option<String>,
    generation: u64,
    tx: watch::Sender<Arc<ReplicaSetView>>,
}

impl TopologyTracker {
    pub fn new(
        seeds: Vec<SocketAddr>,
        prober: Arc<dyn Prober>,
        config: TopologyConfig,
    ) -> (Self, watch::Receiver<Arc<ReplicaSetView>>) {
        let (tx, rx) = watch::channel(Arc::new(ReplicaSetView::empty()));
        let members = seeds
            .iter()
            .map(|&addr| (addr, MemberState::new(addr)))
            .collect();
        (
            Self {
                prober,
                config,
                pool: None,
                seeds,
                members,
                set_name: None,
                generation: 0,
                tx,
            },
            rx,
        )
    }

    /// Attach the pool so connections to departed members get closed
    pub fn with_pool(mut self, pool: Arc<BackendPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Probe loop; runs until shutdown is signalled
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.probe_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.probe_cycle().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Topology tracker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full probe-and-merge cycle; never fails, only demotes
    pub async fn probe_cycle(&mut self) {
        let targets: Vec<SocketAddr> = self.members.keys().copied().collect();
        let probes: Vec<_> = targets
            .iter()
            .map(|addr| {
                let prober = Arc::clone(&self.prober);
                let probe_timeout = self.config.probe_timeout;
                let addr = *addr;
                async move { (addr, timeout(probe_timeout, prober.probe(addr)).await) }
            })
            .collect();
        let outcomes = futures::future::join_all(probes).await;

        let mut reported_hosts: Vec<String> = Vec::new();
        let mut reported: HashSet<SocketAddr> = HashSet::new();

        for (addr, outcome) in outcomes {
            let state = match self.members.get_mut(&addr) {
                Some(state) => state,
                None => continue,
            };
            match outcome {
                Ok(Ok(reply)) => {
                    let old_role = state.member.role;
                    state.member.role = reply.role;
                    state.member.last_seen = Some(SystemTime::now());
                    state.member.round_trip = Some(reply.round_trip);
                    state.missed_cycles = 0;
                    if self.set_name.is_none() {
                        self.set_name = reply.set_name.clone();
                    }
                    reported_hosts.extend(reply.hosts);
                    // A primary/secondary flip invalidates pooled
                    // connections for pinned-write purposes
                    if old_role.readable() && reply.role.readable() && old_role != reply.role {
                        warn!("Member {} changed role {:?} -> {:?}", addr, old_role, reply.role);
                        if let Some(pool) = &self.pool {
                            pool.shrink(addr);
                        }
                    }
                }
                Ok(Err(e)) => {
                    state.missed_cycles += 1;
                    state.member.role = MemberRole::Unreachable;
                    warn!(
                        "Probe of {} failed ({} consecutive): {}",
                        addr, state.missed_cycles, e
                    );
                }
                Err(_) => {
                    state.missed_cycles += 1;
                    state.member.role = MemberRole::Unreachable;
                    warn!(
                        "Probe of {} timed out ({} consecutive)",
                        addr, state.missed_cycles
                    );
                }
            }
        }

        // Adopt members the cluster itself reports
        for host in reported_hosts {
            if let Some(addr) = resolve_host(&host).await {
                reported.insert(addr);
                self.members
                    .entry(addr)
                    .or_insert_with(|| MemberState::new(addr));
            }
        }

        // Forget members that stayed unreachable across the grace period
        // and are no longer part of the cluster's own membership report
        let grace = self.config.removal_grace_cycles;
        let expired: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|(addr, state)| state.missed_cycles >= grace && !reported.contains(*addr))
            .map(|(addr, _)| *addr)
            .collect();
        for addr in expired {
            warn!("Removing member {} after {} missed probe cycles", addr, grace);
            self.members.remove(&addr);
            if let Some(pool) = &self.pool {
                pool.drop_member(addr);
            }
        }
        if let Some(pool) = &self.pool {
            for (addr, state) in self.members.iter() {
                if state.missed_cycles >= grace {
                    pool.drop_member(*addr);
                }
            }
        }

        // If everything was removed, fall back to the configured seeds so
        // a recovered cluster can be rediscovered
        if self.members.is_empty() {
            warn!("All members removed; reverting to configured seeds");
            for &addr in &self.seeds {
                self.members.insert(addr, MemberState::new(addr));
            }
        }

        self.publish();
    }

    fn publish(&mut self) {
        let mut primaries: Vec<SocketAddr> = self
            .members
            .values()
            .filter(|s| s.member.role == MemberRole::Primary)
            .map(|s| s.member.addr)
            .collect();
        let primary = match primaries.len() {
            1 => primaries.pop(),
            0 => None,
            n => {
                // Contested election: do not route writes to a possibly
                // stale primary
                warn!("{} members claim primary; publishing no primary", n);
                None
            }
        };

        let mut secondaries: Vec<SocketAddr> = self
            .members
            .values()
            .filter(|s| s.member.role == MemberRole::Secondary)
            .map(|s| s.member.addr)
            .collect();
        secondaries.sort();

        self.generation += 1;
        let mut members: Vec<Member> = self.members.values().map(|s| s.member.clone()).collect();
        members.sort_by_key(|m| m.addr);

        let view = ReplicaSetView {
            generation: self.generation,
            set_name: self.set_name.clone(),
            primary,
            secondaries,
            members,
        };
        debug!(
            "Published topology generation {}: primary={:?}, {} secondaries",
            view.generation,
            view.primary,
            view.secondaries.len()
        );
        self.tx.send_replace(Arc::new(view));
    }

    /// Current number of known members (tests and observability)
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// Resolve a host string from a membership report to a socket address
async fn resolve_host(host: &str) -> Option<SocketAddr> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Some(addr);
    }
    match tokio::net::lookup_host(host).await {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            warn!("Could not resolve reported host {}: {}", host, e);
            None
        }
    }
}
