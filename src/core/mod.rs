/// Core abstractions shared across the proxy
pub mod connection;
pub mod pool;
pub mod registry;
pub mod session;

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

/// Role a replica-set member reports for itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    /// Accepts writes
    Primary,
    /// Replicates from the primary, may serve reads
    Secondary,
    /// Reachable but neither primary nor secondary (arbiter, recovering)
    Unknown,
    /// Failed its most recent probe
    Unreachable,
}

impl MemberRole {
    /// Whether reads may be routed to a member in this role
    pub fn readable(&self) -> bool {
        matches!(self, MemberRole::Primary | MemberRole::Secondary)
    }
}

/// One known replica-set member, as last observed by the topology tracker.
/// Mutated only by the tracker; everyone else reads published snapshots.
#[derive(Debug, Clone)]
pub struct Member {
    pub addr: SocketAddr,
    pub role: MemberRole,
    pub last_seen: Option<SystemTime>,
    pub round_trip: Option<Duration>,
}

impl Member {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            role: MemberRole::Unknown,
            last_seen: None,
            round_trip: None,
        }
    }
}
