/// Target selection for client messages
///
/// Writes, primary reads and cursor continuations go to the primary (or
/// the session's pinned connection); ordinary reads are spread across all
/// readable members.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::protocol::MessageClass;
use crate::topology::ReplicaSetView;

/// Result of a routing decision
#[derive(Debug, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Route to a specific member
    Route { target: SocketAddr },
    /// Surface an error to the client
    Error { message: String },
}

/// Member selection among the readable set
pub trait MemberSelector: Send + Sync {
    fn select(&self, members: &[SocketAddr]) -> Option<SocketAddr>;
}

/// Round-robin member selection
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl MemberSelector for RoundRobin {
    fn select(&self, members: &[SocketAddr]) -> Option<SocketAddr> {
        if members.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % members.len();
        Some(members[index])
    }
}

/// Pick a target member for a message of the given class against the
/// current topology snapshot
pub fn route(
    view: &ReplicaSetView,
    class: MessageClass,
    selector: &dyn MemberSelector,
) -> RoutingDecision {
    if class.needs_primary() {
        match view.primary {
            Some(target) => RoutingDecision::Route { target },
            None => RoutingDecision::Error {
                message: "No primary available".to_string(),
            },
        }
    } else {
        match selector.select(&view.readable_members()) {
            Some(target) => RoutingDecision::Route { target },
            None => RoutingDecision::Error {
                message: "No readable members available".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(primary: Option<&str>, secondaries: &[&str]) -> ReplicaSetView {
        ReplicaSetView {
            generation: 1,
            set_name: Some("rs0".to_string()),
            primary: primary.map(|p| p.parse().unwrap()),
            secondaries: secondaries.iter().map(|s| s.parse().unwrap()).collect(),
            members: Vec::new(),
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let selector = RoundRobin::new();
        let members: Vec<SocketAddr> = vec![
            "127.0.0.1:27017".parse().unwrap(),
            "127.0.0.1:27018".parse().unwrap(),
            "127.0.0.1:27019".parse().unwrap(),
        ];

        assert_eq!(selector.select(&members), Some(members[0]));
        assert_eq!(selector.select(&members), Some(members[1]));
        assert_eq!(selector.select(&members), Some(members[2]));
        assert_eq!(selector.select(&members), Some(members[0]));
    }

    #[test]
    fn test_round_robin_empty() {
        let selector = RoundRobin::new();
        assert_eq!(selector.select(&[]), None);
    }

    #[test]
    fn test_writes_route_to_primary() {
        let view = view(Some("127.0.0.1:27017"), &["127.0.0.1:27018"]);
        let selector = RoundRobin::new();

        let decision = route(&view, MessageClass::Write, &selector);
        assert_eq!(
            decision,
            RoutingDecision::Route {
                target: "127.0.0.1:27017".parse().unwrap()
            }
        );
    }

    #[test]
    fn test_writes_fail_without_primary() {
        let view = view(None, &["127.0.0.1:27018"]);
        let selector = RoundRobin::new();

        let decision = route(&view, MessageClass::Write, &selector);
        assert!(matches!(decision, RoutingDecision::Error { .. }));
    }

    #[test]
    fn test_reads_spread_over_readable_members() {
        let view = view(Some("127.0.0.1:27017"), &["127.0.0.1:27018", "127.0.0.1:27019"]);
        let selector = RoundRobin::new();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            match route(&view, MessageClass::Read, &selector) {
                RoutingDecision::Route { target } => {
                    seen.insert(target);
                }
                other => panic!("unexpected decision: {:?}", other),
            }
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_reads_can_use_secondaries_without_primary() {
        let view = view(None, &["127.0.0.1:27018"]);
        let selector = RoundRobin::new();

        let decision = route(&view, MessageClass::Read, &selector);
        assert_eq!(
            decision,
            RoutingDecision::Route {
                target: "127.0.0.1:27018".parse().unwrap()
            }
        );
    }

    #[test]
    fn test_cursor_ops_need_primary_when_unpinned() {
        let view = view(Some("127.0.0.1:27017"), &[]);
        let selector = RoundRobin::new();

        let decision = route(&view, MessageClass::Affinity, &selector);
        assert_eq!(
            decision,
            RoutingDecision::Route {
                target: "127.0.0.1:27017".parse().unwrap()
            }
        );
    }
}
