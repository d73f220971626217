//! Esclusa - connection-pooling proxy for MongoDB replica sets
//!
//! Esclusa sits between many client processes and a replica set, funneling
//! an unbounded number of client connections into a small, bounded pool of
//! persistent backend connections per member:
//!
//! 1. A topology tracker probes members for their roles and publishes
//!    immutable snapshots
//! 2. Each accepted client gets its own relay session that routes writes
//!    to the primary and spreads ordinary reads across readable members
//! 3. A shared pool caps backend connections per member and globally

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod routing;
pub mod topology;
pub mod utils;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ConfigError;
use crate::core::connection::{accept_client, create_listener};
use crate::core::pool::{BackendPool, PoolConfig, PoolOccupancy};
use crate::core::registry::SessionRegistry;
use crate::core::session::{ProxySession, SessionConfig};
use crate::error::{EsclusaError, EsclusaResult};
use crate::routing::{MemberSelector, RoundRobin};
use crate::topology::probe::WireProber;
use crate::topology::{Prober, ReplicaSetView, TopologyConfig, TopologyTracker};

/// Runtime proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: String,
    /// Seed members of the replica set (host:port)
    pub seed_members: Vec<String>,
    /// Global ceiling on open backend connections
    pub max_connections: usize,
    /// Ceiling on open backend connections per member
    pub pool_per_member: usize,
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_message_size: usize,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub removal_grace_cycles: u32,
}

impl ProxyConfig {
    /// Create a new proxy configuration with validation
    pub fn new(
        listen_addr: String,
        seed_members: Vec<String>,
        max_connections: usize,
    ) -> Result<Self, String> {
        if listen_addr.trim().is_empty() {
            return Err("Listen address cannot be empty".to_string());
        }

        if seed_members.is_empty() {
            return Err("At least one replica set member is required".to_string());
        }

        for member in &seed_members {
            if member.trim().is_empty() {
                return Err("Empty member address not allowed".to_string());
            }
            if !member.contains(':') {
                return Err(format!(
                    "Invalid member address '{}': must be host:port",
                    member
                ));
            }
        }

        if max_connections == 0 {
            return Err("Max connections must be greater than 0".to_string());
        }

        Ok(Self {
            listen_addr,
            seed_members,
            max_connections,
            pool_per_member: 8,
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(3600),
            max_message_size: protocol::DEFAULT_MAX_MESSAGE_SIZE,
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            removal_grace_cycles: 3,
        })
    }

    /// Check if the configuration is valid
    pub fn is_valid(&self) -> bool {
        !self.listen_addr.trim().is_empty()
            && !self.seed_members.is_empty()
            && self.max_connections > 0
            && self.pool_per_member > 0
    }
}

/// Handles held while the proxy is serving
struct Running {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    pool: Arc<BackendPool>,
    view_rx: watch::Receiver<Arc<ReplicaSetView>>,
    registry: Arc<SessionRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

/// Main proxy instance
pub struct Esclusa {
    config: ProxyConfig,
    running: Option<Running>,
}

impl Esclusa {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            running: None,
        }
    }

    /// Get the current configuration
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Check if the proxy is serving
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind the listener, start the topology tracker and begin accepting
    /// clients.
    ///
    /// Refuses to start with a backend connection limit of zero: a proxy
    /// with no backend capacity cannot serve anything.
    pub async fn start(&mut self) -> EsclusaResult<()> {
        self.start_with_prober(Arc::new(WireProber::new())).await
    }

    /// Start with a custom prober (tests script cluster behavior this way)
    pub async fn start_with_prober(&mut self, prober: Arc<dyn Prober>) -> EsclusaResult<()> {
        if self.running.is_some() {
            return Err(EsclusaError::internal("proxy already started"));
        }
        if self.config.max_connections == 0 {
            return Err(EsclusaError::ZeroMaxConnections);
        }

        let mut seeds: Vec<SocketAddr> = Vec::new();
        for member in &self.config.seed_members {
            match resolve_member(member).await {
                Some(addr) => seeds.push(addr),
                None => warn!("Could not resolve seed member {}", member),
            }
        }
        if seeds.is_empty() {
            return Err(EsclusaError::Config(ConfigError::ValidationError(
                "no seed member could be resolved".to_string(),
            )));
        }

        let listener = create_listener(&self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let pool = Arc::new(BackendPool::new(PoolConfig {
            max_total: self.config.max_connections,
            per_member: self.config.pool_per_member,
            acquire_timeout: self.config.acquire_timeout,
            connect_timeout: self.config.connect_timeout,
        }));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (tracker, view_rx) = TopologyTracker::new(
            seeds,
            prober,
            TopologyConfig {
                probe_interval: self.config.probe_interval,
                probe_timeout: self.config.probe_timeout,
                removal_grace_cycles: self.config.removal_grace_cycles,
            },
        );
        let tracker = tracker.with_pool(Arc::clone(&pool));
        let tracker_task = tokio::spawn(tracker.run(shutdown_rx.clone()));

        let registry = Arc::new(SessionRegistry::new());
        let session_config = SessionConfig {
            idle_timeout: self.config.idle_timeout,
            max_message_size: self.config.max_message_size,
        };
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&pool),
            view_rx.clone(),
            Arc::clone(&registry),
            session_config,
            shutdown_rx,
        ));

        info!(
            "Proxy listening on {} for replica set {:?}",
            local_addr, self.config.seed_members
        );

        self.running = Some(Running {
            local_addr,
            shutdown_tx,
            pool,
            view_rx,
            registry,
            tasks: vec![tracker_task, accept_task],
        });
        Ok(())
    }

    /// Stop accepting, signal every session and the tracker, and wait for
    /// the background tasks to finish
    pub async fn shutdown(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(true);
            for task in running.tasks {
                let _ = task.await;
            }
            info!("Proxy on {} stopped", running.local_addr);
        }
    }

    /// The address the proxy is serving on
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Current topology snapshot
    pub fn topology(&self) -> Option<Arc<ReplicaSetView>> {
        self.running.as_ref().map(|r| r.view_rx.borrow().clone())
    }

    /// Current pool occupancy
    pub fn occupancy(&self) -> Option<PoolOccupancy> {
        self.running.as_ref().map(|r| r.pool.occupancy())
    }

    /// Number of live client sessions
    pub fn session_count(&self) -> Option<usize> {
        self.running.as_ref().map(|r| r.registry.session_count())
    }
}

/// Accept clients until shutdown; one relay task per client
async fn accept_loop(
    listener: TcpListener,
    pool: Arc<BackendPool>,
    view_rx: watch::Receiver<Arc<ReplicaSetView>>,
    registry: Arc<SessionRegistry>,
    session_config: SessionConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let selector: Arc<dyn MemberSelector> = Arc::new(RoundRobin::new());
    loop {
        tokio::select! {
            accepted = accept_client(&listener) => match accepted {
                Ok((stream, peer)) => {
                    let guard = registry.register(peer);
                    let session = ProxySession::new(
                        stream,
                        peer,
                        Arc::clone(&pool),
                        view_rx.clone(),
                        Arc::clone(&selector),
                        session_config.clone(),
                        shutdown.clone(),
                    );
                    tokio::spawn(async move {
                        let _guard = guard;
                        if let Err(e) = session.run().await {
                            warn!(
                                "Session from {} ended with {} error: {}",
                                peer,
                                e.severity(),
                                e
                            );
                        }
                    });
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Accept loop stopping");
                    break;
                }
            }
        }
    }
}

/// Resolve a configured member address, going through DNS when it is not
/// a socket address literal
async fn resolve_member(member: &str) -> Option<SocketAddr> {
    if let Ok(addr) = member.parse::<SocketAddr>() {
        return Some(addr);
    }
    match tokio::net::lookup_host(member).await {
        Ok(mut addrs) => addrs.next(),
        Err(_) => None,
    }
}
