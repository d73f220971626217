/// Active session registry
use fnv::FnvHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::utils::generate_id;

/// One live client session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub client_addr: SocketAddr,
    pub connected_at: SystemTime,
}

/// Tracks every accepted session for observability.
///
/// Entries are removed by the guard handed out at registration, so a
/// session that dies on any path still unregisters itself.
pub struct SessionRegistry {
    sessions: Mutex<FnvHashMap<String, SessionInfo>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Register a new session; dropping the returned guard unregisters it
    pub fn register(self: &Arc<Self>, client_addr: SocketAddr) -> SessionGuard {
        let info = SessionInfo {
            id: generate_id("session"),
            client_addr,
            connected_at: SystemTime::now(),
        };
        let id = info.id.clone();
        self.sessions.lock().unwrap().insert(id.clone(), info);
        SessionGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// All sessions from a specific client address
    pub fn sessions_for_client(&self, client_addr: SocketAddr) -> Vec<SessionInfo> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|info| info.client_addr == client_addr)
            .cloned()
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes its registry entry on drop
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: String,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.sessions.lock().unwrap().remove(&self.id);
    }
}
