//! Storage node membership

use crate::assignment::ServerName;
use crate::common::NodeState;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::info;

const DEATH_CHANNEL_CAPACITY: usize = 1024;

/// Liveness view of the storage fleet
pub trait NodeRegistry: Send + Sync {
    fn is_live(&self, server: &ServerName) -> bool;

    /// Declare `server` dead. Returns true if this call changed its state.
    fn mark_dead(&self, server: &ServerName) -> bool;

    fn live_servers(&self) -> Vec<ServerName>;

    /// Stream of servers as they are declared dead
    fn subscribe_deaths(&self) -> broadcast::Receiver<ServerName>;
}

pub struct InMemoryNodeRegistry {
    servers: RwLock<HashMap<ServerName, NodeState>>,
    deaths: broadcast::Sender<ServerName>,
}

impl InMemoryNodeRegistry {
    pub fn new() -> Self {
        let (deaths, _) = broadcast::channel(DEATH_CHANNEL_CAPACITY);
        Self {
            servers: RwLock::new(HashMap::new()),
            deaths,
        }
    }

    pub fn register(&self, server: ServerName) {
        info!("Registered server {}", server);
        self.servers.write().insert(server, NodeState::Alive);
    }

    /// Bring a server back under a new start code. The old incarnation is
    /// declared dead first.
    pub fn restart(&self, server: &ServerName) -> ServerName {
        self.mark_dead(server);

        let next_code = {
            let servers = self.servers.read();
            servers
                .keys()
                .filter(|s| s.same_address(server))
                .map(|s| s.start_code)
                .max()
                .unwrap_or(server.start_code)
                + 1
        };
        let restarted = ServerName::new(server.host.clone(), server.port, next_code);
        self.register(restarted.clone());
        restarted
    }

    pub fn state(&self, server: &ServerName) -> Option<NodeState> {
        self.servers.read().get(server).copied()
    }

    pub fn dead_servers(&self) -> Vec<ServerName> {
        let mut dead: Vec<ServerName> = self
            .servers
            .read()
            .iter()
            .filter(|(_, state)| !state.is_live())
            .map(|(server, _)| server.clone())
            .collect();
        dead.sort();
        dead
    }
}

impl Default for InMemoryNodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry for InMemoryNodeRegistry {
    fn is_live(&self, server: &ServerName) -> bool {
        self.servers
            .read()
            .get(server)
            .map_or(false, |state| state.is_live())
    }

    fn mark_dead(&self, server: &ServerName) -> bool {
        let changed = {
            let mut servers = self.servers.write();
            let previous = servers.insert(server.clone(), NodeState::Dead);
            previous != Some(NodeState::Dead)
        };

        if changed {
            info!("Server {} declared dead", server);
            // No subscribers is fine
            let _ = self.deaths.send(server.clone());
        }
        changed
    }

    fn live_servers(&self) -> Vec<ServerName> {
        let mut live: Vec<ServerName> = self
            .servers
            .read()
            .iter()
            .filter(|(_, state)| state.is_live())
            .map(|(server, _)| server.clone())
            .collect();
        live.sort();
        live
    }

    fn subscribe_deaths(&self) -> broadcast::Receiver<ServerName> {
        self.deaths.subscribe()
    }
}
