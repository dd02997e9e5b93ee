//! Agent-side tunnel table and connect-ack rendezvous.
//!
//! Tunnel ids arrive in two flavors on the same wire: ids Cloud chose
//! (for `cloud→agent` connects, where this agent is the dial target) and
//! ids this agent chooses itself (for `agent→cloud`/`agent→agent` rules
//! it sources). To guarantee the two never collide on one connection,
//! this agent allocates its own ids from the top half of the u32 range;
//! Cloud's allocator starts at 1 and would need billions of tunnels in a
//! single process lifetime to ever reach that far.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Notify};
use tunnel_protocol::ConnectAckPayload;

const LOCAL_ID_START: u32 = u32::MAX / 2;

pub struct AgentTunnel {
    pub id: u32,
    pub rule_id: Option<String>,
    pub to_socket_tx: mpsc::Sender<Vec<u8>>,
    pub closed: Notify,
}

#[derive(Default)]
pub struct AgentTunnelTable {
    tunnels: DashMap<u32, Arc<AgentTunnel>>,
    next_local_id: AtomicU32,
}

impl AgentTunnelTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tunnels: DashMap::new(),
            next_local_id: AtomicU32::new(LOCAL_ID_START),
        })
    }

    /// Allocates an id for a tunnel this agent initiates.
    pub fn alloc_local_id(&self) -> u32 {
        self.next_local_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, tunnel: Arc<AgentTunnel>) {
        self.tunnels.insert(tunnel.id, tunnel);
    }

    pub fn get(&self, id: u32) -> Option<Arc<AgentTunnel>> {
        self.tunnels.get(&id).map(|e| e.value().clone())
    }

    pub fn remove(&self, id: u32) -> Option<Arc<AgentTunnel>> {
        self.tunnels.remove(&id).map(|(_, t)| t)
    }
}

#[derive(Default)]
pub struct AgentPendingAckTable {
    pending: DashMap<u32, oneshot::Sender<ConnectAckPayload>>,
}

impl AgentPendingAckTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, tunnel_id: u32) -> oneshot::Receiver<ConnectAckPayload> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(tunnel_id, tx);
        rx
    }

    pub fn complete(&self, tunnel_id: u32, ack: ConnectAckPayload) -> bool {
        match self.pending.remove(&tunnel_id) {
            Some((_, tx)) => tx.send(ack).is_ok(),
            None => false,
        }
    }

    pub fn evict(&self, tunnel_id: u32) {
        self.pending.remove(&tunnel_id);
    }
}
