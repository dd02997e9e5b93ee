//! Tunnel table and pending-ack rendezvous.
//!
//! Tunnel ↔ session references are a cycle (the session owns tunnels,
//! tunnels need their session to send frames). Per the design notes, a
//! tunnel holds only its owning agent's id and looks the session up
//! through the registry on every send rather than an owning reference —
//! so dropping a session never has to chase down every tunnel that
//! pointed at it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Notify};
use tunnel_protocol::{ConnectAckPayload, Protocol};

pub struct Tunnel {
    pub id: u32,
    pub protocol: Protocol,
    pub owning_agent_id: String,
    pub rule_id: String,
    pub created_at: Instant,
    /// Bytes arriving from the agent (via the dispatcher) are pushed here
    /// for the pump task to write to the accepted/dialed socket.
    pub to_socket_tx: mpsc::Sender<Vec<u8>>,
    /// Fired when the agent side sends `Close`, so the pump's read loop —
    /// otherwise blocked on the local socket — can unwind immediately
    /// instead of waiting for its own next read to fail.
    pub closed: Notify,
}

#[derive(Default)]
pub struct TunnelTable {
    tunnels: DashMap<u32, Arc<Tunnel>>,
    next_id: AtomicU32,
}

impl TunnelTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocates a fresh, process-wide-unique tunnel id.
    pub fn alloc_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
            // Skip the wrap-around-to-zero id: 0 is reserved for
            // channel-scoped frames.
        }
    }

    pub fn insert(&self, tunnel: Arc<Tunnel>) {
        self.tunnels.insert(tunnel.id, tunnel);
    }

    pub fn get(&self, id: u32) -> Option<Arc<Tunnel>> {
        self.tunnels.get(&id).map(|e| e.value().clone())
    }

    pub fn remove(&self, id: u32) -> Option<Arc<Tunnel>> {
        self.tunnels.remove(&id).map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Returns the ids of every tunnel owned by `agent_id`, for session
    /// teardown.
    pub fn ids_for_agent(&self, agent_id: &str) -> Vec<u32> {
        self.tunnels
            .iter()
            .filter(|e| e.value().owning_agent_id == agent_id)
            .map(|e| *e.key())
            .collect()
    }
}

/// One-shot rendezvous between an accept task awaiting `ConnectAck` and
/// the dispatcher that eventually delivers it.
#[derive(Default)]
pub struct PendingAckTable {
    pending: DashMap<u32, oneshot::Sender<ConnectAckPayload>>,
}

impl PendingAckTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, tunnel_id: u32) -> oneshot::Receiver<ConnectAckPayload> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(tunnel_id, tx);
        rx
    }

    /// Delivers the ack to a waiting accept task. Returns `false` if
    /// nothing was waiting (already timed out and evicted, or a stray
    /// ack for an unknown tunnel).
    pub fn complete(&self, tunnel_id: u32, ack: ConnectAckPayload) -> bool {
        match self.pending.remove(&tunnel_id) {
            Some((_, tx)) => tx.send(ack).is_ok(),
            None => false,
        }
    }

    /// Evicts an entry that is no longer awaited (timeout or cancellation).
    pub fn evict(&self, tunnel_id: u32) {
        self.pending.remove(&tunnel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_id_never_returns_zero() {
        let table = TunnelTable::new();
        table.next_id.store(u32::MAX, Ordering::Relaxed);
        let id = table.alloc_id();
        assert_ne!(id, 0);
    }

    #[test]
    fn ids_for_agent_only_returns_matching_tunnels() {
        let table = TunnelTable::new();
        let (tx, _rx) = mpsc::channel(1);
        table.insert(Arc::new(Tunnel {
            id: 1,
            protocol: Protocol::Tcp,
            owning_agent_id: "A1".to_string(),
            rule_id: "r1".to_string(),
            created_at: Instant::now(),
            to_socket_tx: tx.clone(),
            closed: Notify::new(),
        }));
        table.insert(Arc::new(Tunnel {
            id: 2,
            protocol: Protocol::Tcp,
            owning_agent_id: "A2".to_string(),
            rule_id: "r1".to_string(),
            created_at: Instant::now(),
            to_socket_tx: tx,
            closed: Notify::new(),
        }));
        assert_eq!(table.ids_for_agent("A1"), vec![1]);
    }

    #[tokio::test]
    async fn pending_ack_completes_exactly_once() {
        let table = PendingAckTable::new();
        let rx = table.register(5);
        let ack = ConnectAckPayload {
            success: true,
            error: None,
        };
        assert!(table.complete(5, ack.clone()));
        assert!(!table.complete(5, ack));
        assert!(rx.await.unwrap().success);
    }
}
