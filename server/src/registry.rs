//! Agent registry.
//!
//! Keyed by agent id. Each session serializes its outbound frames through
//! a bounded mpsc queue drained by a single writer task, so concurrent
//! senders (the forwarder's pump loops, the dispatcher's relay path, the
//! heartbeat timer) never interleave a frame at the byte level. The bound
//! is the backpressure fix: a session that cannot keep
//! up gets its slowest tunnel dropped rather than letting Cloud buffer
//! unboundedly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tunnel_protocol::Frame;

/// Outbound frames queued per session before the writer task falls behind.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub struct AgentSession {
    pub agent_id: String,
    pub name: String,
    pub remote_addr: SocketAddr,
    pub connected_at: i64,
    last_heartbeat: AtomicI64,
    outbound_tx: mpsc::Sender<Frame>,
    pub tunnel_ids: DashSet<u32>,
    pub active_tunnels: AtomicU64,
}

impl AgentSession {
    pub fn new(
        agent_id: String,
        name: String,
        remote_addr: SocketAddr,
        outbound_tx: mpsc::Sender<Frame>,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent_id,
            name,
            remote_addr,
            connected_at: now_secs(),
            last_heartbeat: AtomicI64::new(now_secs()),
            outbound_tx,
            tunnel_ids: DashSet::new(),
            active_tunnels: AtomicU64::new(0),
        })
    }

    pub fn touch_heartbeat(&self) {
        self.last_heartbeat.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_stale(&self, timeout_secs: i64) -> bool {
        now_secs() - self.last_heartbeat.load(Ordering::Relaxed) > timeout_secs
    }

    /// Enqueues a frame for the writer task. Returns `Err` if the queue is
    /// full (session too slow) or the session is gone; either way the
    /// caller should treat the owning tunnel as dead, not the session.
    pub async fn try_send(&self, frame: Frame) -> Result<(), ()> {
        self.outbound_tx.try_send(frame).map_err(|_| ())
    }

    /// Blocking send used for control-plane frames (`AuthAck`, `Heartbeat`)
    /// where dropping would be worse than a short wait.
    pub async fn send(&self, frame: Frame) -> Result<(), ()> {
        self.outbound_tx.send(frame).await.map_err(|_| ())
    }
}

#[derive(Default)]
pub struct AgentRegistry {
    sessions: DashMap<String, Arc<AgentSession>>,
}

impl AgentRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, session: Arc<AgentSession>) {
        self.sessions.insert(session.agent_id.clone(), session);
    }

    pub fn remove(&self, agent_id: &str) -> Option<Arc<AgentSession>> {
        self.sessions.remove(agent_id).map(|(_, s)| s)
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentSession>> {
        self.sessions.get(agent_id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<AgentSession>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Returns the agent ids whose last heartbeat is older than
    /// `timeout_secs`, for the caller to tear down.
    pub fn stale_sessions(&self, timeout_secs: i64) -> Vec<Arc<AgentSession>> {
        self.sessions
            .iter()
            .filter(|e| e.value().is_stale(timeout_secs))
            .map(|e| e.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(agent_id: &str) -> Arc<AgentSession> {
        let (tx, _rx) = mpsc::channel(8);
        AgentSession::new(
            agent_id.to_string(),
            "test-agent".to_string(),
            "127.0.0.1:9000".parse().unwrap(),
            tx,
        )
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let registry = AgentRegistry::new();
        registry.insert(session("A1"));
        assert!(registry.get("A1").is_some());
        assert_eq!(registry.list().len(), 1);

        let removed = registry.remove("A1");
        assert!(removed.is_some());
        assert!(registry.get("A1").is_none());
    }

    #[test]
    fn fresh_session_is_not_stale() {
        let s = session("A1");
        assert!(!s.is_stale(90));
    }

    #[test]
    fn touch_heartbeat_keeps_session_fresh() {
        let s = session("A1");
        s.touch_heartbeat();
        assert!(!s.is_stale(0));
    }

    #[tokio::test]
    async fn try_send_fails_once_queue_is_full() {
        let (tx, _rx) = mpsc::channel(1);
        let s = AgentSession::new(
            "A1".to_string(),
            "agent".to_string(),
            "127.0.0.1:9000".parse().unwrap(),
            tx,
        );
        assert!(s.try_send(Frame::new(tunnel_protocol::MessageType::Heartbeat, 0, vec![])).await.is_ok());
        assert!(s.try_send(Frame::new(tunnel_protocol::MessageType::Heartbeat, 0, vec![])).await.is_err());
    }
}
