//! Per-session agent state: the outbound frame queue and the tables
//! dispatch and the local listeners share. Rebuilt fresh on every
//! reconnect, since `outbound_tx` is tied to one websocket connection.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tunnel_protocol::Frame;

use crate::config::AgentConfig;
use crate::tunnels::{AgentPendingAckTable, AgentTunnelTable};

#[derive(Clone)]
pub struct AgentState {
    pub config: Arc<AgentConfig>,
    pub agent_id: String,
    pub outbound_tx: mpsc::Sender<Frame>,
    pub tunnels: Arc<AgentTunnelTable>,
    pub pending_acks: Arc<AgentPendingAckTable>,
    /// UDP sockets dialed to a target service on behalf of a `cloud→agent`
    /// UDP rule, keyed by the rule's listen port so replies know which
    /// socket to read from and which listen port to stamp on the way back.
    pub udp_sockets: Arc<DashMap<u16, Arc<UdpSocket>>>,
    /// Most recent external client address seen for each listen port, used
    /// to address replies. A single shared dial socket per rule means only
    /// the latest client's replies are routed correctly when more than one
    /// client is in flight concurrently — acceptable for the common
    /// single-client-at-a-time UDP rule, not a full per-flow NAT table.
    pub udp_last_client: Arc<DashMap<u16, (String, u16)>>,
    /// Every task spawned on behalf of this session: rule listeners,
    /// accept-loop connection handlers, and pump writer tasks. Aborted as a
    /// batch when the session ends, since a fresh `AgentState` is built on
    /// every reconnect and nothing else would stop these otherwise.
    task_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AgentState {
    pub fn new(config: Arc<AgentConfig>, agent_id: String, outbound_tx: mpsc::Sender<Frame>) -> Self {
        Self {
            config,
            agent_id,
            outbound_tx,
            tunnels: AgentTunnelTable::new(),
            pending_acks: AgentPendingAckTable::new(),
            udp_sockets: Arc::new(DashMap::new()),
            udp_last_client: Arc::new(DashMap::new()),
            task_handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a spawned task for cleanup when this session ends.
    pub fn track_task(&self, handle: JoinHandle<()>) {
        self.task_handles.lock().unwrap().push(handle);
    }

    /// Aborts every task registered via [`Self::track_task`]. Called once
    /// a session's read loop exits, before the reconnect loop builds a
    /// fresh `AgentState` for the next attempt.
    pub fn abort_all_tasks(&self) {
        for handle in self.task_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}
