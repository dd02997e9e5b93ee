//! Cloud forwarder: owns the lifecycle of each [`RuleState`]
//! and the four rule-shape behaviors.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use tunnel_protocol::{ConnectAckPayload, ConnectPayload, Message, Protocol, UdpDataPayload};

use crate::error::ServerError;
use crate::relay::{PeerLeg, RelayLink};
use crate::rules::{Rule, RuleKind, RuleState};
use crate::state::AppState;
use crate::tunnels::Tunnel;

/// Bytes read per `recv`/pump iteration.
const PUMP_BUF_LEN: usize = 32 * 1024;
const CONNECT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Forwarder {
    state: AppState,
    rule_states: DashMap<String, Arc<RuleState>>,
}

impl Forwarder {
    pub fn new(state: AppState) -> Arc<Self> {
        Arc::new(Self {
            state,
            rule_states: DashMap::new(),
        })
    }

    pub fn rule_state(&self, rule_id: &str) -> Option<Arc<RuleState>> {
        self.rule_states.get(rule_id).map(|e| e.value().clone())
    }

    /// Starts a rule. `enabled: false` rules are accepted but produce no
    /// listener — only live [`RuleState`]s do.
    #[instrument(skip(self, rule), fields(rule_id = %rule.id))]
    pub async fn start_rule(self: &Arc<Self>, rule: Rule) -> Result<(), ServerError> {
        if !rule.enabled {
            return Ok(());
        }
        let rule_state = RuleState::new(rule.clone());
        self.rule_states.insert(rule.id.clone(), rule_state.clone());

        match rule.kind {
            RuleKind::CloudToAgent => self.start_cloud_to_agent(rule_state).await?,
            RuleKind::CloudToDirect => self.start_cloud_to_direct(rule_state).await?,
            RuleKind::AgentToCloud | RuleKind::AgentToAgent => {
                self.assign_to_source_agent(&rule_state.rule);
            }
        }
        Ok(())
    }

    /// Stops a rule: signals its listener/accept tasks to exit and flushes
    /// the final traffic count to the store.
    pub fn stop_rule(&self, rule_id: &str) {
        if let Some((_, rs)) = self.rule_states.remove(rule_id) {
            rs.stop();
            self.state
                .rule_store
                .update_traffic_used(rule_id, rs.traffic_used.load(Ordering::Relaxed));
            if let (RuleKind::CloudToAgent, Protocol::Udp, Some(agent_id)) =
                (rs.rule.kind, rs.rule.protocol, &rs.rule.target_agent_id)
            {
                self.state
                    .udp_sockets
                    .remove(&(agent_id.clone(), rs.rule.listen_port));
            }
        }
    }

    // ── cloud→agent ──────────────────────────────────────────────

    async fn start_cloud_to_agent(self: &Arc<Self>, rs: Arc<RuleState>) -> Result<(), ServerError> {
        match rs.rule.protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind(("0.0.0.0", rs.rule.listen_port))
                    .await
                    .map_err(ServerError::Bind)?;
                let this = self.clone();
                tokio::spawn(async move { this.tcp_accept_loop(listener, rs).await });
            }
            Protocol::Udp => {
                let socket = Arc::new(
                    UdpSocket::bind(("0.0.0.0", rs.rule.listen_port))
                        .await
                        .map_err(ServerError::Bind)?,
                );
                if let Some(agent_id) = &rs.rule.target_agent_id {
                    self.state
                        .udp_sockets
                        .insert((agent_id.clone(), rs.rule.listen_port), socket.clone());
                }
                let this = self.clone();
                tokio::spawn(async move { this.udp_loop(socket, rs).await });
            }
        }
        Ok(())
    }

    async fn tcp_accept_loop(self: Arc<Self>, listener: TcpListener, rs: Arc<RuleState>) {
        loop {
            tokio::select! {
                _ = rs.shutdown.notified() => {
                    info!(rule_id = %rs.rule.id, "rule stopped, closing listener");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, _)) => {
                            let this = self.clone();
                            let rs = rs.clone();
                            tokio::spawn(async move { this.handle_tcp_client(socket, rs).await });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
    }

    /// The TCP connect handshake and pump loop ("Cloud-side
    /// accept for cloud→agent").
    #[instrument(skip(self, socket, rs), fields(rule_id = %rs.rule.id))]
    async fn handle_tcp_client(self: Arc<Self>, socket: TcpStream, rs: Arc<RuleState>) {
        if !rs.is_active() || rs.traffic_limit_exceeded() {
            return;
        }
        let Some(target_agent_id) = rs.rule.target_agent_id.clone() else {
            return;
        };
        let Some(session) = self.state.registry.get(&target_agent_id) else {
            return;
        };

        let tunnel_id = self.state.tunnels.alloc_id();
        let ack_rx = self.state.pending_acks.register(tunnel_id);

        let connect = Message::Connect(ConnectPayload {
            protocol: Protocol::Tcp,
            target_host: rs.rule.target_host.clone(),
            target_port: rs.rule.target_port,
            rule_id: None,
        });
        if session.send(connect.into_frame(tunnel_id)).await.is_err() {
            self.state.pending_acks.evict(tunnel_id);
            return;
        }

        let ack = match tokio::time::timeout(CONNECT_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(ack)) if ack.success => ack,
            Ok(Ok(ack)) => {
                warn!(error = ?ack.error, tunnel_id, "agent rejected connect");
                return;
            }
            _ => {
                self.state.pending_acks.evict(tunnel_id);
                warn!(tunnel_id, "connect-ack timed out");
                return;
            }
        };
        let _ = ack;

        self.run_tcp_pump(socket, session, tunnel_id, rs).await;
    }

    /// Registers the tunnel and pumps bytes in both directions until
    /// either side closes. Shared by the `cloud→agent` accept path and
    /// the `agent→cloud` dial path (where Cloud plays the "agent" role).
    async fn run_tcp_pump(
        self: &Arc<Self>,
        socket: TcpStream,
        session: Arc<crate::registry::AgentSession>,
        tunnel_id: u32,
        rs: Arc<RuleState>,
    ) {
        let (mut read_half, mut write_half) = socket.into_split();
        let (to_socket_tx, mut to_socket_rx) = mpsc::channel::<Vec<u8>>(256);

        let tunnel = Arc::new(Tunnel {
            id: tunnel_id,
            protocol: Protocol::Tcp,
            owning_agent_id: session.agent_id.clone(),
            rule_id: rs.rule.id.clone(),
            created_at: Instant::now(),
            to_socket_tx,
            closed: tokio::sync::Notify::new(),
        });
        self.state.tunnels.insert(tunnel.clone());
        session.tunnel_ids.insert(tunnel_id);
        session.active_tunnels.fetch_add(1, Ordering::Relaxed);

        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = to_socket_rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let mut buf = vec![0u8; PUMP_BUF_LEN];
        loop {
            if !rs.is_active() {
                break;
            }
            let n = tokio::select! {
                _ = tunnel.closed.notified() => break,
                read = read_half.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
            };
            let used = rs.add_traffic(n as u64);
            self.state.stats.add_tx(n as u64);
            rs.rate_limiter.wait(n as u64).await;
            if session
                .send(Message::Data(buf[..n].to_vec()).into_frame(tunnel_id))
                .await
                .is_err()
            {
                break;
            }
            if rs.rule.traffic_limit_bytes > 0 && used >= rs.rule.traffic_limit_bytes {
                info!(tunnel_id, "traffic limit exceeded, tearing down tunnel");
                break;
            }
        }

        let _ = session.send(Message::Close.into_frame(tunnel_id)).await;
        writer_task.abort();
        self.teardown_tcp_tunnel(tunnel_id, &session.agent_id, &rs.rule.id);
    }

    fn teardown_tcp_tunnel(&self, tunnel_id: u32, agent_id: &str, rule_id: &str) {
        self.state.tunnels.remove(tunnel_id);
        self.state.pending_acks.evict(tunnel_id);
        if let Some(session) = self.state.registry.get(agent_id) {
            session.tunnel_ids.remove(&tunnel_id);
            session.active_tunnels.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(rs) = self.rule_state(rule_id) {
            self.state
                .rule_store
                .update_traffic_used(rule_id, rs.traffic_used.load(Ordering::Relaxed));
        }
    }

    // ── UDP (cloud→agent) ────────────────────────────────────────

    /// No per-flow handshake: each inbound datagram is wrapped with its
    /// source/dest addressing and relayed to the target agent. The
    /// tunnel-id field doubles as the rule's listen port so that replies
    /// — arriving as `UDPData` frames from the agent — can be routed back
    /// to this exact socket via `(agent_id, listen_port)`.
    async fn udp_loop(self: Arc<Self>, socket: Arc<UdpSocket>, rs: Arc<RuleState>) {
        let Some(target_agent_id) = rs.rule.target_agent_id.clone() else {
            return;
        };
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                _ = rs.shutdown.notified() => return,
                recvd = socket.recv_from(&mut buf) => {
                    let (n, src) = match recvd {
                        Ok(v) => v,
                        Err(e) => { warn!(error = %e, "udp recv failed"); continue; }
                    };
                    if !rs.is_active() || rs.traffic_limit_exceeded() {
                        continue;
                    }
                    let Some(session) = self.state.registry.get(&target_agent_id) else { continue };

                    let used = rs.add_traffic(n as u64);
                    self.state.stats.add_tx(n as u64);
                    rs.rate_limiter.wait(n as u64).await;
                    if rs.rule.traffic_limit_bytes > 0 && used >= rs.rule.traffic_limit_bytes {
                        info!(rule_id = %rs.rule.id, "traffic limit exceeded, dropping further udp datagrams");
                    }

                    let payload = UdpDataPayload {
                        src_ip: src.ip().to_string(),
                        src_port: src.port(),
                        dst_ip: rs.rule.target_host.clone(),
                        dst_port: rs.rule.target_port,
                        data: buf[..n].to_vec(),
                    };
                    let frame = Message::UdpData(payload).into_frame(rs.rule.listen_port as u32);
                    let _ = session.try_send(frame).await;
                }
            }
        }
    }

    // ── cloud→direct ─────────────────────────────────────────────

    async fn start_cloud_to_direct(self: &Arc<Self>, rs: Arc<RuleState>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", rs.rule.listen_port))
            .await
            .map_err(ServerError::Bind)?;
        let this = self.clone();
        tokio::spawn(async move { this.direct_accept_loop(listener, rs).await });
        Ok(())
    }

    async fn direct_accept_loop(self: Arc<Self>, listener: TcpListener, rs: Arc<RuleState>) {
        loop {
            tokio::select! {
                _ = rs.shutdown.notified() => return,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, _)) => {
                            let this = self.clone();
                            let rs = rs.clone();
                            tokio::spawn(async move { this.handle_direct_client(socket, rs).await });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
    }

    /// Two tasks copy bytes in each direction between the accepted
    /// socket and the target, both passing through the same traffic
    /// accounting and rate limiting as the agent path.
    async fn handle_direct_client(self: Arc<Self>, client: TcpStream, rs: Arc<RuleState>) {
        if !rs.is_active() || rs.traffic_limit_exceeded() {
            return;
        }
        let target = match TcpStream::connect((rs.rule.target_host.as_str(), rs.rule.target_port)).await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "cloud-direct dial failed");
                return;
            }
        };

        let (mut client_r, mut client_w) = client.into_split();
        let (mut target_r, mut target_w) = target.into_split();

        let rs_a = rs.clone();
        let stats_a = self.state.stats.clone();
        let client_to_target = tokio::spawn(async move {
            let mut buf = vec![0u8; PUMP_BUF_LEN];
            loop {
                if !rs_a.is_active() || rs_a.traffic_limit_exceeded() {
                    return;
                }
                let n = match client_r.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                rs_a.add_traffic(n as u64);
                stats_a.add_tx(n as u64);
                rs_a.rate_limiter.wait(n as u64).await;
                if target_w.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        });

        let rs_b = rs.clone();
        let stats_b = self.state.stats.clone();
        let target_to_client = tokio::spawn(async move {
            let mut buf = vec![0u8; PUMP_BUF_LEN];
            loop {
                if !rs_b.is_active() {
                    return;
                }
                let n = match target_r.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                stats_b.add_rx(n as u64);
                if client_w.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        });

        tokio::select! {
            _ = client_to_target => {}
            _ = target_to_client => {}
        }
        self.state
            .rule_store
            .update_traffic_used(&rs.rule.id, rs.traffic_used.load(Ordering::Relaxed));
    }

    // ── agent→cloud / agent→agent ────────────────────────────────

    /// Pushes the rule to its source agent so it can start a local
    /// listener. Also called on agent (re)connect to re-sync.
    fn assign_to_source_agent(&self, rule: &Rule) {
        let Some(agent_id) = &rule.source_agent_id else {
            return;
        };
        let Some(session) = self.state.registry.get(agent_id) else {
            return;
        };
        let assigned = tunnel_protocol::AssignedRule {
            rule_id: rule.id.clone(),
            kind: match rule.kind {
                RuleKind::AgentToCloud => tunnel_protocol::AssignedRuleKind::AgentToCloud,
                RuleKind::AgentToAgent => tunnel_protocol::AssignedRuleKind::AgentToAgent,
                _ => return,
            },
            protocol: rule.protocol,
            listen_port: rule.listen_port,
            target_host: rule.target_host.clone(),
            target_port: rule.target_port,
        };
        let frame = Message::RuleAssignment(tunnel_protocol::RuleAssignmentPayload {
            rules: vec![assigned],
        })
        .into_frame(0);
        let session = session.clone();
        tokio::spawn(async move {
            let _ = session.send(frame).await;
        });
    }

    /// Re-sends every rule sourced by `agent_id` on (re)connect, per
    /// ("restore from persistence on boot").
    pub fn resync_agent_rules(&self, agent_id: &str) {
        for rule in self.state.rule_store.list_rules() {
            if rule.enabled && rule.source_agent_id.as_deref() == Some(agent_id) {
                self.assign_to_source_agent(&rule);
            }
        }
    }

    /// Handles a `Connect` frame arriving *from* an agent (the agent is
    /// the rule's source): either Cloud dials the target itself
    /// (`agent→cloud`) or relays the connect onward to a second agent
    /// (`agent→agent`).
    #[instrument(skip(self, payload), fields(source_agent_id = %source_agent_id, tunnel_id))]
    pub async fn handle_agent_initiated_connect(
        self: &Arc<Self>,
        source_agent_id: String,
        tunnel_id: u32,
        payload: ConnectPayload,
    ) {
        let Some(rule_id) = payload.rule_id.clone() else {
            return;
        };
        let Some(rule) = self.state.rule_store.get_rule(&rule_id) else {
            self.reject_agent_connect(&source_agent_id, tunnel_id, "unknown rule").await;
            return;
        };
        let Some(rs) = self.rule_state(&rule_id) else {
            self.reject_agent_connect(&source_agent_id, tunnel_id, "rule not active").await;
            return;
        };
        if !rs.is_active() || rs.traffic_limit_exceeded() {
            self.reject_agent_connect(&source_agent_id, tunnel_id, "rule inactive or capped").await;
            return;
        }

        match rule.kind {
            RuleKind::AgentToCloud => {
                self.handle_agent_to_cloud_connect(source_agent_id, tunnel_id, payload, rs)
                    .await;
            }
            RuleKind::AgentToAgent => {
                self.handle_agent_to_agent_connect(source_agent_id, tunnel_id, payload, rule, rs)
                    .await;
            }
            _ => {
                self.reject_agent_connect(&source_agent_id, tunnel_id, "not an agent-sourced rule")
                    .await;
            }
        }
    }

    async fn reject_agent_connect(&self, agent_id: &str, tunnel_id: u32, reason: &str) {
        if let Some(session) = self.state.registry.get(agent_id) {
            let ack = Message::ConnectAck(ConnectAckPayload {
                success: false,
                error: Some(reason.to_string()),
            });
            let _ = session.send(ack.into_frame(tunnel_id)).await;
        }
    }

    async fn handle_agent_to_cloud_connect(
        self: &Arc<Self>,
        source_agent_id: String,
        tunnel_id: u32,
        payload: ConnectPayload,
        rs: Arc<RuleState>,
    ) {
        let Some(session) = self.state.registry.get(&source_agent_id) else {
            return;
        };
        let target = match TcpStream::connect((payload.target_host.as_str(), payload.target_port)).await {
            Ok(t) => t,
            Err(e) => {
                self.reject_agent_connect(&source_agent_id, tunnel_id, &e.to_string())
                    .await;
                return;
            }
        };
        let ack = Message::ConnectAck(ConnectAckPayload {
            success: true,
            error: None,
        });
        if session.send(ack.into_frame(tunnel_id)).await.is_err() {
            return;
        }

        let (mut target_r, mut target_w) = target.into_split();
        let (to_socket_tx, mut to_socket_rx) = mpsc::channel::<Vec<u8>>(256);

        self.state.relay.insert(
            source_agent_id.clone(),
            tunnel_id,
            Arc::new(RelayLink {
                peer: PeerLeg::CloudSocket(to_socket_tx),
                rule_id: rs.rule.id.clone(),
            }),
        );

        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = to_socket_rx.recv().await {
                if target_w.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let state = self.state.clone();
        let rule_id = rs.rule.id.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; PUMP_BUF_LEN];
            loop {
                let n = match target_r.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                state.stats.add_rx(n as u64);
                if let Some(session) = state.registry.get(&source_agent_id) {
                    let frame = Message::Data(buf[..n].to_vec()).into_frame(tunnel_id);
                    if session.send(frame).await.is_err() {
                        break;
                    }
                } else {
                    break;
                }
            }
            if let Some(session) = state.registry.get(&source_agent_id) {
                let _ = session.send(Message::Close.into_frame(tunnel_id)).await;
            }
            writer_task.abort();
            state.relay.remove(&source_agent_id, tunnel_id);
            let _ = rule_id;
        });
    }

    async fn handle_agent_to_agent_connect(
        self: &Arc<Self>,
        source_agent_id: String,
        source_tunnel_id: u32,
        payload: ConnectPayload,
        rule: Rule,
        rs: Arc<RuleState>,
    ) {
        let Some(target_agent_id) = rule.target_agent_id.clone() else {
            self.reject_agent_connect(&source_agent_id, source_tunnel_id, "rule has no target agent")
                .await;
            return;
        };
        let Some(target_session) = self.state.registry.get(&target_agent_id) else {
            self.reject_agent_connect(&source_agent_id, source_tunnel_id, "target agent not connected")
                .await;
            return;
        };

        let relay_tunnel_id = self.state.tunnels.alloc_id();
        let ack_rx = self.state.pending_acks.register(relay_tunnel_id);
        let connect = Message::Connect(ConnectPayload {
            protocol: payload.protocol,
            target_host: payload.target_host.clone(),
            target_port: payload.target_port,
            rule_id: None,
        });
        if target_session.send(connect.into_frame(relay_tunnel_id)).await.is_err() {
            self.state.pending_acks.evict(relay_tunnel_id);
            self.reject_agent_connect(&source_agent_id, source_tunnel_id, "target agent send failed")
                .await;
            return;
        }

        let ack = match tokio::time::timeout(CONNECT_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(ack)) if ack.success => ack,
            _ => {
                self.state.pending_acks.evict(relay_tunnel_id);
                self.reject_agent_connect(&source_agent_id, source_tunnel_id, "target agent rejected")
                    .await;
                return;
            }
        };
        let _ = ack;

        self.state.relay.insert(
            source_agent_id.clone(),
            source_tunnel_id,
            Arc::new(RelayLink {
                peer: PeerLeg::Agent {
                    agent_id: target_agent_id.clone(),
                    tunnel_id: relay_tunnel_id,
                },
                rule_id: rs.rule.id.clone(),
            }),
        );
        self.state.relay.insert(
            target_agent_id,
            relay_tunnel_id,
            Arc::new(RelayLink {
                peer: PeerLeg::Agent {
                    agent_id: source_agent_id.clone(),
                    tunnel_id: source_tunnel_id,
                },
                rule_id: rs.rule.id.clone(),
            }),
        );

        if let Some(source_session) = self.state.registry.get(&source_agent_id) {
            let ack = Message::ConnectAck(ConnectAckPayload {
                success: true,
                error: None,
            });
            let _ = source_session.send(ack.into_frame(source_tunnel_id)).await;
        }
    }
}
