//! Local listeners for rules this agent sources (`agent→cloud`,
//! `agent→agent`). Cloud pushes these via `RuleAssignment`; for each one
//! this agent binds the listen port itself and, on every accepted
//! connection, asks Cloud to either dial the target directly or relay to
//! a second agent — mirroring the accept/connect/pump shape Cloud itself
//! uses for `cloud→agent` rules, just with the roles swapped.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tunnel_protocol::{AssignedRule, ConnectPayload, Message, Protocol};

use crate::state::AgentState;
use crate::tunnels::AgentTunnel;

const CONNECT_ACK_TIMEOUT: Duration = Duration::from_secs(30);
const PUMP_BUF_LEN: usize = 32 * 1024;

pub async fn start_assigned_rule(state: AgentState, rule: AssignedRule) {
    match rule.protocol {
        Protocol::Tcp => {
            let listener = match TcpListener::bind(("0.0.0.0", rule.listen_port)).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(rule_id = %rule.rule_id, error = %e, "failed to bind assigned rule");
                    return;
                }
            };
            info!(rule_id = %rule.rule_id, port = rule.listen_port, "listening for assigned rule");
            let handle = tokio::spawn(accept_loop(state.clone(), listener, rule));
            state.track_task(handle);
        }
        Protocol::Udp => {
            // UDP agent-sourced rules are not part of the initial rollout;
            // Connect has no meaning without a stream to carry.
            warn!(rule_id = %rule.rule_id, "udp agent-sourced rules are not supported");
        }
    }
}

async fn accept_loop(state: AgentState, listener: TcpListener, rule: AssignedRule) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                info!(rule_id = %rule.rule_id, %peer, "accepted connection for assigned rule");
                let conn_state = state.clone();
                let rule = rule.clone();
                let handle = tokio::spawn(async move {
                    if let Err(e) = handle_accepted(conn_state, socket, rule).await {
                        warn!(error = %e, "assigned-rule connection failed");
                    }
                });
                state.track_task(handle);
            }
            Err(e) => {
                warn!(error = %e, "accept failed on assigned rule listener");
                return;
            }
        }
    }
}

async fn handle_accepted(
    state: AgentState,
    socket: tokio::net::TcpStream,
    rule: AssignedRule,
) -> Result<(), crate::error::AgentError> {
    let tunnel_id = state.tunnels.alloc_local_id();
    let ack_rx = state.pending_acks.register(tunnel_id);

    let connect = Message::Connect(ConnectPayload {
        protocol: Protocol::Tcp,
        target_host: rule.target_host.clone(),
        target_port: rule.target_port,
        rule_id: Some(rule.rule_id.clone()),
    });
    state
        .outbound_tx
        .send(connect.into_frame(tunnel_id))
        .await
        .map_err(|_| crate::error::AgentError::ConnectFailed("control channel closed".into()))?;

    let ack = match tokio::time::timeout(CONNECT_ACK_TIMEOUT, ack_rx).await {
        Ok(Ok(ack)) if ack.success => ack,
        Ok(Ok(ack)) => {
            state.pending_acks.evict(tunnel_id);
            return Err(crate::error::AgentError::AuthRejected(
                ack.error.unwrap_or_else(|| "rejected".to_string()),
            ));
        }
        _ => {
            state.pending_acks.evict(tunnel_id);
            return Err(crate::error::AgentError::ConnectAckTimeout);
        }
    };
    let _ = ack;

    run_pump(state, socket, tunnel_id).await;
    Ok(())
}

async fn run_pump(state: AgentState, socket: tokio::net::TcpStream, tunnel_id: u32) {
    let (mut read_half, mut write_half) = socket.into_split();
    let (to_socket_tx, mut to_socket_rx) = mpsc::channel::<Vec<u8>>(256);

    let tunnel = Arc::new(AgentTunnel {
        id: tunnel_id,
        rule_id: None,
        to_socket_tx,
        closed: tokio::sync::Notify::new(),
    });
    state.tunnels.insert(tunnel.clone());

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = to_socket_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });
    state.track_task(writer_task);

    let mut buf = vec![0u8; PUMP_BUF_LEN];
    loop {
        let n = tokio::select! {
            _ = tunnel.closed.notified() => break,
            read = read_half.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        if state
            .outbound_tx
            .send(Message::Data(buf[..n].to_vec()).into_frame(tunnel_id))
            .await
            .is_err()
        {
            break;
        }
    }

    let _ = state
        .outbound_tx
        .send(Message::Close.into_frame(tunnel_id))
        .await;
    state.tunnels.remove(tunnel_id);
    state.pending_acks.evict(tunnel_id);
}
