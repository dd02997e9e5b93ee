//! Dispatches frames arriving from Cloud to the right tunnel, pending-ack
//! waiter, or local-listener bootstrap.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::warn;
use tunnel_protocol::{ConnectAckPayload, ConnectPayload, Message, MessageType, Protocol};

use crate::local;
use crate::state::AgentState;
use crate::tunnels::AgentTunnel;

const PUMP_BUF_LEN: usize = 32 * 1024;

pub async fn dispatch_message(state: AgentState, tunnel_id: u32, message: Message) {
    match message {
        Message::Heartbeat => {}
        Message::ConnectAck(ack) => {
            if !state.pending_acks.complete(tunnel_id, ack) {
                warn!(tunnel_id, "connect-ack for unknown tunnel");
            }
        }
        Message::Connect(payload) => handle_connect(state, tunnel_id, payload).await,
        Message::Data(bytes) => {
            if let Some(tunnel) = state.tunnels.get(tunnel_id) {
                let _ = tunnel.to_socket_tx.send(bytes).await;
            }
        }
        Message::Close => {
            if let Some(tunnel) = state.tunnels.get(tunnel_id) {
                tunnel.closed.notify_waiters();
            }
        }
        Message::UdpData(payload) => handle_udp_data(state, tunnel_id, payload).await,
        Message::RuleAssignment(payload) => {
            for rule in payload.rules {
                let handle = tokio::spawn(local::start_assigned_rule(state.clone(), rule));
                state.track_task(handle);
            }
        }
        Message::IcmpData(_) => {}
        Message::Auth(_) | Message::AuthAck(_) => {
            warn!(msg_type = ?MessageType::Auth, "unexpected message on established session");
        }
    }
}

/// Cloud is dialing us: a `cloud→agent` rule's listener accepted a
/// connection and wants this agent to reach the configured target.
async fn handle_connect(state: AgentState, tunnel_id: u32, payload: ConnectPayload) {
    if payload.protocol != Protocol::Tcp {
        reject(&state, tunnel_id, "unsupported protocol").await;
        return;
    }
    let target = match TcpStream::connect((payload.target_host.as_str(), payload.target_port)).await {
        Ok(s) => s,
        Err(e) => {
            reject(&state, tunnel_id, &e.to_string()).await;
            return;
        }
    };

    let ack = Message::ConnectAck(ConnectAckPayload {
        success: true,
        error: None,
    });
    if state.outbound_tx.send(ack.into_frame(tunnel_id)).await.is_err() {
        return;
    }

    let (mut read_half, mut write_half) = target.into_split();
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

    let outbound_tx = state.outbound_tx.clone();
    let pump_state = state.clone();
    let pump = tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_BUF_LEN];
        loop {
            let n = tokio::select! {
                _ = tunnel.closed.notified() => break,
                read = read_half.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
            };
            if outbound_tx
                .send(Message::Data(buf[..n].to_vec()).into_frame(tunnel_id))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = outbound_tx.send(Message::Close.into_frame(tunnel_id)).await;
        pump_state.tunnels.remove(tunnel_id);
    });
    state.track_task(pump);
}

async fn reject(state: &AgentState, tunnel_id: u32, reason: &str) {
    let ack = Message::ConnectAck(ConnectAckPayload {
        success: false,
        error: Some(reason.to_string()),
    });
    let _ = state.outbound_tx.send(ack.into_frame(tunnel_id)).await;
}

/// Inbound datagram for a `cloud→agent` UDP rule: `tunnel_id` is the
/// rule's listen port (UDP has no handshake to allocate a real tunnel id
/// from). Dials the target lazily and keeps the socket around per listen
/// port so replies have somewhere to read from.
async fn handle_udp_data(state: AgentState, tunnel_id: u32, payload: tunnel_protocol::UdpDataPayload) {
    let Ok(listen_port) = u16::try_from(tunnel_id) else {
        warn!(tunnel_id, "udp tunnel id is not a valid port");
        return;
    };

    state
        .udp_last_client
        .insert(listen_port, (payload.src_ip.clone(), payload.src_port));

    let socket = match state.udp_sockets.get(&listen_port).map(|e| e.value().clone()) {
        Some(s) => s,
        None => match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => {
                let s = Arc::new(s);
                state.udp_sockets.insert(listen_port, s.clone());
                spawn_udp_reply_reader(state.clone(), s.clone(), listen_port);
                s
            }
            Err(e) => {
                warn!(error = %e, "failed to bind udp relay socket");
                return;
            }
        },
    };

    let dest = format!("{}:{}", payload.dst_ip, payload.dst_port);
    if let Err(e) = socket.send_to(&payload.data, &dest).await {
        warn!(error = %e, "udp send to target failed");
    }
}

fn spawn_udp_reply_reader(state: AgentState, socket: Arc<UdpSocket>, listen_port: u16) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, from) = match tokio::time::timeout(Duration::from_secs(120), socket.recv_from(&mut buf)).await {
                Ok(Ok(v)) => v,
                _ => break,
            };
            let Some(client) = state.udp_last_client.get(&listen_port).map(|e| e.value().clone()) else {
                warn!(listen_port, "udp reply with no known client, dropping");
                continue;
            };
            let reply = tunnel_protocol::UdpDataPayload {
                src_ip: client.0,
                src_port: client.1,
                dst_ip: from.ip().to_string(),
                dst_port: from.port(),
                data: buf[..n].to_vec(),
            };
            let frame = Message::UdpData(reply).into_frame(listen_port as u32);
            if state.outbound_tx.send(frame).await.is_err() {
                break;
            }
        }
        state.udp_sockets.remove(&listen_port);
        state.udp_last_client.remove(&listen_port);
    });
}
