//! Control-channel dispatcher: demultiplexes frames arriving
//! from one agent session to whichever tunnel, relay link, or pending-ack
//! waiter they belong to.
//!
//! One dispatcher loop runs per session (spawned by the websocket handler
//! once `Auth` succeeds) and reads until the socket closes or a frame
//! fails to decode.

use std::sync::Arc;

use tracing::{instrument, warn};
use tunnel_protocol::{Frame, Message, MessageType};

use crate::forwarder::Forwarder;
use crate::relay::PeerLeg;
use crate::state::AppState;

/// Routes a single inbound frame from `agent_id`'s session. Called by the
/// websocket read loop for every frame after `Auth`.
#[instrument(skip(state, forwarder, frame), fields(agent_id = %agent_id, msg_type = ?frame.msg_type))]
pub async fn dispatch_frame(state: &AppState, forwarder: &Arc<Forwarder>, agent_id: &str, frame: Frame) {
    let tunnel_id = frame.tunnel_id;
    let msg_type = frame.msg_type;
    let message = match Message::from_frame(frame) {
        Ok((_, message)) => message,
        Err(e) => {
            warn!(error = %e, "dropping undecodable frame");
            return;
        }
    };

    match message {
        Message::Heartbeat => {
            if let Some(session) = state.registry.get(agent_id) {
                session.touch_heartbeat();
            }
        }
        Message::ConnectAck(ack) => {
            if !state.pending_acks.complete(tunnel_id, ack) {
                warn!(tunnel_id, "connect-ack for unknown or already-timed-out tunnel");
            }
        }
        Message::Connect(payload) => {
            forwarder
                .handle_agent_initiated_connect(agent_id.to_string(), tunnel_id, payload)
                .await;
        }
        Message::Data(bytes) => route_data(state, agent_id, tunnel_id, bytes).await,
        Message::Close => route_close(state, agent_id, tunnel_id).await,
        Message::UdpData(payload) => route_udp_reply(state, agent_id, tunnel_id, payload).await,
        Message::IcmpData(_) => {
            // ICMP relaying is not implemented; frames are
            // accepted so an older/newer peer never breaks framing sync,
            // then discarded.
        }
        Message::Auth(_) | Message::AuthAck(_) | Message::RuleAssignment(_) => {
            warn!(?msg_type, "unexpected message type on established session");
        }
    }
}

/// A relay link takes precedence over [`crate::tunnels::TunnelTable`]: the
/// two tables are addressed in disjoint id spaces (cloud-allocated vs.
/// agent-local), but an agent-local id could coincidentally collide with
/// a cloud-allocated one, so relay lookups — scoped to `(agent_id,
/// tunnel_id)` — are always tried first.
async fn route_data(state: &AppState, agent_id: &str, tunnel_id: u32, bytes: Vec<u8>) {
    if let Some(link) = state.relay.get(agent_id, tunnel_id) {
        match &link.peer {
            PeerLeg::CloudSocket(tx) => {
                state.stats.add_rx(bytes.len() as u64);
                let _ = tx.send(bytes).await;
            }
            PeerLeg::Agent {
                agent_id: peer_agent_id,
                tunnel_id: peer_tunnel_id,
            } => {
                if let Some(peer_session) = state.registry.get(peer_agent_id) {
                    let frame = Message::Data(bytes).into_frame(*peer_tunnel_id);
                    let _ = peer_session.try_send(frame).await;
                }
            }
        }
        return;
    }

    if let Some(tunnel) = state.tunnels.get(tunnel_id) {
        state.stats.add_rx(bytes.len() as u64);
        let _ = tunnel.to_socket_tx.send(bytes).await;
    }
}

async fn route_close(state: &AppState, agent_id: &str, tunnel_id: u32) {
    if let Some(link) = state.relay.remove(agent_id, tunnel_id) {
        notify_relay_peer(state, &link).await;
        return;
    }

    if let Some(tunnel) = state.tunnels.get(tunnel_id) {
        tunnel.closed.notify_waiters();
    }
}

async fn notify_relay_peer(state: &AppState, link: &crate::relay::RelayLink) {
    if let PeerLeg::Agent {
        agent_id: peer_agent_id,
        tunnel_id: peer_tunnel_id,
    } = &link.peer
    {
        state.relay.remove(peer_agent_id, *peer_tunnel_id);
        if let Some(peer_session) = state.registry.get(peer_agent_id) {
            let _ = peer_session
                .try_send(Message::Close.into_frame(*peer_tunnel_id))
                .await;
        }
    }
}

/// Releases every relay link an `agent→cloud`/`agent→agent` rule has open
/// through `agent_id` — whichever leg it plays, source or target — and
/// notifies the peer leg with `Close` so it doesn't keep writing into a
/// dead session. Called on session teardown (explicit disconnect or the
/// stale-session sweep); without this, killing one side of an
/// agent-initiated rule would otherwise leak the other side's
/// `RelayTable` entry forever.
pub async fn teardown_agent_relay_links(state: &AppState, agent_id: &str) {
    for tunnel_id in state.relay.ids_for_agent(agent_id) {
        if let Some(link) = state.relay.remove(agent_id, tunnel_id) {
            notify_relay_peer(state, &link).await;
        }
    }
}

/// Routes a UDP reply datagram back to the listening socket it belongs
/// to. The frame's `tunnel_id` carries the rule's `listen_port`,
/// since UDP has no per-flow handshake to allocate a real tunnel id from.
async fn route_udp_reply(
    state: &AppState,
    agent_id: &str,
    tunnel_id: u32,
    payload: tunnel_protocol::UdpDataPayload,
) {
    let Ok(listen_port) = u16::try_from(tunnel_id) else {
        warn!(tunnel_id, "udp reply tunnel id is not a valid port");
        return;
    };
    let Some(socket) = state
        .udp_sockets
        .get(&(agent_id.to_string(), listen_port))
        .map(|e| e.value().clone())
    else {
        warn!(agent_id, listen_port, "no udp socket registered for reply");
        return;
    };
    let dest = format!("{}:{}", payload.src_ip, payload.src_port);
    state.stats.add_rx(payload.data.len() as u64);
    if let Err(e) = socket.send_to(&payload.data, &dest).await {
        warn!(error = %e, "udp reply send failed");
    }
}
