//! WebSocket connection lifecycle: the control channel binding for the
//! binary frame protocol.
//!
//! Each connection carries exactly one [`tunnel_protocol::Frame`] per
//! websocket binary message — there's no byte-stream reassembly to do,
//! axum already delivers whole messages. The first frame must be `Auth`;
//! everything after goes to the dispatcher.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tunnel_protocol::{AuthAckPayload, Frame, Message};

use crate::dispatcher;
use crate::registry::{AgentSession, OUTBOUND_QUEUE_CAPACITY};
use crate::state::{generate_agent_id, ServerState};

/// How often Cloud nudges an idle session to prove it's still reachable.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Consecutive missed heartbeats beyond this window mark a session stale;
/// swept up by the background task spawned in `main`.
pub const STALE_TIMEOUT_SECS: i64 = 90;
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, remote_addr))
}

async fn handle_connection(socket: WebSocket, state: ServerState, remote_addr: SocketAddr) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let first = match tokio::time::timeout(AUTH_TIMEOUT, ws_stream.next()).await {
        Ok(Some(Ok(WsMessage::Binary(bytes)))) => bytes,
        _ => {
            warn!(%remote_addr, "connection closed before auth");
            return;
        }
    };
    let auth_frame = match decode_frame(&first).await {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%remote_addr, error = %e, "malformed auth frame");
            return;
        }
    };
    let (_, auth_message) = match Message::from_frame(auth_frame) {
        Ok(v) => v,
        Err(e) => {
            warn!(%remote_addr, error = %e, "undecodable auth frame");
            return;
        }
    };
    let Message::Auth(auth) = auth_message else {
        warn!(%remote_addr, "first frame was not Auth");
        return;
    };

    let Some(_token_id) = state.app.token_store.validate(&auth.token) else {
        let nack = Message::AuthAck(AuthAckPayload {
            success: false,
            agent_id: None,
            reason: Some("invalid token".to_string()),
        });
        let _ = ws_sink.send(WsMessage::Binary(nack.into_frame(0).encode().into())).await;
        return;
    };

    let agent_id = generate_agent_id();
    info!(%agent_id, name = %auth.name, %remote_addr, "agent authenticated");

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE_CAPACITY);
    let session = AgentSession::new(agent_id.clone(), auth.name, remote_addr, outbound_tx);
    state.app.registry.insert(session.clone());

    let ack = Message::AuthAck(AuthAckPayload {
        success: true,
        agent_id: Some(agent_id.clone()),
        reason: None,
    });
    if ws_sink
        .send(WsMessage::Binary(ack.into_frame(0).encode().into()))
        .await
        .is_err()
    {
        state.app.registry.remove(&agent_id);
        return;
    }

    state.forwarder.resync_agent_rules(&agent_id);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_sink
                .send(WsMessage::Binary(frame.encode().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let heartbeat_session = session.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tick.tick().await;
            if heartbeat_session
                .send(Message::Heartbeat.into_frame(0))
                .await
                .is_err()
            {
                return;
            }
        }
    });

    while let Some(next) = ws_stream.next().await {
        match next {
            Ok(WsMessage::Binary(bytes)) => match decode_frame(&bytes).await {
                Ok(frame) => dispatcher::dispatch_frame(&state.app, &state.forwarder, &agent_id, frame).await,
                Err(e) => warn!(%agent_id, error = %e, "dropping malformed frame"),
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(%agent_id, error = %e, "websocket read error");
                break;
            }
        }
    }

    info!(%agent_id, "agent disconnected");
    heartbeat_task.abort();
    writer_task.abort();
    teardown_session(&state, &agent_id).await;
}

async fn decode_frame(bytes: &[u8]) -> Result<Frame, tunnel_protocol::ProtocolError> {
    // `read_from` is written against a stream since that's also how the
    // agent side reads off a TCP socket; a single websocket message is
    // just a one-frame stream, so this never actually awaits.
    let mut cursor = Cursor::new(bytes);
    match Frame::read_from(&mut cursor).await? {
        Some(frame) => Ok(frame),
        None => Err(tunnel_protocol::ProtocolError::Truncated),
    }
}

async fn teardown_session(state: &ServerState, agent_id: &str) {
    state.app.registry.remove(agent_id);
    for tunnel_id in state.app.tunnels.ids_for_agent(agent_id) {
        if let Some(tunnel) = state.app.tunnels.remove(tunnel_id) {
            tunnel.closed.notify_waiters();
        }
        state.app.pending_acks.evict(tunnel_id);
    }
    dispatcher::teardown_agent_relay_links(&state.app, agent_id).await;
}
