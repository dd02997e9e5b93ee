//! Outbound WebSocket connection to Cloud, with auto-reconnect.
//!
//! One call to `run_session` covers the lifetime of a single connection:
//! connect, authenticate, run the writer/heartbeat tasks and the inbound
//! read loop, then clean up. `run_agent_loop` wraps that in a reconnect
//! loop with exponential backoff so a Cloud restart or a network blip
//! doesn't need operator intervention.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, warn};
use tunnel_protocol::{AuthPayload, Frame, Message};

use crate::config::AgentConfig;
use crate::dispatch;
use crate::error::AgentError;
use crate::state::AgentState;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Runs forever: connect, authenticate, relay traffic, reconnect on
/// failure. A clean session (one that got far enough to authenticate)
/// resets the backoff before the next attempt.
pub async fn run_agent_loop(config: AgentConfig) {
    let config = Arc::new(config);
    let mut backoff = INITIAL_BACKOFF;

    loop {
        info!(url = %config.server_url, "connecting to server");
        match run_session(&config).await {
            Ok(()) => {
                info!("session ended cleanly");
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                warn!(error = %e, "session ended with error");
                if matches!(e, AgentError::AuthRejected(_)) {
                    backoff = INITIAL_BACKOFF;
                }
            }
        }

        info!(delay = ?backoff, "reconnecting");
        tokio::time::sleep(backoff).await;
        backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
    }
}

async fn run_session(config: &Arc<AgentConfig>) -> Result<(), AgentError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(&config.server_url)
        .await
        .map_err(|e| AgentError::ConnectFailed(e.to_string()))?;
    info!("connected, authenticating");

    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let auth = Message::Auth(AuthPayload {
        token: config.auth_token.clone(),
        name: config.name.clone(),
    });
    ws_sink
        .send(WsMessage::Binary(auth.into_frame(0).encode().into()))
        .await
        .map_err(|e| AgentError::ConnectFailed(e.to_string()))?;

    let first = tokio::time::timeout(AUTH_TIMEOUT, ws_stream.next())
        .await
        .map_err(|_| AgentError::ConnectAckTimeout)?
        .ok_or_else(|| AgentError::ConnectFailed("connection closed before auth-ack".into()))?
        .map_err(|e| AgentError::ConnectFailed(e.to_string()))?;
    let WsMessage::Binary(bytes) = first else {
        return Err(AgentError::ConnectFailed("first reply was not binary".into()));
    };
    let frame = decode_frame(&bytes).await?;
    let (_, message) = Message::from_frame(frame)?;
    let Message::AuthAck(ack) = message else {
        return Err(AgentError::ConnectFailed("first reply was not auth-ack".into()));
    };
    if !ack.success {
        return Err(AgentError::AuthRejected(
            ack.reason.unwrap_or_else(|| "rejected".to_string()),
        ));
    }
    let agent_id = ack.agent_id.ok_or_else(|| AgentError::ConnectFailed("auth-ack missing agent id".into()))?;
    info!(%agent_id, "authenticated");

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE_CAPACITY);
    let state = AgentState::new(config.clone(), agent_id.clone(), outbound_tx.clone());

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_sink.send(WsMessage::Binary(frame.encode().into())).await.is_err() {
                break;
            }
        }
    });

    let heartbeat_tx = outbound_tx.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tick.tick().await;
            if heartbeat_tx.send(Message::Heartbeat.into_frame(0)).await.is_err() {
                return;
            }
        }
    });

    let result = read_loop(&mut ws_stream, state.clone()).await;

    heartbeat_task.abort();
    writer_task.abort();
    state.abort_all_tasks();
    result
}

async fn read_loop(
    ws_stream: &mut (impl futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin),
    state: AgentState,
) -> Result<(), AgentError> {
    while let Some(next) = ws_stream.next().await {
        match next {
            Ok(WsMessage::Binary(bytes)) => match decode_frame(&bytes).await {
                Ok(frame) => {
                    let (tunnel_id, message) = Message::from_frame(frame)?;
                    tokio::spawn(dispatch::dispatch_message(state.clone(), tunnel_id, message));
                }
                Err(e) => warn!(error = %e, "dropping malformed frame"),
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "websocket read error");
                break;
            }
        }
    }
    Ok(())
}

async fn decode_frame(bytes: &[u8]) -> Result<Frame, tunnel_protocol::ProtocolError> {
    let mut cursor = Cursor::new(bytes);
    match Frame::read_from(&mut cursor).await? {
        Some(frame) => Ok(frame),
        None => Err(tunnel_protocol::ProtocolError::Truncated),
    }
}
