//! Process-level error kinds. Per the error-handling design, nothing here
//! propagates far enough to panic the process: a `ServerError` returned
//! from a rule task or session task is logged and the task exits, leaving
//! the rest of the server running.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("rule {0} not found")]
    UnknownRule(String),

    #[error("target agent {0} not connected")]
    AgentNotConnected(String),

    #[error("connect-ack timed out")]
    ConnectAckTimeout,

    #[error("connect rejected by agent: {0}")]
    ConnectRejected(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] tunnel_protocol::ProtocolError),

    #[error("channel closed")]
    ChannelClosed,
}
