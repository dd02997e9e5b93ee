//! Errors that end an agent session. A session error is not fatal to the
//! process: `connection::run_agent_loop` logs it and reconnects.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("connect-ack timed out")]
    ConnectAckTimeout,

    #[error("protocol error: {0}")]
    Protocol(#[from] tunnel_protocol::ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
