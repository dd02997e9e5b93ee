//! Headless relay client: keeps an outbound control channel to Cloud and
//! executes the forwarding Cloud assigns it.
//!
//! Exposed as a library, in addition to the `tunnel-agent` binary, so
//! integration tests under `tests/` can drive a real agent connection
//! over loopback sockets.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod local;
pub mod state;
pub mod tunnels;
