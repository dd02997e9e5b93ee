//! # Tunnel Relay Server
//!
//! The Cloud side of a reverse-tunneling port forwarder: a persistent
//! control channel to each agent, multiplexed over a single connection,
//! carrying a length-prefixed binary frame protocol instead of raw bytes.
//!
//! Exposed as a library, in addition to the `tunnel-server` binary, so
//! integration tests under `tests/` can drive a real server instance over
//! loopback sockets instead of re-implementing its wiring.
//!
//! ## Architecture
//!
//! ```text
//! Remote client ──TCP/UDP──► Cloud ──WS (binary frames)──► Agent ──TCP/UDP──► Local service
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] types live in the `tunnel-protocol` crate, shared with the agent.
//! - [`config`]     — environment-derived server settings
//! - [`store`]      — persistence boundary (rules, tokens)
//! - [`rules`]      — rule definitions and their live runtime state
//! - [`ratelimit`]  — per-rule token-bucket limiter
//! - [`stats`]      — process-wide traffic counters
//! - [`registry`]   — connected-agent sessions
//! - [`tunnels`]    — cloud-allocated tunnel table and connect-ack rendezvous
//! - [`relay`]      — agent-initiated rule relay links
//! - [`forwarder`]  — owns rule lifecycles and the four rule-shape behaviors
//! - [`dispatcher`] — demultiplexes inbound frames to the right destination
//! - [`handlers`]   — websocket upgrade, auth handshake, connection lifecycle
//! - [`api`]        — read-only REST endpoints

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod handlers;
pub mod ratelimit;
pub mod registry;
pub mod relay;
pub mod rules;
pub mod state;
pub mod stats;
pub mod store;
pub mod tunnels;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;

use crate::state::ServerState;

/// Builds the axum router shared by the binary and by tests, so a test
/// only needs to bind it to a loopback listener to get a real server.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/api/agents", get(api::list_agents))
        .route("/api/rules", get(api::list_rules))
        .route("/api/stats", get(api::get_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
