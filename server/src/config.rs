//! Server configuration.
//!
//! Rules and tokens are owned by an external persistence layer,
//! which is out of scope for this crate; only the handful of settings the
//! core itself needs are read here, from the environment. A full
//! config-file/CLI story is intentionally out of scope for now.

use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub admin_token: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let listen_addr = std::env::var("TUNNEL_LISTEN_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 7070)));
        let admin_token = std::env::var("TUNNEL_ADMIN_TOKEN").ok();
        Self {
            listen_addr,
            admin_token,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            admin_token: None,
        }
    }
}
