//! Shared application state.
//!
//! Per the design notes, the agent registry and rule table are
//! constructed-on-startup services held here and passed explicitly to the
//! forwarder and dispatcher — not ambient globals.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::forwarder::Forwarder;
use crate::registry::AgentRegistry;
use crate::relay::RelayTable;
use crate::stats::GlobalStats;
use crate::store::{InMemoryRuleStore, InMemoryTokenStore, RuleStore, TokenStore};
use crate::tunnels::{PendingAckTable, TunnelTable};

/// Generates a short, human-readable agent id.
///
/// Format: "XXXX-XXXX" (8 uppercase hex characters split by a hyphen),
/// e.g. "A3F8-B2C1".
pub fn generate_agent_id() -> String {
    let uuid = Uuid::new_v4().to_string();
    let short = &uuid[..8];
    format!(
        "{}-{}",
        short[..4].to_uppercase(),
        short[4..8].to_uppercase()
    )
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<AgentRegistry>,
    pub tunnels: Arc<TunnelTable>,
    pub pending_acks: Arc<PendingAckTable>,
    pub relay: Arc<RelayTable>,
    pub stats: Arc<GlobalStats>,
    pub rule_store: Arc<dyn RuleStore>,
    pub token_store: Arc<dyn TokenStore>,
    /// UDP rule listening sockets, indexed by `(agent_id, listen_port)` so
    /// a reply can be routed back to the correct socket even when an
    /// agent serves more than one UDP rule.
    pub udp_sockets: Arc<DashMap<(String, u16), Arc<UdpSocket>>>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: AgentRegistry::new(),
            tunnels: TunnelTable::new(),
            pending_acks: PendingAckTable::new(),
            relay: RelayTable::new(),
            stats: GlobalStats::new(),
            rule_store: Arc::new(InMemoryRuleStore::default()),
            token_store: Arc::new(InMemoryTokenStore::default()),
            udp_sockets: Arc::new(DashMap::new()),
        }
    }
}

/// Axum router state: the shared core plus the forwarder that owns rule
/// lifecycles. Kept separate from [`AppState`] because the forwarder is
/// itself built from an `AppState`, not part of its construction.
#[derive(Clone, axum::extract::FromRef)]
pub struct ServerState {
    pub app: AppState,
    pub forwarder: Arc<Forwarder>,
}
