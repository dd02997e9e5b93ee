//! Read-only REST surface for observability and external tooling: which
//! agents are connected, what rules exist, and the process-wide traffic
//! counters. Rule mutation (`create`/`update`/`delete`) is a concern of
//! whatever owns the persistence layer behind [`crate::store::RuleStore`]
//! and isn't exposed here.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::rules::Rule;
use crate::stats::StatsSnapshot;
use crate::state::AppState;

#[derive(Serialize)]
pub struct AgentListItem {
    pub agent_id: String,
    pub name: String,
    pub remote_addr: String,
    pub connected_at: i64,
    pub active_tunnels: u64,
}

/// `GET /api/agents` — every currently connected agent.
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentListItem>> {
    let agents = state
        .registry
        .list()
        .into_iter()
        .map(|session| AgentListItem {
            agent_id: session.agent_id.clone(),
            name: session.name.clone(),
            remote_addr: session.remote_addr.to_string(),
            connected_at: session.connected_at,
            active_tunnels: session
                .active_tunnels
                .load(std::sync::atomic::Ordering::Relaxed),
        })
        .collect();
    Json(agents)
}

/// `GET /api/rules` — every rule known to the persistence layer,
/// regardless of whether it's currently enabled.
pub async fn list_rules(State(state): State<AppState>) -> Json<Vec<Rule>> {
    Json(state.rule_store.list_rules())
}

/// `GET /api/stats` — process-wide traffic counters and rolling speed.
pub async fn get_stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}
