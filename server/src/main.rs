//! Binary entrypoint for the tunnel relay server. The actual wiring lives
//! in the library crate so integration tests can reuse it.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::info;
use tunnel_server::config::ServerConfig;
use tunnel_server::forwarder::Forwarder;
use tunnel_server::handlers::STALE_TIMEOUT_SECS;
use tunnel_server::state::{AppState, ServerState};
use tunnel_server::{dispatcher, router};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_server=info".into()),
        )
        .init();

    let config = ServerConfig::from_env();
    let listen_addr = config.listen_addr;
    let app_state = AppState::new(config);
    let forwarder = Forwarder::new(app_state.clone());

    restore_rules(&app_state, &forwarder).await;
    app_state.stats.spawn_sampler();
    spawn_stale_session_sweep(app_state.clone());

    let state = ServerState {
        app: app_state,
        forwarder,
    };

    let app = router(state);

    info!("tunnel server listening on {}", listen_addr);
    let listener = tokio::net::TcpListener::bind(listen_addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}

/// Starts every enabled rule found in the persistence layer on boot, so a
/// server restart doesn't require re-creating rules through the API.
async fn restore_rules(state: &AppState, forwarder: &std::sync::Arc<Forwarder>) {
    let rules = state.rule_store.list_rules();
    info!(count = rules.len(), "restoring rules from persistence");
    for rule in rules {
        let rule_id = rule.id.clone();
        if let Err(e) = forwarder.start_rule(rule).await {
            tracing::warn!(rule_id, error = %e, "failed to restore rule");
        }
    }
}

/// Periodically evicts agent sessions that have gone quiet for longer
/// than the heartbeat grace window, tearing down every tunnel they owned.
fn spawn_stale_session_sweep(state: AppState) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        loop {
            tick.tick().await;
            for session in state.registry.stale_sessions(STALE_TIMEOUT_SECS) {
                tracing::info!(agent_id = %session.agent_id, "evicting stale session");
                state.registry.remove(&session.agent_id);
                for tunnel_id in state.tunnels.ids_for_agent(&session.agent_id) {
                    if let Some(tunnel) = state.tunnels.remove(tunnel_id) {
                        tunnel.closed.notify_waiters();
                    }
                    state.pending_acks.evict(tunnel_id);
                }
                dispatcher::teardown_agent_relay_links(&state, &session.agent_id).await;
            }
        }
    });
}
