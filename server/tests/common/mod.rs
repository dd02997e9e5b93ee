//! Shared harness for the end-to-end scenarios: a real server bound to a
//! loopback port, a real agent connection reusing `tunnel-agent`'s own
//! reconnect loop, and small TCP/UDP echo services to stand in for the
//! "local service" an agent forwards to.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tunnel_protocol::Protocol;
use tunnel_server::config::ServerConfig;
use tunnel_server::forwarder::Forwarder;
use tunnel_server::rules::{Rule, RuleKind};
use tunnel_server::state::{AppState, ServerState};

pub const TEST_TOKEN: &str = "test-token";

pub struct TestCloud {
    pub addr: SocketAddr,
    pub app: AppState,
    pub forwarder: Arc<Forwarder>,
}

/// Binds loopback port 0 to ask the OS for a free one, then releases it.
/// A later bind on the same number could in principle race, but nothing
/// else on the test host contends for it.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Boots a real `tunnel-server` router on an ephemeral loopback port.
pub async fn spawn_cloud() -> TestCloud {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        admin_token: None,
    };
    let app = AppState::new(config);
    let forwarder = Forwarder::new(app.clone());
    app.token_store.create_token(TEST_TOKEN.to_string());

    let state = ServerState {
        app: app.clone(),
        forwarder: forwarder.clone(),
    };
    let router = tunnel_server::router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    TestCloud { addr, app, forwarder }
}

pub fn base_rule(id: &str, kind: RuleKind, listen_port: u16) -> Rule {
    Rule {
        id: id.to_string(),
        name: id.to_string(),
        kind,
        protocol: Protocol::Tcp,
        source_agent_id: None,
        listen_port,
        target_agent_id: None,
        target_host: "127.0.0.1".to_string(),
        target_port: 0,
        enabled: true,
        rate_limit_bps: 0,
        traffic_limit_bytes: 0,
        traffic_used: 0,
    }
}

/// Records `rule` in the persistence layer and starts it, the way an
/// admin API would — `Forwarder::start_rule` alone only builds the live
/// runtime state, it doesn't touch the store.
pub async fn start_rule(cloud: &TestCloud, rule: Rule) {
    cloud.app.rule_store.create_rule(rule.clone());
    cloud.forwarder.start_rule(rule).await.unwrap();
}

/// Connects a real agent (the library's own reconnect loop) to `cloud`
/// and blocks until it shows up in the registry. Returns the agent's
/// assigned id and the task hosting the connection, so the caller can
/// `.abort()` it to simulate a dropped session.
pub async fn spawn_agent(cloud: &TestCloud, name: &str) -> (String, JoinHandle<()>) {
    let config = tunnel_agent::config::AgentConfig {
        server_url: format!("ws://{}/ws", cloud.addr),
        auth_token: TEST_TOKEN.to_string(),
        name: name.to_string(),
    };
    let handle = tokio::spawn(tunnel_agent::connection::run_agent_loop(config));
    let agent_id = wait_for_agent(&cloud.app).await;
    (agent_id, handle)
}

async fn wait_for_agent(app: &AppState) -> String {
    for _ in 0..200 {
        if let Some(session) = app.registry.list().into_iter().next() {
            return session.agent_id.clone();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("agent did not connect in time");
}

/// A TCP service that echoes back everything it reads, standing in for
/// the service an `agent→cloud`/`cloud→agent` rule forwards to.
pub async fn spawn_tcp_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    if socket.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    port
}

/// A UDP service that echoes back every datagram it receives.
pub async fn spawn_udp_echo() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    port
}

/// Polls until `f` returns true or the deadline passes, for conditions a
/// fixed sleep would make either flaky or needlessly slow.
pub async fn wait_until(mut f: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
