//! Scenario D: dropping one agent's session tears down only the tunnels
//! it owned, leaving unrelated agents and their tunnels alone.

mod common;

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tunnel_server::rules::RuleKind;

use common::*;

#[tokio::test]
async fn agent_disconnect_tears_down_its_tunnels_only() {
    let cloud = spawn_cloud().await;
    let (agent_a, agent_a_task) = spawn_agent(&cloud, "agent-a").await;
    let (agent_b, _agent_b_task) = spawn_agent(&cloud, "agent-b").await;
    let echo_a = spawn_tcp_echo().await;
    let echo_b = spawn_tcp_echo().await;

    let port_a = free_port();
    let mut rule_a = base_rule("rule-a", RuleKind::CloudToAgent, port_a);
    rule_a.target_agent_id = Some(agent_a.clone());
    rule_a.target_port = echo_a;
    start_rule(&cloud, rule_a).await;

    let port_b = free_port();
    let mut rule_b = base_rule("rule-b", RuleKind::CloudToAgent, port_b);
    rule_b.target_agent_id = Some(agent_b.clone());
    rule_b.target_port = echo_b;
    start_rule(&cloud, rule_b).await;

    let mut client_a = connect_retrying(port_a).await;
    client_a.write_all(b"hi").await.unwrap();
    let mut client_b = connect_retrying(port_b).await;
    client_b.write_all(b"hi").await.unwrap();

    let open_before = wait_until(|| cloud.app.tunnels.len() == 2, Duration::from_secs(2)).await;
    assert!(open_before, "expected both tunnels to be open before disconnect");

    agent_a_task.abort();
    let evicted = wait_until(
        || cloud.app.registry.get(&agent_a).is_none(),
        Duration::from_secs(2),
    )
    .await;
    assert!(evicted, "agent a's session was not evicted");

    let settled = wait_until(
        || cloud.app.tunnels.ids_for_agent(&agent_a).is_empty(),
        Duration::from_secs(2),
    )
    .await;
    assert!(settled, "agent a's tunnels were not torn down");

    assert!(
        cloud.app.registry.get(&agent_b).is_some(),
        "agent b's session should be unaffected"
    );
    assert_eq!(
        cloud.app.tunnels.ids_for_agent(&agent_b).len(),
        1,
        "agent b's tunnel should be unaffected"
    );
}

async fn connect_retrying(port: u16) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("could not connect to 127.0.0.1:{port}");
}
