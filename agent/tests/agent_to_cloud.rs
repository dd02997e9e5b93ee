//! An agent-sourced rule (agent→cloud): the agent binds the listen port
//! itself once Cloud assigns the rule, and relays accepted connections
//! through the control channel to a target Cloud can reach directly.

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tunnel_server::rules::RuleKind;

use common::*;

#[tokio::test]
async fn agent_sourced_rule_relays_to_cloud_reachable_target() {
    let cloud = spawn_cloud().await;
    let (agent_id, _agent) = spawn_agent(&cloud, "agent-source").await;
    let target_port = spawn_tcp_echo().await;

    let listen_port = free_port();
    let mut rule = base_rule("agent-to-cloud", RuleKind::AgentToCloud, listen_port);
    rule.source_agent_id = Some(agent_id);
    rule.target_port = target_port;
    start_rule(&cloud, rule).await;

    // The agent only binds the port after it receives the assignment,
    // which happens asynchronously over the control channel.
    let mut client = connect_retrying(listen_port).await;
    client.write_all(b"agent sourced").await.unwrap();

    let mut buf = [0u8; 32];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"agent sourced");
}
