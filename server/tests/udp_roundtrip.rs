//! Scenario E: UDP datagrams relayed through an agent round-trip without
//! loss or reordering on loopback.

mod common;

use std::time::Duration;

use tokio::net::UdpSocket;
use tunnel_protocol::Protocol;
use tunnel_server::rules::RuleKind;

use common::*;

#[tokio::test]
async fn udp_round_trip_has_zero_loss_on_loopback() {
    let cloud = spawn_cloud().await;
    let (agent_id, _agent) = spawn_agent(&cloud, "agent-udp").await;
    let echo_port = spawn_udp_echo().await;

    let listen_port = free_port();
    let mut rule = base_rule("udp-rule", RuleKind::CloudToAgent, listen_port);
    rule.protocol = Protocol::Udp;
    rule.target_agent_id = Some(agent_id);
    rule.target_port = echo_port;
    start_rule(&cloud, rule).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(("127.0.0.1", listen_port)).await.unwrap();

    let mut buf = [0u8; 16];
    for i in 0..100u32 {
        client.send(b"ping").await.unwrap();
        let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap_or_else(|_| panic!("datagram {i} was dropped"))
            .unwrap();
        assert_eq!(&buf[..n], b"ping", "datagram {i} was corrupted");
    }
}
