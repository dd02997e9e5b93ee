//! Scenario A (remote TCP echo) and scenario B (rate limit).

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tunnel_server::rules::RuleKind;

use common::*;

#[tokio::test]
async fn remote_tcp_echo_leaves_no_leaked_tunnel() {
    let cloud = spawn_cloud().await;
    let (agent_id, _agent) = spawn_agent(&cloud, "agent-echo").await;
    let echo_port = spawn_tcp_echo().await;

    let listen_port = free_port();
    let mut rule = base_rule("echo-rule", RuleKind::CloudToAgent, listen_port);
    rule.target_agent_id = Some(agent_id);
    rule.target_port = echo_port;
    start_rule(&cloud, rule).await;

    let mut client = connect_retrying(listen_port).await;
    client.write_all(b"hello\n").await.unwrap();

    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello\n");

    drop(client);

    let drained = wait_until(|| cloud.app.tunnels.is_empty(), Duration::from_secs(2)).await;
    assert!(drained, "tunnel table did not drain after the client closed");
}

#[tokio::test]
async fn rate_limit_bounds_throughput_for_large_transfer() {
    let cloud = spawn_cloud().await;
    let (agent_id, _agent) = spawn_agent(&cloud, "agent-rate").await;
    let echo_port = spawn_tcp_echo().await;

    let listen_port = free_port();
    let mut rule = base_rule("rate-rule", RuleKind::CloudToAgent, listen_port);
    rule.target_agent_id = Some(agent_id);
    rule.target_port = echo_port;
    rule.rate_limit_bps = 1024 * 1024;
    start_rule(&cloud, rule).await;

    let client = connect_retrying(listen_port).await;
    let (mut read_half, mut write_half) = client.into_split();

    const TOTAL: usize = 4 * 1024 * 1024;
    let payload = vec![0x42u8; TOTAL];

    let started = std::time::Instant::now();
    let send_task = tokio::spawn(async move {
        write_half.write_all(&payload).await.unwrap();
    });

    let mut received = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    while received < TOTAL {
        let n = read_half.read(&mut buf).await.unwrap();
        assert_ne!(n, 0, "connection closed early, only received {received} of {TOTAL} bytes");
        received += n;
    }
    send_task.await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(received, TOTAL);
    assert!(
        elapsed >= Duration::from_millis(2900),
        "4 MiB at 1 MiB/s finished too fast: {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_secs(5),
        "4 MiB at 1 MiB/s finished too slow: {elapsed:?}"
    );
}

/// The rule's listener binds asynchronously after `start_rule` returns;
/// retry briefly instead of guessing a fixed sleep.
async fn connect_retrying(port: u16) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("could not connect to 127.0.0.1:{port}");
}
