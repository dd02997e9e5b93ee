use tunnel_agent::config::AgentConfig;
use tunnel_agent::connection;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AgentConfig::from_env();
    connection::run_agent_loop(config).await;
}
