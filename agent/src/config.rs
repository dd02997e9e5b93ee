//! Agent configuration, read from the environment. A config-file/CLI
//! layer is intentionally out of scope for now.

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:7070/ws";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub auth_token: String,
    pub name: String,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let server_url =
            std::env::var("TUNNEL_SERVER_URL").unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string());
        let auth_token = std::env::var("TUNNEL_AUTH_TOKEN").unwrap_or_default();
        let name = std::env::var("TUNNEL_AGENT_NAME").unwrap_or_else(|_| "agent".to_string());
        Self {
            server_url,
            auth_token,
            name,
        }
    }
}
