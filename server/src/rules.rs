//! Rule and RuleState.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tunnel_protocol::Protocol;

use crate::ratelimit::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKind {
    /// Cloud binds the listen port; accepted connections are relayed to
    /// `target_agent_id`.
    CloudToAgent,
    /// Cloud binds the listen port and proxies directly to
    /// `target_host:target_port`, bypassing any agent.
    CloudToDirect,
    /// `source_agent_id` binds the listen port locally; traffic is
    /// relayed to `target_host:target_port`, reachable from Cloud.
    AgentToCloud,
    /// `source_agent_id` binds the listen port locally; traffic is
    /// relayed, via Cloud, to `target_agent_id`.
    AgentToAgent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub kind: RuleKind,
    pub protocol: Protocol,
    pub source_agent_id: Option<String>,
    pub listen_port: u16,
    pub target_agent_id: Option<String>,
    pub target_host: String,
    pub target_port: u16,
    pub enabled: bool,
    /// Bytes/sec; 0 = unlimited.
    pub rate_limit_bps: u64,
    /// Bytes; 0 = unlimited.
    pub traffic_limit_bytes: u64,
    pub traffic_used: u64,
}

/// The live, enabled counterpart of a [`Rule`]. Created on enable,
/// destroyed on disable/shutdown; exactly one exists per enabled rule.
pub struct RuleState {
    pub rule: Rule,
    pub active: AtomicBool,
    pub rate_limiter: RateLimiter,
    pub traffic_used: AtomicU64,
    /// Signals listener/accept tasks owned by this rule to stop.
    pub shutdown: Notify,
}

impl RuleState {
    pub fn new(rule: Rule) -> Arc<Self> {
        let rate_limiter = RateLimiter::new(rule.rate_limit_bps);
        let traffic_used = AtomicU64::new(rule.traffic_used);
        Arc::new(Self {
            rule,
            active: AtomicBool::new(true),
            rate_limiter,
            traffic_used,
            shutdown: Notify::new(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn traffic_limit_exceeded(&self) -> bool {
        let limit = self.rule.traffic_limit_bytes;
        limit > 0 && self.traffic_used.load(Ordering::Relaxed) >= limit
    }

    /// Adds `n` bytes to the running total and returns the new total.
    pub fn add_traffic(&self, n: u64) -> u64 {
        self.traffic_used.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }
}
