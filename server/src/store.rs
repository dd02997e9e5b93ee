//! Persistence boundary.
//!
//! The relational store behind rules/tokens is an external collaborator —
//! out of scope here. These traits are the interface the core
//! calls against; [`InMemoryRuleStore`]/[`InMemoryTokenStore`] are a
//! minimal stand-in so the server runs and is testable without a real
//! database wired up.

use dashmap::DashMap;
use uuid::Uuid;

use crate::rules::Rule;

pub trait RuleStore: Send + Sync {
    fn list_rules(&self) -> Vec<Rule>;
    fn get_rule(&self, id: &str) -> Option<Rule>;
    fn create_rule(&self, rule: Rule);
    fn update_rule(&self, rule: Rule);
    fn delete_rule(&self, id: &str);
    /// Records bytes forwarded by a rule. Called by the forwarder on rule
    /// stop and periodically (recommended: at most once per 10s) per §6.
    fn update_traffic_used(&self, id: &str, bytes: u64);
}

pub trait TokenStore: Send + Sync {
    /// Returns the owning token id when `token` is a valid, non-revoked
    /// credential.
    fn validate(&self, token: &str) -> Option<String>;
    fn create_token(&self, token: String) -> String;
    fn delete_token(&self, id: &str);
    fn increment_usage(&self, id: &str);
}

#[derive(Default)]
pub struct InMemoryRuleStore {
    rules: DashMap<String, Rule>,
}

impl RuleStore for InMemoryRuleStore {
    fn list_rules(&self) -> Vec<Rule> {
        self.rules.iter().map(|e| e.value().clone()).collect()
    }

    fn get_rule(&self, id: &str) -> Option<Rule> {
        self.rules.get(id).map(|e| e.value().clone())
    }

    fn create_rule(&self, rule: Rule) {
        self.rules.insert(rule.id.clone(), rule);
    }

    fn update_rule(&self, rule: Rule) {
        self.rules.insert(rule.id.clone(), rule);
    }

    fn delete_rule(&self, id: &str) {
        self.rules.remove(id);
    }

    fn update_traffic_used(&self, id: &str, bytes: u64) {
        if let Some(mut rule) = self.rules.get_mut(id) {
            rule.traffic_used = bytes;
        }
    }
}

#[derive(Default)]
pub struct InMemoryTokenStore {
    // token string -> token id
    tokens: DashMap<String, String>,
    usage: DashMap<String, u64>,
}

impl TokenStore for InMemoryTokenStore {
    fn validate(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|e| e.value().clone())
    }

    fn create_token(&self, token: String) -> String {
        let id = Uuid::new_v4().to_string();
        self.tokens.insert(token, id.clone());
        id
    }

    fn delete_token(&self, id: &str) {
        self.tokens.retain(|_, v| v != id);
        self.usage.remove(id);
    }

    fn increment_usage(&self, id: &str) {
        *self.usage.entry(id.to_string()).or_insert(0) += 1;
    }
}
