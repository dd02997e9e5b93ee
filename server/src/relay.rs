//! Relay links for agent-initiated rules (`agent→cloud`, `agent→agent`).
//!
//! Cloud does not bind a socket for these rule kinds; instead
//! the source agent binds locally and asks Cloud, over the control
//! channel, to either dial the target itself (`agent→cloud`) or relay the
//! connect onward to a second agent (`agent→agent`). Because the
//! initiating agent picks its own tunnel id and Cloud's global
//! [`crate::tunnels::TunnelTable`] is reserved for ids Cloud itself
//! allocates (the `cloud→agent`/`cloud→direct` accept paths), a relay
//! link is addressed by `(source_agent_id, source_tunnel_id)` instead —
//! scoped to the session the frame arrived on, which the dispatcher
//! already knows.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

/// The peer side of a relay link.
pub enum PeerLeg {
    /// `agent→cloud`: Cloud dialed the target itself; bytes go to this
    /// socket's writer task.
    CloudSocket(mpsc::Sender<Vec<u8>>),
    /// `agent→agent`: the other agent's session id and the tunnel id
    /// Cloud allocated for that leg.
    Agent { agent_id: String, tunnel_id: u32 },
}

pub struct RelayLink {
    pub peer: PeerLeg,
    pub rule_id: String,
}

#[derive(Default)]
pub struct RelayTable {
    links: DashMap<(String, u32), Arc<RelayLink>>,
}

impl RelayTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, agent_id: String, tunnel_id: u32, link: Arc<RelayLink>) {
        self.links.insert((agent_id, tunnel_id), link);
    }

    pub fn get(&self, agent_id: &str, tunnel_id: u32) -> Option<Arc<RelayLink>> {
        self.links
            .get(&(agent_id.to_string(), tunnel_id))
            .map(|e| e.value().clone())
    }

    pub fn remove(&self, agent_id: &str, tunnel_id: u32) -> Option<Arc<RelayLink>> {
        self.links
            .remove(&(agent_id.to_string(), tunnel_id))
            .map(|(_, l)| l)
    }

    /// Returns the tunnel ids of every link owned by `agent_id`, for
    /// session teardown. A link is "owned" by an agent if that agent is
    /// the keying side of the `(agent_id, tunnel_id)` entry — both legs of
    /// an `agent→agent` relay are inserted under their own agent id, so
    /// tearing down either session's links finds exactly that session's
    /// half.
    pub fn ids_for_agent(&self, agent_id: &str) -> Vec<u32> {
        self.links
            .iter()
            .filter(|e| e.key().0 == agent_id)
            .map(|e| e.key().1)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_scoped_by_agent_and_tunnel_id() {
        let table = RelayTable::new();
        let link = Arc::new(RelayLink {
            peer: PeerLeg::Agent {
                agent_id: "B1".to_string(),
                tunnel_id: 42,
            },
            rule_id: "r1".to_string(),
        });
        table.insert("A1".to_string(), 7, link);

        assert!(table.get("A1", 7).is_some());
        // same tunnel id under a different agent must not collide
        assert!(table.get("B1", 7).is_none());
        assert!(table.get("A1", 99).is_none());
    }

    #[test]
    fn remove_returns_the_link_once() {
        let table = RelayTable::new();
        let (tx, _rx) = mpsc::channel(1);
        table.insert(
            "A1".to_string(),
            7,
            Arc::new(RelayLink {
                peer: PeerLeg::CloudSocket(tx),
                rule_id: "r1".to_string(),
            }),
        );
        assert!(table.remove("A1", 7).is_some());
        assert!(table.remove("A1", 7).is_none());
    }

    #[test]
    fn ids_for_agent_only_returns_that_agents_links() {
        let table = RelayTable::new();
        let (tx, _rx) = mpsc::channel(1);
        table.insert(
            "A1".to_string(),
            7,
            Arc::new(RelayLink {
                peer: PeerLeg::Agent {
                    agent_id: "B1".to_string(),
                    tunnel_id: 99,
                },
                rule_id: "r1".to_string(),
            }),
        );
        table.insert(
            "B1".to_string(),
            99,
            Arc::new(RelayLink {
                peer: PeerLeg::Agent {
                    agent_id: "A1".to_string(),
                    tunnel_id: 7,
                },
                rule_id: "r1".to_string(),
            }),
        );
        table.insert(
            "A1".to_string(),
            8,
            Arc::new(RelayLink {
                peer: PeerLeg::CloudSocket(tx),
                rule_id: "r2".to_string(),
            }),
        );

        let mut ids = table.ids_for_agent("A1");
        ids.sort_unstable();
        assert_eq!(ids, vec![7, 8]);
        assert_eq!(table.ids_for_agent("B1"), vec![99]);
        assert!(table.ids_for_agent("C1").is_empty());
    }
}
