//! Node reconciliation phases

use chrono::{DateTime, Duration, Utc};
use link_api::v1alpha1::NodeConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{info, warn};

/// Where a node stands in the delivery of its NodeConfig
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodePhase {
    /// No NodeConfig stored yet
    Pending,
    /// Stored, not yet confirmed by the node agent
    Published,
    /// The agent confirmed the latest change
    Synced,
    /// The latest change is unconfirmed beyond the grace period
    Stale,
}

impl NodePhase {
    pub const ALL: [NodePhase; 4] = [
        NodePhase::Pending,
        NodePhase::Published,
        NodePhase::Synced,
        NodePhase::Stale,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NodePhase::Pending => "pending",
            NodePhase::Published => "published",
            NodePhase::Synced => "synced",
            NodePhase::Stale => "stale",
        }
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of one node from a single read of its NodeConfig
pub fn node_phase(config: Option<&NodeConfig>, now: DateTime<Utc>, grace: Duration) -> NodePhase {
    let Some(config) = config else {
        return NodePhase::Pending;
    };
    let (changed, synced) = config
        .status
        .as_ref()
        .map(|s| (s.last_change_time, s.last_sync_time))
        .unwrap_or_default();

    match (changed, synced) {
        (None, _) => NodePhase::Published,
        (Some(changed), Some(synced)) if synced >= changed => NodePhase::Synced,
        (Some(changed), _) if now - changed > grace => NodePhase::Stale,
        _ => NodePhase::Published,
    }
}

/// Phases and delivery failures of every desired node
#[derive(Debug, Default)]
pub struct NodeTracker {
    phases: BTreeMap<String, NodePhase>,
    failures: BTreeMap<String, String>,
}

impl NodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute phases for `nodes` from one listing of stored NodeConfigs.
    ///
    /// Returns the nodes that turned stale with this observation.
    pub fn observe(
        &mut self,
        nodes: &BTreeSet<String>,
        stored: &BTreeMap<String, NodeConfig>,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Vec<String> {
        let mut newly_stale = Vec::new();
        let mut next = BTreeMap::new();
        for node in nodes {
            let phase = node_phase(stored.get(node), now, grace);
            let previous = self.phases.get(node).copied();
            if phase == NodePhase::Stale && previous != Some(NodePhase::Stale) {
                warn!("Node {} has not confirmed its NodeConfig within {}s", node, grace.num_seconds());
                newly_stale.push(node.clone());
            } else if phase == NodePhase::Synced && previous == Some(NodePhase::Stale) {
                info!("Node {} recovered and is synced", node);
            }
            next.insert(node.clone(), phase);
        }
        self.phases = next;
        self.failures.retain(|node, _| nodes.contains(node));
        newly_stale
    }

    pub fn phase(&self, node: &str) -> Option<NodePhase> {
        self.phases.get(node).copied()
    }

    pub fn counts(&self) -> BTreeMap<NodePhase, usize> {
        let mut counts = BTreeMap::new();
        for phase in self.phases.values() {
            *counts.entry(*phase).or_insert(0) += 1;
        }
        counts
    }

    /// Record a publish that exhausted its retries
    pub fn record_failure(&mut self, node: &str, reason: String) {
        self.failures.insert(node.to_string(), reason);
    }

    pub fn clear_failure(&mut self, node: &str) {
        self.failures.remove(node);
    }

    pub fn failure(&self, node: &str) -> Option<&str> {
        self.failures.get(node).map(String::as_str)
    }
}
