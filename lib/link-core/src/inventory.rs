//! In-memory inventory of Clusters and ClusterNodes
//!
//! Every mutation bumps a generation counter published on a watch channel.
//! The inventory is ready once both kinds completed an initial listing.

use link_api::v1alpha1::{Cluster, ClusterNode, ClusterSpec};
use std::collections::BTreeMap;
use tokio::sync::{watch, RwLock};
use tracing::debug;

/// Consistent copy of the inventory at one generation
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub generation: u64,
    pub ready: bool,
    pub clusters: Vec<Cluster>,
    pub nodes: Vec<ClusterNode>,
}

#[derive(Debug, Default)]
struct State {
    clusters: BTreeMap<String, Cluster>,
    nodes: BTreeMap<String, ClusterNode>,
    clusters_listed: bool,
    nodes_listed: bool,
}

#[derive(Debug)]
pub struct Inventory {
    state: RwLock<State>,
    generation: watch::Sender<u64>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            state: RwLock::new(State::default()),
            generation,
        }
    }

    /// Receiver notified on every generation bump
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    /// Insert or update a cluster.
    ///
    /// Updates touching only metadata or the allocation record and conditions
    /// are stored without a generation bump.
    pub async fn apply_cluster(&self, cluster: Cluster) {
        let name = cluster.cluster_name().to_string();
        let mut state = self.state.write().await;
        let relevant = state
            .clusters
            .get(&name)
            .map_or(true, |current| cluster_inputs(current) != cluster_inputs(&cluster));
        state.clusters.insert(name.clone(), cluster);
        if relevant {
            debug!("Inventory: cluster {} updated", name);
            self.bump();
        }
    }

    pub async fn delete_cluster(&self, name: &str) {
        let mut state = self.state.write().await;
        if state.clusters.remove(name).is_some() {
            debug!("Inventory: cluster {} deleted", name);
            self.bump();
        }
    }

    /// Replace every cluster after a full listing
    pub async fn replace_clusters(&self, clusters: Vec<Cluster>) {
        let mut state = self.state.write().await;
        state.clusters = clusters
            .into_iter()
            .map(|c| (c.cluster_name().to_string(), c))
            .collect();
        state.clusters_listed = true;
        debug!("Inventory: {} clusters listed", state.clusters.len());
        self.bump();
    }

    pub async fn apply_node(&self, node: ClusterNode) {
        let key = node.node_key();
        let mut state = self.state.write().await;
        let relevant = state
            .nodes
            .get(&key)
            .map_or(true, |current| current.spec != node.spec);
        state.nodes.insert(key.clone(), node);
        if relevant {
            debug!("Inventory: node {} updated", key);
            self.bump();
        }
    }

    pub async fn delete_node(&self, key: &str) {
        let mut state = self.state.write().await;
        if state.nodes.remove(key).is_some() {
            debug!("Inventory: node {} deleted", key);
            self.bump();
        }
    }

    /// Replace every node after a full listing
    pub async fn replace_nodes(&self, nodes: Vec<ClusterNode>) {
        let mut state = self.state.write().await;
        state.nodes = nodes.into_iter().map(|n| (n.node_key(), n)).collect();
        state.nodes_listed = true;
        debug!("Inventory: {} nodes listed", state.nodes.len());
        self.bump();
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.read().await;
        Snapshot {
            generation: self.generation(),
            ready: state.clusters_listed && state.nodes_listed,
            clusters: state.clusters.values().cloned().collect(),
            nodes: state.nodes.values().cloned().collect(),
        }
    }
}

/// The parts of a Cluster the compiler reads
fn cluster_inputs(cluster: &Cluster) -> (&ClusterSpec, (&[String], &[String])) {
    let cidrs = cluster
        .status
        .as_ref()
        .map(|s| (s.pod_cidrs.as_slice(), s.service_cidrs.as_slice()))
        .unwrap_or_default();
    (&cluster.spec, cidrs)
}
