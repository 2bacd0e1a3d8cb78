//! Kubernetes client for the overlay resources

use kube::{Api, Client};
use link_api::v1alpha1::{Cluster, ClusterNode, NodeConfig};

/// LinkClient wraps the Kubernetes client for the cluster-scoped overlay kinds
#[derive(Clone)]
pub struct LinkClient {
    client: Client,
}

impl LinkClient {
    /// Create a client from the in-cluster or kubeconfig environment
    pub async fn new() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    /// Get the underlying Kubernetes client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn clusters(&self) -> Api<Cluster> {
        Api::all(self.client.clone())
    }

    pub fn cluster_nodes(&self) -> Api<ClusterNode> {
        Api::all(self.client.clone())
    }

    pub fn node_configs(&self) -> Api<NodeConfig> {
        Api::all(self.client.clone())
    }
}
