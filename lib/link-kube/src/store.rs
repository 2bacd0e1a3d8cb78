//! API server backed stores

use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Api;
use link_api::v1alpha1::{Cluster, NodeConfig};
use link_core::store::{ClusterStatusStore, NodeConfigStore};
use link_core::{CoreError, Result};
use serde_json::Value;
use tracing::debug;

use crate::LinkClient;

/// Map a failed write: 409 is a lost race, anything else is passed through
fn write_error(name: &str, e: kube::Error) -> CoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => CoreError::PublishConflict(name.to_string()),
        e => CoreError::KubernetesError(e),
    }
}

pub struct KubeNodeConfigStore {
    api: Api<NodeConfig>,
}

impl KubeNodeConfigStore {
    pub fn new(client: &LinkClient) -> Self {
        Self {
            api: client.node_configs(),
        }
    }
}

#[async_trait]
impl NodeConfigStore for KubeNodeConfigStore {
    async fn get(&self, name: &str) -> Result<Option<NodeConfig>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list(&self) -> Result<Vec<NodeConfig>> {
        let list = self.api.list(&ListParams::default()).await?;
        debug!("Listed {} NodeConfigs", list.items.len());
        Ok(list.items)
    }

    async fn create(&self, config: NodeConfig) -> Result<NodeConfig> {
        let name = config.metadata.name.clone().unwrap_or_default();
        self.api
            .create(&PostParams::default(), &config)
            .await
            .map_err(|e| write_error(&name, e))
    }

    async fn patch(&self, name: &str, patch: &Value) -> Result<NodeConfig> {
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| write_error(name, e))
    }

    async fn patch_status(&self, name: &str, patch: &Value) -> Result<NodeConfig> {
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| write_error(name, e))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(CoreError::KubernetesError(e)),
        }
    }
}

pub struct KubeClusterStatusStore {
    api: Api<Cluster>,
}

impl KubeClusterStatusStore {
    pub fn new(client: &LinkClient) -> Self {
        Self { api: client.clusters() }
    }
}

#[async_trait]
impl ClusterStatusStore for KubeClusterStatusStore {
    async fn patch_status(&self, name: &str, patch: &Value) -> Result<()> {
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| write_error(name, e))?;
        Ok(())
    }
}
