//! Persistence seams for NodeConfigs and Cluster status
//!
//! Writes that carry `metadata.resourceVersion` must fail with
//! [`CoreError::PublishConflict`](crate::CoreError::PublishConflict) when the
//! stored object moved on.

use crate::Result;
use async_trait::async_trait;
use link_api::v1alpha1::NodeConfig;
use serde_json::Value;

#[async_trait]
pub trait NodeConfigStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<NodeConfig>>;

    async fn list(&self) -> Result<Vec<NodeConfig>>;

    /// Create a NodeConfig; an existing object of the same name is a conflict
    async fn create(&self, config: NodeConfig) -> Result<NodeConfig>;

    /// Apply a merge patch to the object
    async fn patch(&self, name: &str, patch: &Value) -> Result<NodeConfig>;

    /// Apply a merge patch through the status subresource
    async fn patch_status(&self, name: &str, patch: &Value) -> Result<NodeConfig>;

    /// Delete a NodeConfig; deleting a missing object succeeds
    async fn delete(&self, name: &str) -> Result<()>;
}

#[async_trait]
pub trait ClusterStatusStore: Send + Sync {
    /// Apply a merge patch to the status of a Cluster
    async fn patch_status(&self, name: &str, patch: &Value) -> Result<()>;
}
