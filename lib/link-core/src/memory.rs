//! In-memory stores emulating API server write semantics

use crate::store::{ClusterStatusStore, NodeConfigStore};
use crate::{CoreError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use link_api::v1alpha1::{Cluster, NodeConfig};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Monotonic resourceVersion source
#[derive(Debug, Default)]
struct Revisions(AtomicU64);

impl Revisions {
    fn next(&self) -> String {
        (self.0.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

/// Fails when the patch names a resourceVersion other than the stored one
fn check_precondition(name: &str, stored: Option<&str>, patch: &Value) -> Result<()> {
    match patch.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
        Some(expected) if Some(expected) != stored => Err(CoreError::PublishConflict(name.to_string())),
        _ => Ok(()),
    }
}

fn merged<T: Serialize + DeserializeOwned>(object: &T, patch: &Value) -> Result<T> {
    let mut value = serde_json::to_value(object)?;
    let mut patch = patch.clone();
    if let Some(metadata) = patch.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("resourceVersion");
    }
    json_patch::merge(&mut value, &patch);
    Ok(serde_json::from_value(value)?)
}

/// NodeConfig store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryNodeConfigStore {
    objects: RwLock<BTreeMap<String, NodeConfig>>,
    revisions: Revisions,
    spec_writes: AtomicU64,
    injected_conflicts: AtomicU32,
}

impl MemoryNodeConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` spec writes fail with a conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Number of successful creates and spec patches
    pub fn spec_writes(&self) -> u64 {
        self.spec_writes.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> BTreeMap<String, NodeConfig> {
        self.objects.read().await.clone()
    }

    /// Record that the node agent applied the config at `at`
    pub async fn mark_synced(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(name)
            .ok_or_else(|| CoreError::Internal(format!("NodeConfig {} not found", name)))?;
        object.status.get_or_insert_with(Default::default).last_sync_time = Some(at);
        object.metadata.resource_version = Some(self.revisions.next());
        Ok(())
    }

    /// Store an object as another writer would, bypassing precondition checks
    pub async fn insert(&self, mut config: NodeConfig) {
        let name = config.metadata.name.clone().unwrap_or_default();
        config.metadata.resource_version = Some(self.revisions.next());
        self.objects.write().await.insert(name, config);
    }

    fn take_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl NodeConfigStore for MemoryNodeConfigStore {
    async fn get(&self, name: &str) -> Result<Option<NodeConfig>> {
        Ok(self.objects.read().await.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<NodeConfig>> {
        Ok(self.objects.read().await.values().cloned().collect())
    }

    async fn create(&self, mut config: NodeConfig) -> Result<NodeConfig> {
        let name = config.metadata.name.clone().unwrap_or_default();
        if self.take_conflict() {
            return Err(CoreError::PublishConflict(name));
        }
        let mut objects = self.objects.write().await;
        if objects.contains_key(&name) {
            return Err(CoreError::PublishConflict(name));
        }
        config.metadata.resource_version = Some(self.revisions.next());
        objects.insert(name.clone(), config.clone());
        self.spec_writes.fetch_add(1, Ordering::SeqCst);
        debug!("Created NodeConfig {}", name);
        Ok(config)
    }

    async fn patch(&self, name: &str, patch: &Value) -> Result<NodeConfig> {
        if self.take_conflict() {
            return Err(CoreError::PublishConflict(name.to_string()));
        }
        let mut objects = self.objects.write().await;
        let current = objects
            .get(name)
            .ok_or_else(|| CoreError::Internal(format!("NodeConfig {} not found", name)))?;
        check_precondition(name, current.metadata.resource_version.as_deref(), patch)?;

        let mut next: NodeConfig = merged(current, patch)?;
        next.metadata.resource_version = Some(self.revisions.next());
        objects.insert(name.to_string(), next.clone());
        self.spec_writes.fetch_add(1, Ordering::SeqCst);
        Ok(next)
    }

    async fn patch_status(&self, name: &str, patch: &Value) -> Result<NodeConfig> {
        let mut objects = self.objects.write().await;
        let current = objects
            .get(name)
            .ok_or_else(|| CoreError::Internal(format!("NodeConfig {} not found", name)))?;
        let status_only = serde_json::json!({ "status": patch.get("status").cloned().unwrap_or(Value::Null) });

        let mut next: NodeConfig = merged(current, &status_only)?;
        next.metadata.resource_version = Some(self.revisions.next());
        objects.insert(name.to_string(), next.clone());
        Ok(next)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if self.objects.write().await.remove(name).is_some() {
            debug!("Deleted NodeConfig {}", name);
        }
        Ok(())
    }
}

/// Cluster objects kept in process memory
#[derive(Debug, Default)]
pub struct MemoryClusterStore {
    objects: RwLock<BTreeMap<String, Cluster>>,
    revisions: Revisions,
}

impl MemoryClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cluster, assigning a fresh resourceVersion
    pub async fn insert(&self, mut cluster: Cluster) -> Cluster {
        cluster.metadata.resource_version = Some(self.revisions.next());
        self.objects
            .write()
            .await
            .insert(cluster.cluster_name().to_string(), cluster.clone());
        cluster
    }

    pub async fn get(&self, name: &str) -> Option<Cluster> {
        self.objects.read().await.get(name).cloned()
    }
}

#[async_trait]
impl ClusterStatusStore for MemoryClusterStore {
    async fn patch_status(&self, name: &str, patch: &Value) -> Result<()> {
        let mut objects = self.objects.write().await;
        let current = objects
            .get(name)
            .ok_or_else(|| CoreError::Internal(format!("Cluster {} not found", name)))?;
        check_precondition(name, current.metadata.resource_version.as_deref(), patch)?;

        let status_only = serde_json::json!({ "status": patch.get("status").cloned().unwrap_or(Value::Null) });
        let mut next: Cluster = merged(current, &status_only)?;
        next.metadata.resource_version = Some(self.revisions.next());
        objects.insert(name.to_string(), next);
        Ok(())
    }
}
