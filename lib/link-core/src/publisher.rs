//! NodeConfig publisher
//!
//! Publishes desired NodeConfigs as minimal merge patches. Publishes to the
//! same node are serialized by a per-node lock; different nodes proceed
//! independently. The publisher never writes `lastSyncTime`.
//!
//! A spec write and its `lastChangeTime` stamp are separate requests. A node
//! whose stamp failed stays marked until a later publish stamps it, even when
//! the stored spec already matches.

use crate::compiler::DesiredConfig;
use crate::patch::merge_diff;
use crate::retry::RetryPolicy;
use crate::store::NodeConfigStore;
use crate::{CoreError, Result};
use chrono::Utc;
use link_api::v1alpha1::{NodeConfig, CLUSTER_LABEL};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What a publish did to the stored object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Created,
    Patched,
    Unchanged,
}

impl PublishOutcome {
    /// Whether the stored object was written
    pub fn applied(self) -> bool {
        !matches!(self, PublishOutcome::Unchanged)
    }
}

impl fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishOutcome::Created => write!(f, "created"),
            PublishOutcome::Patched => write!(f, "patched"),
            PublishOutcome::Unchanged => write!(f, "unchanged"),
        }
    }
}

pub struct Publisher {
    store: Arc<dyn NodeConfigStore>,
    retry: RetryPolicy,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    unstamped: Mutex<HashSet<String>>,
}

impl Publisher {
    pub fn new(store: Arc<dyn NodeConfigStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            locks: Mutex::new(HashMap::new()),
            unstamped: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn NodeConfigStore> {
        &self.store
    }

    async fn lock_for(&self, node: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(node.to_string()).or_default().clone()
    }

    /// Publish the desired config of one node.
    ///
    /// Conflicts are retried against a fresh read with exponential backoff;
    /// once attempts run out the publish fails with `PublishFailed`.
    pub async fn publish(&self, node: &str, desired: &DesiredConfig) -> Result<PublishOutcome> {
        let lock = self.lock_for(node).await;
        let _guard = lock.lock().await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_publish(node, desired).await {
                Err(e) if e.is_conflict() => {
                    if attempt >= self.retry.max_attempts {
                        warn!("Giving up on NodeConfig {} after {} attempts", node, attempt);
                        return Err(CoreError::PublishFailed {
                            node: node.to_string(),
                            attempts: attempt,
                        });
                    }
                    let backoff = self.retry.backoff_duration(attempt - 1);
                    debug!("Conflict publishing NodeConfig {}, retrying in {:?}", node, backoff);
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn try_publish(&self, node: &str, desired: &DesiredConfig) -> Result<PublishOutcome> {
        let Some(current) = self.store.get(node).await? else {
            let mut config = NodeConfig::new(node, desired.spec.clone());
            config.metadata.labels = Some(BTreeMap::from([(
                CLUSTER_LABEL.to_string(),
                desired.cluster.clone(),
            )]));
            self.store.create(config).await?;
            self.unstamped.lock().await.insert(node.to_string());
            self.stamp_change(node).await?;
            info!("Created NodeConfig {}", node);
            return Ok(PublishOutcome::Created);
        };

        let spec_patch = merge_diff(&serde_json::to_value(&current.spec)?, &serde_json::to_value(&desired.spec)?);
        let labelled = current
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(CLUSTER_LABEL))
            .is_some_and(|owner| *owner == desired.cluster);
        if spec_patch.is_none() && labelled {
            let stamped = current.status.as_ref().is_some_and(|s| s.last_change_time.is_some());
            if stamped && !self.unstamped.lock().await.contains(node) {
                return Ok(PublishOutcome::Unchanged);
            }
            debug!("Stamping pending change of NodeConfig {}", node);
            self.stamp_change(node).await?;
            return Ok(PublishOutcome::Patched);
        }

        let mut patch = json!({
            "metadata": { "resourceVersion": current.metadata.resource_version }
        });
        if !labelled {
            patch["metadata"]["labels"] = json!({ CLUSTER_LABEL: desired.cluster });
        }
        let spec_changed = spec_patch.is_some();
        if let Some(spec) = spec_patch {
            patch["spec"] = spec;
        }
        self.store.patch(node, &patch).await?;
        if spec_changed {
            self.unstamped.lock().await.insert(node.to_string());
            self.stamp_change(node).await?;
        }
        debug!("Patched NodeConfig {}", node);
        Ok(PublishOutcome::Patched)
    }

    /// Record a spec change through the status subresource
    async fn stamp_change(&self, node: &str) -> Result<()> {
        let patch: Value = json!({ "status": { "lastChangeTime": Utc::now() } });
        self.store.patch_status(node, &patch).await?;
        self.unstamped.lock().await.remove(node);
        Ok(())
    }

    /// Delete the NodeConfig of a node that left the inventory
    pub async fn unpublish(&self, node: &str) -> Result<()> {
        let lock = self.lock_for(node).await;
        {
            let _guard = lock.lock().await;
            self.store.delete(node).await?;
            self.unstamped.lock().await.remove(node);
        }
        drop(lock);

        // Waiters still holding the lock keep it registered for later publishes
        let mut locks = self.locks.lock().await;
        if locks.get(node).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            locks.remove(node);
        }
        info!("Deleted NodeConfig {}", node);
        Ok(())
    }
}
