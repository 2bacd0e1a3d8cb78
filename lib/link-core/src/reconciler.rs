//! Reconciliation loop
//!
//! A single worker turns inventory snapshots into published NodeConfigs.
//! Changes are debounced into batches, and a snapshot that falls behind the
//! inventory is abandoned in favour of the newer one.

use crate::allocator::AllocationTable;
use crate::compiler::{Compilation, Compiler, DesiredConfig};
use crate::inventory::{Inventory, Snapshot};
use crate::metrics::Metrics;
use crate::patch::merge_diff;
use crate::publisher::{PublishOutcome, Publisher};
use crate::shutdown::Shutdown;
use crate::state::{NodePhase, NodeTracker};
use crate::store::ClusterStatusStore;
use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use link_api::v1alpha1::{Cluster, ClusterAllocation, ClusterCondition, NodeConfig};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Quiet window closing a batch of inventory changes
    pub debounce: Duration,
    /// Batch size closing a batch early
    pub max_batch_events: u64,
    /// Interval of full republish and staleness sweeps
    pub resync: Duration,
    /// Time a node may take to confirm a change before it is stale
    pub stale_grace: Duration,
    /// Concurrent publishes
    pub publish_workers: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            max_batch_events: 100,
            resync: Duration::from_secs(30),
            stale_grace: Duration::from_secs(90),
            publish_workers: 8,
        }
    }
}

/// Summary of one pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub generation: u64,
    pub published: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub deleted: usize,
    pub quarantined: usize,
    /// The inventory moved on before the pass completed
    pub superseded: bool,
    /// The inventory was not listed yet
    pub skipped: bool,
}

#[derive(Default)]
struct PassState {
    /// None until the first pass rebuilt it from Cluster status
    table: Option<AllocationTable>,
    /// Last successfully published config per node
    published: BTreeMap<String, DesiredConfig>,
    tracker: NodeTracker,
}

pub struct Reconciler {
    inventory: Arc<Inventory>,
    compiler: Compiler,
    publisher: Arc<Publisher>,
    clusters: Arc<dyn ClusterStatusStore>,
    metrics: Metrics,
    config: ReconcilerConfig,
    state: Mutex<PassState>,
}

impl Reconciler {
    pub fn new(
        inventory: Arc<Inventory>,
        compiler: Compiler,
        publisher: Arc<Publisher>,
        clusters: Arc<dyn ClusterStatusStore>,
        metrics: Metrics,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            inventory,
            compiler,
            publisher,
            clusters,
            metrics,
            config,
            state: Mutex::new(PassState::default()),
        }
    }

    /// Run until shutdown is triggered
    pub async fn run(&self, shutdown: Shutdown) {
        let mut changes = self.inventory.subscribe();
        let mut resync = tokio::time::interval(self.config.resync);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        resync.tick().await;

        info!("Reconciler started");
        let mut full = true;
        loop {
            if let Err(e) = self.reconcile_once(full).await {
                error!("Reconcile pass failed: {}", e);
            }

            full = tokio::select! {
                _ = shutdown.wait() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.debounce(&mut changes, &shutdown).await;
                    false
                }
                _ = resync.tick() => true,
            };
            if shutdown.is_triggered() {
                break;
            }
        }
        info!("Reconciler stopped");
    }

    /// Wait for a quiet window or a full batch of changes
    async fn debounce(&self, changes: &mut watch::Receiver<u64>, shutdown: &Shutdown) {
        let first = *changes.borrow_and_update();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.debounce) => return,
                _ = shutdown.wait() => return,
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let current = *changes.borrow_and_update();
                    if current.saturating_sub(first) >= self.config.max_batch_events {
                        debug!("Batch of {} inventory changes is full", current - first);
                        return;
                    }
                }
            }
        }
    }

    /// Compile and publish the current inventory
    pub async fn reconcile_once(&self, full: bool) -> Result<PassReport> {
        let snapshot = self.inventory.snapshot().await;
        self.reconcile_snapshot(snapshot, full).await
    }

    fn superseded(&self, generation: u64) -> bool {
        self.inventory.generation() != generation
    }

    pub(crate) async fn reconcile_snapshot(&self, snapshot: Snapshot, full: bool) -> Result<PassReport> {
        let generation = snapshot.generation;
        let mut report = PassReport {
            generation,
            ..Default::default()
        };
        if !snapshot.ready {
            debug!("Inventory not listed yet, skipping pass");
            report.skipped = true;
            return Ok(report);
        }

        let mut state = self.state.lock().await;
        let started = Instant::now();
        let previous = match &state.table {
            Some(table) => table.clone(),
            None => AllocationTable::from_clusters(&snapshot.clusters),
        };
        let mut compilation = self.compiler.compile(&previous, &snapshot.clusters, &snapshot.nodes);
        let elapsed = started.elapsed();

        report.quarantined = compilation.failures.len();
        self.metrics.quarantined_clusters.set(compilation.failures.len() as i64);
        for (cluster, e) in &compilation.failures {
            error!("Cluster {} quarantined: {}", cluster, e);
        }

        if self.superseded(generation) {
            info!("Snapshot {} superseded before persisting", generation);
            self.metrics.record_pass("superseded", Some(elapsed));
            report.superseded = true;
            return Ok(report);
        }

        let unpersisted = self.persist_clusters(&snapshot.clusters, &compilation).await;
        if !unpersisted.is_empty() {
            let frozen = &mut compilation.frozen;
            compilation.configs.retain(|node, desired| {
                let keep = !unpersisted.contains(&desired.cluster);
                if !keep {
                    frozen.insert(node.clone());
                }
                keep
            });
        }
        let full = full || compilation.reallocated() || state.table.is_none();
        if compilation.reallocated() {
            info!("Address space was reallocated, republishing every node");
        }
        state.table = Some(compilation.allocations.clone());

        self.publish(&mut state, &compilation, generation, full, &mut report).await;
        if report.superseded {
            self.metrics.record_pass("superseded", Some(elapsed));
            return Ok(report);
        }
        state.published.retain(|node, _| compilation.configs.contains_key(node));

        let listing = self.delete_orphans(&compilation, generation, &mut report).await?;

        let nodes: BTreeSet<String> = compilation.configs.keys().cloned().collect();
        let grace = chrono::Duration::from_std(self.config.stale_grace).unwrap_or_else(|_| chrono::Duration::seconds(90));
        state.tracker.observe(&nodes, &listing, Utc::now(), grace);
        self.metrics.set_phases(&state.tracker.counts());

        let result = if report.superseded {
            "superseded"
        } else if compilation.failures.is_empty() && unpersisted.is_empty() && report.failed == 0 {
            "ok"
        } else {
            "partial"
        };
        self.metrics.record_pass(result, Some(elapsed));
        info!(
            "Pass {} done: {} published, {} unchanged, {} failed, {} deleted, {} clusters quarantined",
            generation, report.published, report.unchanged, report.failed, report.deleted, report.quarantined
        );
        Ok(report)
    }

    /// Write allocation records and conditions that changed.
    ///
    /// Returns the clusters whose status could not be written; their NodeConfigs
    /// are left untouched for this pass.
    async fn persist_clusters(&self, clusters: &[Cluster], compilation: &Compilation) -> BTreeSet<String> {
        let now = Utc::now();
        let mut failed = BTreeSet::new();
        for cluster in clusters {
            let name = cluster.cluster_name();
            if name.is_empty() {
                continue;
            }
            let record = compilation.allocations.record(name);
            let written = match status_patch(cluster, record, compilation.failures.get(name), now) {
                Ok(None) => continue,
                Ok(Some(patch)) => self.clusters.patch_status(name, &patch).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => debug!("Updated status of cluster {}", name),
                Err(e) => {
                    warn!("Failed to update status of cluster {}, holding its NodeConfigs: {}", name, e);
                    failed.insert(name.to_string());
                }
            }
        }
        failed
    }

    async fn publish(
        &self,
        state: &mut PassState,
        compilation: &Compilation,
        generation: u64,
        full: bool,
        report: &mut PassReport,
    ) {
        let work: Vec<(String, DesiredConfig)> = compilation
            .configs
            .iter()
            .filter(|(node, desired)| full || state.published.get(*node) != Some(*desired))
            .map(|(node, desired)| (node.clone(), desired.clone()))
            .collect();
        debug!("Publishing {} of {} NodeConfigs", work.len(), compilation.configs.len());

        let publisher = &self.publisher;
        let results: Vec<(String, DesiredConfig, Option<Result<PublishOutcome>>)> = stream::iter(work)
            .map(|(node, desired)| async move {
                if self.superseded(generation) {
                    return (node, desired, None);
                }
                let result = publisher.publish(&node, &desired).await;
                (node, desired, Some(result))
            })
            .buffer_unordered(self.config.publish_workers.max(1))
            .collect()
            .await;

        for (node, desired, result) in results {
            match result {
                None => report.superseded = true,
                Some(Ok(outcome)) => {
                    self.metrics.record_publish(&outcome.to_string());
                    if outcome.applied() {
                        report.published += 1;
                    } else {
                        report.unchanged += 1;
                    }
                    state.tracker.clear_failure(&node);
                    state.published.insert(node, desired);
                }
                Some(Err(e)) => {
                    error!("Failed to publish NodeConfig {}: {}", node, e);
                    self.metrics.record_publish("failed");
                    report.failed += 1;
                    state.tracker.record_failure(&node, e.to_string());
                    state.published.remove(&node);
                }
            }
        }
    }

    /// Delete stored NodeConfigs of nodes that left the inventory.
    ///
    /// Returns the remaining stored configs by name.
    async fn delete_orphans(
        &self,
        compilation: &Compilation,
        generation: u64,
        report: &mut PassReport,
    ) -> Result<BTreeMap<String, NodeConfig>> {
        let mut listing = BTreeMap::new();
        for config in self.publisher.store().list().await? {
            let name = config.metadata.name.clone().unwrap_or_default();
            if compilation.configs.contains_key(&name) || compilation.frozen.contains(&name) {
                listing.insert(name, config);
                continue;
            }
            if self.superseded(generation) {
                report.superseded = true;
                listing.insert(name, config);
                continue;
            }
            match self.publisher.unpublish(&name).await {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    error!("Failed to delete NodeConfig {}: {}", name, e);
                    listing.insert(name, config);
                }
            }
        }
        Ok(listing)
    }

    /// Current phase of a node
    pub async fn phase(&self, node: &str) -> Option<NodePhase> {
        self.state.lock().await.tracker.phase(node)
    }

    /// Last persistent publish failure of a node
    pub async fn failure(&self, node: &str) -> Option<String> {
        self.state.lock().await.tracker.failure(node).map(str::to_string)
    }
}

/// Status patch for one cluster, or None when nothing changed
fn status_patch(
    cluster: &Cluster,
    record: ClusterAllocation,
    failure: Option<&CoreError>,
    now: DateTime<Utc>,
) -> Result<Option<Value>> {
    let current = cluster.status.clone().unwrap_or_default();
    let mut desired = current.clone();
    desired.allocation = (record != ClusterAllocation::default()).then_some(record);
    desired.conditions = conditions(&current.conditions, failure, now);

    let Some(diff) = merge_diff(&serde_json::to_value(&current)?, &serde_json::to_value(&desired)?) else {
        return Ok(None);
    };
    Ok(Some(json!({
        "metadata": { "resourceVersion": cluster.metadata.resource_version },
        "status": diff,
    })))
}

fn conditions(existing: &[ClusterCondition], failure: Option<&CoreError>, now: DateTime<Utc>) -> Vec<ClusterCondition> {
    let condition = |condition_type: &str, status: &str, reason: &str, message: String| ClusterCondition {
        condition_type: condition_type.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message),
        last_transition_time: existing
            .iter()
            .find(|c| c.condition_type == condition_type && c.status == status)
            .and_then(|c| c.last_transition_time)
            .or(Some(now)),
    };

    match failure {
        None => vec![condition("Ready", "True", "Compiled", "Topology compiled".to_string())],
        Some(e) => vec![
            condition("Ready", "False", e.reason(), e.to_string()),
            condition(e.condition_type(), "True", e.reason(), e.to_string()),
        ],
    }
}
