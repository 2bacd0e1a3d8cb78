//! Prometheus metrics for the reconciliation loop

use crate::state::NodePhase;
use crate::{CoreError, Result};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Metrics collector shared by the reconciler and the HTTP endpoint
#[derive(Clone)]
pub struct Metrics {
    /// Compile passes by result
    pub compile_passes_total: IntCounterVec,
    /// Time spent compiling one snapshot
    pub compile_duration_seconds: Histogram,
    /// NodeConfig publishes by outcome
    pub publish_total: IntCounterVec,
    /// Tracked nodes per phase
    pub node_phase: IntGaugeVec,
    /// Clusters quarantined by the last pass
    pub quarantined_clusters: IntGauge,
    registry: Arc<Registry>,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let compile_passes_total = IntCounterVec::new(
            Opts::new("link_compile_passes_total", "Compile passes by result"),
            &["result"],
        )?;

        let compile_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "link_compile_duration_seconds",
            "Topology compile latency in seconds",
        ))?;

        let publish_total = IntCounterVec::new(
            Opts::new("link_publish_total", "NodeConfig publishes by outcome"),
            &["outcome"],
        )?;

        let node_phase = IntGaugeVec::new(
            Opts::new("link_node_phase", "Nodes per reconciliation phase"),
            &["phase"],
        )?;

        let quarantined_clusters = IntGauge::new(
            "link_quarantined_clusters",
            "Clusters excluded from the last compile pass",
        )?;

        registry.register(Box::new(compile_passes_total.clone()))?;
        registry.register(Box::new(compile_duration_seconds.clone()))?;
        registry.register(Box::new(publish_total.clone()))?;
        registry.register(Box::new(node_phase.clone()))?;
        registry.register(Box::new(quarantined_clusters.clone()))?;

        Ok(Self {
            compile_passes_total,
            compile_duration_seconds,
            publish_total,
            node_phase,
            quarantined_clusters,
            registry,
        })
    }

    pub fn record_pass(&self, result: &str, elapsed: Option<Duration>) {
        self.compile_passes_total.with_label_values(&[result]).inc();
        if let Some(elapsed) = elapsed {
            self.compile_duration_seconds.observe(elapsed.as_secs_f64());
        }
    }

    pub fn record_publish(&self, outcome: &str) {
        self.publish_total.with_label_values(&[outcome]).inc();
    }

    pub fn set_phases(&self, counts: &BTreeMap<NodePhase, usize>) {
        for phase in NodePhase::ALL {
            let count = counts.get(&phase).copied().unwrap_or(0);
            self.node_phase.with_label_values(&[phase.as_str()]).set(count as i64);
        }
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| CoreError::Internal(e.to_string()))
    }
}
