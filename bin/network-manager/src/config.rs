//! Manager configuration
//!
//! Loaded from an optional YAML file named by `LINK_CONFIG`, then overridden
//! from the environment.

use anyhow::{Context, Result};
use link_core::{AllocatorConfig, CompilerConfig, DeviceMode, ReconcilerConfig, RetryPolicy};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerConfig {
    pub metrics_addr: SocketAddr,
    pub debounce_millis: u64,
    pub max_batch_events: u64,
    pub resync_seconds: u64,
    pub stale_grace_seconds: u64,
    pub publish_workers: usize,
    pub publish_retry: RetryConfig,
    pub device_mode: DeviceMode,
    pub ipv4_block_prefix: u8,
    pub ipv6_block_prefix: u8,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_millis: u64,
    pub max_backoff_millis: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            debounce_millis: 1000,
            max_batch_events: 100,
            resync_seconds: 30,
            stale_grace_seconds: 90,
            publish_workers: 8,
            publish_retry: RetryConfig::default(),
            device_mode: DeviceMode::default(),
            ipv4_block_prefix: 16,
            ipv6_block_prefix: 64,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_millis: 100,
            max_backoff_millis: 5000,
        }
    }
}

impl ManagerConfig {
    /// Load the file named by `LINK_CONFIG` if set, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("LINK_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(addr) = lookup("LINK_METRICS_ADDR") {
            self.metrics_addr = addr
                .parse()
                .with_context(|| format!("Invalid LINK_METRICS_ADDR {:?}", addr))?;
        }
        if let Some(mode) = lookup("LINK_DEVICE_MODE") {
            self.device_mode = mode.parse()?;
        }
        if let Some(workers) = lookup("LINK_PUBLISH_WORKERS") {
            self.publish_workers = workers
                .parse()
                .with_context(|| format!("Invalid LINK_PUBLISH_WORKERS {:?}", workers))?;
        }
        Ok(())
    }

    pub fn compiler(&self) -> CompilerConfig {
        CompilerConfig {
            device_mode: self.device_mode,
            allocator: AllocatorConfig {
                ipv4_block_prefix: self.ipv4_block_prefix,
                ipv6_block_prefix: self.ipv6_block_prefix,
            },
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.publish_retry.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.publish_retry.initial_backoff_millis),
            max_backoff: Duration::from_millis(self.publish_retry.max_backoff_millis),
            jitter: true,
        }
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            debounce: Duration::from_millis(self.debounce_millis),
            max_batch_events: self.max_batch_events,
            resync: Duration::from_secs(self.resync_seconds.max(1)),
            stale_grace: Duration::from_secs(self.stale_grace_seconds),
            publish_workers: self.publish_workers.max(1),
        }
    }
}
