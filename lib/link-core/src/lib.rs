//! Cross-cluster overlay topology compiler and config publisher
//!
//! This library provides:
//! - Address allocation for local and bridge overlay pools
//! - Topology compilation into per-node NodeConfigs
//! - Conflict-aware publishing with retries
//! - The debounced reconciliation loop and its metrics

pub mod allocator;
pub mod compiler;
pub mod device;
pub mod error;
pub mod inventory;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod metrics;
pub mod net;
pub mod patch;
pub mod publisher;
pub mod reconciler;
pub mod retry;
pub mod shutdown;
pub mod state;
pub mod store;

#[cfg(test)]
mod fixtures;

pub use allocator::{AllocationTable, Allocator, AllocatorConfig};
pub use compiler::{Compilation, Compiler, CompilerConfig, DesiredConfig};
pub use device::DeviceMode;
pub use error::{CoreError, Result};
pub use inventory::{Inventory, Snapshot};
pub use metrics::Metrics;
pub use publisher::{PublishOutcome, Publisher};
pub use reconciler::{PassReport, Reconciler, ReconcilerConfig};
pub use retry::RetryPolicy;
pub use shutdown::Shutdown;
pub use state::NodePhase;
pub use store::{ClusterStatusStore, NodeConfigStore};
