use link_api::v1alpha1::Family;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Pool exhausted: no free {family} {pool} block for cluster {cluster}")]
    PoolExhausted {
        cluster: String,
        pool: String,
        family: Family,
    },

    #[error("Conflicting override for cluster {cluster}: {cidr} collides with {existing}")]
    ConflictingOverride {
        cluster: String,
        cidr: String,
        existing: String,
    },

    #[error("Topology conflict: cluster {cluster} ({cidr}) overlaps cluster {other} ({other_cidr})")]
    TopologyConflict {
        cluster: String,
        cidr: String,
        other: String,
        other_cidr: String,
    },

    #[error("Publish conflict on NodeConfig {0}")]
    PublishConflict(String),

    #[error("Publish of NodeConfig {node} failed after {attempts} attempts")]
    PublishFailed { node: String, attempts: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::error::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether a write may succeed when retried against a fresh read
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoreError::PublishConflict(_))
    }

    /// Condition type reported on the Cluster status for compile failures
    pub fn condition_type(&self) -> &'static str {
        match self {
            CoreError::TopologyConflict { .. } => "TopologyConflict",
            CoreError::PoolExhausted { .. }
            | CoreError::ConflictingOverride { .. }
            | CoreError::InvalidConfiguration(_) => "AllocationFailed",
            _ => "ReconcileFailed",
        }
    }

    /// CamelCase reason for the failure
    pub fn reason(&self) -> &'static str {
        match self {
            CoreError::PoolExhausted { .. } => "PoolExhausted",
            CoreError::ConflictingOverride { .. } => "ConflictingOverride",
            CoreError::TopologyConflict { .. } => "OverlappingCIDRs",
            CoreError::PublishConflict(_) => "PublishConflict",
            CoreError::PublishFailed { .. } => "PublishFailed",
            CoreError::InvalidConfiguration(_) => "InvalidConfiguration",
            CoreError::KubernetesError(_) => "KubernetesError",
            CoreError::SerializationError(_) => "SerializationError",
            CoreError::MetricsError(_) => "MetricsError",
            CoreError::Internal(_) => "Internal",
        }
    }
}
