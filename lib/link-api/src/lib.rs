//! Cluster link API types and CRDs for Kubernetes integration
//!
//! This library defines the custom resources of the cluster link network manager:
//! - Cluster: a member cluster and its overlay address pools
//! - ClusterNode: one node of a member cluster
//! - NodeConfig: the compiled network state of one node

pub mod v1alpha1;

pub use v1alpha1::{Cluster, ClusterNode, NodeConfig};
