/// API version v1alpha1 for the cluster link CRDs

pub mod cluster;
pub mod cluster_node;
pub mod node_config;

pub use cluster::{
    AddressPair, CidrPair, Cluster, ClusterAllocation, ClusterCondition, ClusterSpec,
    ClusterStatus, Family, IpFamily, NetworkType, NicNodeNames, NodeAllocation,
};
pub use cluster_node::{ClusterNode, ClusterNodeSpec, ClusterNodeStatus};
pub use node_config::{Arp, Device, Fdb, Iptables, NodeConfig, NodeConfigSpec, NodeConfigStatus, Route};

/// API group for cluster link resources
pub const API_GROUP: &str = "kosmos.io";
/// API version for cluster link resources
pub const API_VERSION: &str = "v1alpha1";

/// Label carrying the owning cluster of a NodeConfig
pub const CLUSTER_LABEL: &str = "kosmos.io/cluster";

/// Role marking a node as an inter-cluster gateway
pub const ROLE_GATEWAY: &str = "gateway";
