use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Cluster is one managed Kubernetes cluster whose pod network joins the overlay
#[derive(CustomResource, Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kosmos.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    derive = "Default",
    derive = "PartialEq",
    status = "ClusterStatus",
    printcolumn = r#"{"name":"NETWORK_TYPE","type":"string","jsonPath":".spec.networkType"}"#,
    printcolumn = r#"{"name":"IP_FAMILY","type":"string","jsonPath":".spec.ipFamily"}"#,
)]
pub struct ClusterSpec {
    /// Network model used by the nodes of this cluster
    #[serde(default, rename = "networkType")]
    pub network_type: NetworkType,

    /// Address families this cluster participates in
    #[serde(default, rename = "ipFamily")]
    pub ip_family: IpFamily,

    /// Pool for intra-cluster tunnel addresses (gateway model)
    #[serde(default = "default_local_cidrs", rename = "localCIDRs")]
    pub local_cidrs: CidrPair,

    /// Pool for inter-cluster tunnel endpoints
    #[serde(default = "default_bridge_cidrs", rename = "bridgeCIDRs")]
    pub bridge_cidrs: CidrPair,

    /// Interface used when a node does not report one; "*" means none
    #[serde(default = "default_nic_name", rename = "defaultNICName")]
    pub default_nic_name: String,

    /// Per-node interface overrides
    #[serde(default, rename = "nicNodeNames")]
    pub nic_node_names: Vec<NicNodeNames>,

    /// Explicit cluster-name to CIDR allocation overrides
    #[serde(default, rename = "globalCIDRsMap")]
    pub global_cidrs_map: BTreeMap<String, String>,

    /// Namespace the per-cluster agents are deployed into
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// CNI running inside the cluster
    #[serde(default = "default_cni")]
    pub cni: String,

    /// Allocate tunnel addresses per node from the pool instead of per-cluster blocks
    #[serde(default, rename = "useIPPool")]
    pub use_ip_pool: bool,
}

/// Network model of a cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Every node tunnels directly to remote peers
    #[default]
    P2P,
    /// Traffic is relayed through gateway nodes
    Gateway,
}

/// Address families a cluster participates in
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    #[default]
    All,
    Ipv4,
    Ipv6,
}

impl IpFamily {
    /// Whether this setting allows the given concrete family
    pub fn allows(self, family: Family) -> bool {
        match self {
            IpFamily::All => true,
            IpFamily::Ipv4 => family == Family::V4,
            IpFamily::Ipv6 => family == Family::V6,
        }
    }
}

/// A concrete address family
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "ipv4"),
            Family::V6 => write!(f, "ipv6"),
        }
    }
}

/// An IPv4 and an IPv6 CIDR
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CidrPair {
    pub ip: String,
    pub ip6: String,
}

impl CidrPair {
    pub fn get(&self, family: Family) -> &str {
        match family {
            Family::V4 => &self.ip,
            Family::V6 => &self.ip6,
        }
    }
}

/// Interface override for a set of nodes
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NicNodeNames {
    pub interface_name: String,
    #[serde(rename = "nodeName")]
    pub node_names: Vec<String>,
}

/// Status of a Cluster
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterStatus {
    /// Pod CIDRs discovered for the whole cluster
    #[serde(default, rename = "podCIDRs")]
    pub pod_cidrs: Vec<String>,

    /// Service CIDRs discovered for the cluster
    #[serde(default, rename = "serviceCIDRs")]
    pub service_cidrs: Vec<String>,

    /// Tunnel address allocation owned by the network manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<ClusterAllocation>,

    /// Conditions describing the last compile pass for this cluster
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
}

/// Persisted allocation record of one cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAllocation {
    /// Block carved from the local pool (static mode)
    #[serde(default, skip_serializing_if = "AddressPair::is_empty")]
    pub local: AddressPair,

    /// Block carved from the bridge pool (static mode)
    #[serde(default, skip_serializing_if = "AddressPair::is_empty")]
    pub bridge: AddressPair,

    /// Per-node tunnel addresses, keyed by node name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, NodeAllocation>,
}

/// Optional IPv4 and IPv6 value of a block or address
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AddressPair {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6: Option<String>,
}

impl AddressPair {
    pub fn is_empty(&self) -> bool {
        self.ip.is_none() && self.ip6.is_none()
    }

    pub fn get(&self, family: Family) -> Option<&str> {
        match family {
            Family::V4 => self.ip.as_deref(),
            Family::V6 => self.ip6.as_deref(),
        }
    }

    pub fn set(&mut self, family: Family, value: Option<String>) {
        match family {
            Family::V4 => self.ip = value,
            Family::V6 => self.ip6 = value,
        }
    }
}

/// Tunnel addresses held by one node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NodeAllocation {
    #[serde(default, skip_serializing_if = "AddressPair::is_empty")]
    pub local: AddressPair,
    #[serde(default, skip_serializing_if = "AddressPair::is_empty")]
    pub bridge: AddressPair,
}

/// Condition for Cluster status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Ready, TopologyConflict or AllocationFailed
    #[serde(rename = "type")]
    pub condition_type: String,

    /// "True", "False", "Unknown"
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            network_type: NetworkType::default(),
            ip_family: IpFamily::default(),
            local_cidrs: default_local_cidrs(),
            bridge_cidrs: default_bridge_cidrs(),
            default_nic_name: default_nic_name(),
            nic_node_names: Vec::new(),
            global_cidrs_map: BTreeMap::new(),
            namespace: default_namespace(),
            cni: default_cni(),
            use_ip_pool: false,
        }
    }
}

impl Cluster {
    /// Cluster name, empty when the object has no metadata name
    pub fn cluster_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Interface configured for a node through the cluster spec
    pub fn interface_for(&self, node_name: &str) -> Option<&str> {
        self.spec
            .nic_node_names
            .iter()
            .find(|nic| nic.node_names.iter().any(|n| n == node_name))
            .map(|nic| nic.interface_name.as_str())
            .or_else(|| match self.spec.default_nic_name.as_str() {
                "" | "*" => None,
                nic => Some(nic),
            })
    }
}

// Default values
fn default_local_cidrs() -> CidrPair {
    CidrPair {
        ip: "210.0.0.0/8".to_string(),
        ip6: "9480::/16".to_string(),
    }
}

fn default_bridge_cidrs() -> CidrPair {
    CidrPair {
        ip: "220.0.0.0/8".to_string(),
        ip6: "9470::/16".to_string(),
    }
}

fn default_nic_name() -> String {
    "*".to_string()
}

fn default_namespace() -> String {
    "clusterlink-system".to_string()
}

fn default_cni() -> String {
    "calico".to_string()
}
