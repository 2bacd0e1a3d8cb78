use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Family, ROLE_GATEWAY};

/// ClusterNode is one node of a member cluster, as reported by inventory sync
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kosmos.io",
    version = "v1alpha1",
    kind = "ClusterNode",
    plural = "clusternodes",
    derive = "Default",
    derive = "PartialEq",
    status = "ClusterNodeStatus",
    printcolumn = r#"{"name":"ROLES","type":"string","jsonPath":".spec.roles"}"#,
    printcolumn = r#"{"name":"INTERFACE","type":"string","jsonPath":".spec.interfaceName"}"#,
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".spec.ip"}"#,
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNodeSpec {
    /// Name of the owning Cluster
    pub cluster_name: String,

    /// Kubernetes node name inside the owning cluster
    pub node_name: String,

    /// Roles such as control-plane, worker or gateway
    #[serde(default)]
    pub roles: Vec<String>,

    /// Underlay interface the tunnels bind to
    #[serde(default)]
    pub interface_name: String,

    /// Underlay IPv4 address
    #[serde(default)]
    pub ip: String,

    /// Underlay IPv6 address
    #[serde(default)]
    pub ip6: String,

    /// Pod CIDRs served by this node
    #[serde(default, rename = "podCIDRs")]
    pub pod_cidrs: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterNodeStatus {}

impl ClusterNodeSpec {
    pub fn is_gateway(&self) -> bool {
        self.roles.iter().any(|r| r == ROLE_GATEWAY)
    }

    /// Underlay address of the given family, if reported
    pub fn address(&self, family: Family) -> Option<&str> {
        let ip = match family {
            Family::V4 => &self.ip,
            Family::V6 => &self.ip6,
        };
        (!ip.is_empty()).then_some(ip.as_str())
    }
}

impl ClusterNode {
    /// Key of the NodeConfig published for this node
    pub fn node_key(&self) -> String {
        match self.metadata.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}-{}", self.spec.cluster_name, self.spec.node_name),
        }
    }
}
