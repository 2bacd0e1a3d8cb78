use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// NodeConfig is the desired network state of exactly one node.
///
/// The network manager is the only writer of `spec`; the node agent only
/// writes `status.lastSyncTime`.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kosmos.io",
    version = "v1alpha1",
    kind = "NodeConfig",
    plural = "nodeconfigs",
    derive = "Default",
    derive = "PartialEq",
    status = "NodeConfigStatus",
)]
pub struct NodeConfigSpec {
    #[serde(default)]
    pub devices: Vec<Device>,

    #[serde(default)]
    pub routes: Vec<Route>,

    #[serde(default)]
    pub fdbs: Vec<Fdb>,

    #[serde(default)]
    pub arps: Vec<Arp>,

    #[serde(default)]
    pub iptables: Vec<Iptables>,
}

/// Tunnel interface descriptor
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Interface name, e.g. "vx-bridge"
    pub name: String,

    /// VXLAN network identifier
    pub id: i32,

    /// Device MAC address
    pub mac: String,

    /// Underlay interface the device binds to
    pub bind_dev: String,

    /// Overlay address with prefix length
    pub addr: String,

    /// UDP port
    pub port: i32,

    /// Device type, e.g. "vxlan"
    #[serde(rename = "type")]
    pub device_type: String,
}

/// Static route
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct Route {
    /// Destination CIDR
    pub cidr: String,
    pub dev: String,
    /// Next hop address
    pub gw: String,
}

/// Forwarding database entry binding a remote tunnel MAC to its underlay IP
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct Fdb {
    pub dev: String,
    pub ip: String,
    pub mac: String,
}

/// Static neighbor entry
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct Arp {
    pub dev: String,
    pub ip: String,
    pub mac: String,
}

/// Firewall rule
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct Iptables {
    pub table: String,
    pub chain: String,
    pub rule: String,
}

/// Status of a NodeConfig
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigStatus {
    /// Last time the desired spec changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change_time: Option<DateTime<Utc>>,

    /// Last time the node agent confirmed application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl NodeConfigSpec {
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
            && self.routes.is_empty()
            && self.fdbs.is_empty()
            && self.arps.is_empty()
            && self.iptables.is_empty()
    }
}
