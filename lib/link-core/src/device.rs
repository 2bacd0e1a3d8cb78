//! Tunnel device naming, identifiers and MAC derivation

use crate::{CoreError, Result};
use link_api::v1alpha1::{Device, Family};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub const DEVICE_TYPE_VXLAN: &str = "vxlan";

pub const BRIDGE_DEVICE: &str = "vx-bridge";
pub const BRIDGE_DEVICE6: &str = "vx-bridge6";
pub const LOCAL_DEVICE: &str = "vx-local";
pub const LOCAL_DEVICE6: &str = "vx-local6";

const BRIDGE_VNI: i32 = 54;
const BRIDGE_VNI6: i32 = 64;
const LOCAL_VNI: i32 = 55;
const LOCAL_VNI6: i32 = 65;

const BRIDGE_PORT: i32 = 4877;
const BRIDGE_PORT6: i32 = 4866;
const LOCAL_PORT: i32 = 4878;
const LOCAL_PORT6: i32 = 4867;

/// First VNI handed to per-cluster bridge devices, above the well-known ones
const PAIR_VNI_BASE: u32 = 1_000;
const PAIR_VNI_SPAN: u32 = 16_000_000;

/// How inter-cluster tunnels are laid out on a node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceMode {
    /// One bridge device per remote cluster
    #[default]
    PerCluster,
    /// One multiplexed bridge device per family
    Shared,
}

impl FromStr for DeviceMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "per-cluster" => Ok(DeviceMode::PerCluster),
            "shared" => Ok(DeviceMode::Shared),
            other => Err(CoreError::InvalidConfiguration(format!("unknown device mode {:?}", other))),
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMode::PerCluster => write!(f, "per-cluster"),
            DeviceMode::Shared => write!(f, "shared"),
        }
    }
}

/// Name and VNI of the bridge device a node of `local` uses towards `remote`.
///
/// Both ends of a cluster pair derive the same values.
pub fn bridge_device(mode: DeviceMode, local: &str, remote: &str, family: Family) -> (String, i32) {
    match mode {
        DeviceMode::Shared => match family {
            Family::V4 => (BRIDGE_DEVICE.to_string(), BRIDGE_VNI),
            Family::V6 => (BRIDGE_DEVICE6.to_string(), BRIDGE_VNI6),
        },
        DeviceMode::PerCluster => {
            let (first, second) = if local <= remote { (local, remote) } else { (remote, local) };
            let pair = Sha256::digest(format!("{}|{}", first, second).as_bytes());
            let prefix = match family {
                Family::V4 => "vxb",
                Family::V6 => "vxb6",
            };
            let name = format!("{}-{}", prefix, hex::encode(&pair[..4]));

            let vni = Sha256::digest(format!("{}|{}|{}", first, second, family).as_bytes());
            let raw = u32::from_be_bytes([vni[0], vni[1], vni[2], vni[3]]);
            (name, (PAIR_VNI_BASE + raw % PAIR_VNI_SPAN) as i32)
        }
    }
}

pub fn local_device(family: Family) -> (&'static str, i32) {
    match family {
        Family::V4 => (LOCAL_DEVICE, LOCAL_VNI),
        Family::V6 => (LOCAL_DEVICE6, LOCAL_VNI6),
    }
}

fn port(device: &str, family: Family) -> i32 {
    let local = device == LOCAL_DEVICE || device == LOCAL_DEVICE6;
    match (local, family) {
        (true, Family::V4) => LOCAL_PORT,
        (true, Family::V6) => LOCAL_PORT6,
        (false, Family::V4) => BRIDGE_PORT,
        (false, Family::V6) => BRIDGE_PORT6,
    }
}

/// Locally administered unicast MAC of one node's device
pub fn device_mac(cluster: &str, node: &str, device: &str) -> String {
    let digest = Sha256::digest(format!("{}/{}/{}", cluster, node, device).as_bytes());
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&digest[..6]);
    mac[0] = (mac[0] & 0xfe) | 0x02;
    mac.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":")
}

/// Descriptor of a VXLAN device owned by `node` of `cluster`
pub fn vxlan(cluster: &str, node: &str, name: &str, vni: i32, family: Family, bind_dev: &str, addr: String) -> Device {
    Device {
        name: name.to_string(),
        id: vni,
        mac: device_mac(cluster, node, name),
        bind_dev: bind_dev.to_string(),
        addr,
        port: port(name, family),
        device_type: DEVICE_TYPE_VXLAN.to_string(),
    }
}
