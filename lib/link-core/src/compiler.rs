//! Topology compiler
//!
//! Turns the Cluster and ClusterNode inventory into one desired NodeConfig per
//! node. Compilation is a pure function of the inventory and the previous
//! allocation table: identical input yields byte-identical output.
//!
//! Clusters failing allocation or CIDR conflict checks are quarantined. They
//! receive no NodeConfigs, their stored ones are left alone, and no other
//! cluster peers with them.

use crate::allocator::{AllocationTable, Allocator, AllocatorConfig, PoolKind, TunnelAddresses};
use crate::device::{self, DeviceMode};
use crate::net;
use crate::CoreError;
use ipnetwork::IpNetwork;
use link_api::v1alpha1::{Arp, Cluster, ClusterNode, Device, Family, Fdb, Iptables, NetworkType, NodeConfigSpec, Route};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tracing::{debug, warn};

/// Compiler options
#[derive(Clone, Debug, Default)]
pub struct CompilerConfig {
    pub device_mode: DeviceMode,
    pub allocator: AllocatorConfig,
}

/// Desired NodeConfig of one node together with its owning cluster
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredConfig {
    pub cluster: String,
    pub spec: NodeConfigSpec,
}

/// Output of one compile pass
#[derive(Debug, Default)]
pub struct Compilation {
    /// Desired config per NodeKey
    pub configs: BTreeMap<String, DesiredConfig>,
    /// Allocation state after this pass
    pub allocations: AllocationTable,
    /// Quarantined clusters and the reason
    pub failures: BTreeMap<String, CoreError>,
    /// NodeKeys whose stored NodeConfig must be left untouched
    pub frozen: BTreeSet<String>,
}

impl Compilation {
    /// Whether any cluster had its address space moved or released this pass
    pub fn reallocated(&self) -> bool {
        !self.allocations.reallocated().is_empty()
    }
}

/// A routed CIDR and the index of the member that serves it
#[derive(Clone, Debug)]
struct Claim {
    cidr: IpNetwork,
    peer: usize,
}

/// A schedulable node as seen by the compiler
struct Member<'a> {
    key: String,
    name: &'a str,
    interface: String,
    gateway_role: bool,
    elected: bool,
    underlay: BTreeMap<Family, IpAddr>,
    tunnel: TunnelAddresses,
    pod_cidrs: Vec<IpNetwork>,
}

impl Member<'_> {
    /// Underlay and overlay address of this member in one pool and family
    fn reachable(&self, kind: PoolKind, family: Family) -> Option<(IpAddr, IpAddr)> {
        let underlay = self.underlay.get(&family).copied()?;
        let overlay = self.tunnel.get(kind, family)?.ip();
        Some((underlay, overlay))
    }
}

struct View<'a> {
    cluster: &'a Cluster,
    members: Vec<Member<'a>>,
    claims: Vec<Claim>,
    primary: Option<usize>,
}

impl View<'_> {
    fn name(&self) -> &str {
        self.cluster.cluster_name()
    }

    fn allows(&self, family: Family) -> bool {
        self.cluster.spec.ip_family.allows(family)
    }

    fn relayed(&self) -> bool {
        self.cluster.spec.network_type == NetworkType::Gateway
    }

    fn claims_of(&self, family: Family) -> impl Iterator<Item = &Claim> + '_ {
        self.claims.iter().filter(move |c| net::family_of(&c.cidr) == family)
    }
}

/// Accumulates the entries of one node's config
#[derive(Default)]
struct Builder {
    devices: Vec<Device>,
    routes: Vec<Route>,
    fdbs: Vec<Fdb>,
    arps: Vec<Arp>,
    iptables: Vec<Iptables>,
}

impl Builder {
    fn tunnel_peer(&mut self, dev: &str, underlay: IpAddr, overlay: IpAddr, mac: String) {
        self.fdbs.push(Fdb {
            dev: dev.to_string(),
            ip: underlay.to_string(),
            mac: mac.clone(),
        });
        self.arps.push(Arp {
            dev: dev.to_string(),
            ip: overlay.to_string(),
            mac,
        });
    }

    fn route(&mut self, cidr: &IpNetwork, dev: &str, gw: IpAddr) {
        self.routes.push(Route {
            cidr: cidr.to_string(),
            dev: dev.to_string(),
            gw: gw.to_string(),
        });
    }

    /// Exempt cross-cluster traffic from source NAT
    fn keep_source(&mut self, cidr: &IpNetwork) {
        self.iptables.push(Iptables {
            table: "nat".to_string(),
            chain: "POSTROUTING".to_string(),
            rule: format!("-d {} -j RETURN", cidr),
        });
    }

    fn finish(mut self) -> NodeConfigSpec {
        self.devices.sort();
        self.devices.dedup();
        self.routes.sort();
        self.routes.dedup_by(|a, b| a.cidr == b.cidr);
        self.fdbs.sort();
        self.fdbs.dedup();
        self.arps.sort();
        self.arps.dedup();
        self.iptables.sort();
        self.iptables.dedup();
        NodeConfigSpec {
            devices: self.devices,
            routes: self.routes,
            fdbs: self.fdbs,
            arps: self.arps,
            iptables: self.iptables,
        }
    }
}

/// Node ready to be compiled
struct Candidate<'a> {
    node: &'a ClusterNode,
    interface: String,
    underlay: BTreeMap<Family, IpAddr>,
}

#[derive(Clone, Debug, Default)]
pub struct Compiler {
    config: CompilerConfig,
    allocator: Allocator,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self {
            allocator: Allocator::new(config.allocator.clone()),
            config,
        }
    }

    /// Compile the whole inventory
    pub fn compile(&self, previous: &AllocationTable, clusters: &[Cluster], nodes: &[ClusterNode]) -> Compilation {
        let mut table = previous.clone();
        let by_name: BTreeMap<&str, &Cluster> = clusters
            .iter()
            .filter(|c| !c.cluster_name().is_empty())
            .map(|c| (c.cluster_name(), c))
            .collect();

        let mut frozen = BTreeSet::new();
        let mut candidates: BTreeMap<String, Candidate> = BTreeMap::new();
        for node in nodes {
            let key = node.node_key();
            let Some(cluster) = by_name.get(node.spec.cluster_name.as_str()) else {
                debug!("Node {} belongs to unknown cluster {}", key, node.spec.cluster_name);
                continue;
            };
            match schedule(cluster, node) {
                Some(candidate) => {
                    candidates.entry(key).or_insert(candidate);
                }
                None => {
                    warn!("Skipping unschedulable node {}: no interface or address", key);
                    frozen.insert(key);
                }
            }
        }

        let cluster_refs: Vec<&Cluster> = by_name.values().copied().collect();
        let node_refs: Vec<&ClusterNode> = candidates.values().map(|c| c.node).collect();
        let assignment = self.allocator.assign(&mut table, &cluster_refs, &node_refs);
        let mut addresses = assignment.addresses;
        let mut failures = assignment.failures;
        failures.retain(|name, _| by_name.contains_key(name.as_str()));

        let mut grouped: BTreeMap<String, Vec<(String, Candidate)>> = BTreeMap::new();
        for (key, candidate) in candidates {
            grouped
                .entry(candidate.node.spec.cluster_name.clone())
                .or_default()
                .push((key, candidate));
        }

        let mut views: BTreeMap<&str, View> = BTreeMap::new();
        for cluster in by_name.values() {
            let name = cluster.cluster_name();
            let members = grouped.remove(name).unwrap_or_default();
            views.insert(name, build_view(cluster, members, &mut addresses));
        }

        detect_conflicts(&views, &mut failures);

        for (name, view) in &views {
            if failures.contains_key(*name) {
                frozen.extend(view.members.iter().map(|m| m.key.clone()));
            }
        }

        let active: Vec<&View> = views
            .values()
            .filter(|v| !failures.contains_key(v.name()))
            .collect();

        let mut configs = BTreeMap::new();
        for local in &active {
            for index in 0..local.members.len() {
                let spec = self.emit(&active, local, index);
                debug!(
                    "Compiled node {}: {} devices, {} routes",
                    local.members[index].key,
                    spec.devices.len(),
                    spec.routes.len()
                );
                configs.insert(
                    local.members[index].key.clone(),
                    DesiredConfig {
                        cluster: local.name().to_string(),
                        spec,
                    },
                );
            }
        }

        Compilation {
            configs,
            allocations: table,
            failures,
            frozen,
        }
    }

    fn emit(&self, active: &[&View], local: &View, index: usize) -> NodeConfigSpec {
        let me = &local.members[index];
        let remotes: Vec<&View> = active.iter().copied().filter(|v| v.name() != local.name()).collect();
        let mut out = Builder::default();

        if !local.relayed() || me.elected {
            for remote in &remotes {
                for family in Family::ALL {
                    self.mesh(&mut out, local, me, remote, family);
                }
            }
        }
        if local.relayed() {
            for family in Family::ALL {
                relay(&mut out, local, index, &remotes, family);
            }
        }

        out.finish()
    }

    /// Direct bridge tunnels from `me` to the peers of one remote cluster
    fn mesh(&self, out: &mut Builder, local: &View, me: &Member, remote: &View, family: Family) {
        if !local.allows(family) || !remote.allows(family) {
            return;
        }
        let Some(addr) = me.tunnel.get(PoolKind::Bridge, family) else {
            return;
        };
        if !me.underlay.contains_key(&family) {
            return;
        }
        let (dev, vni) = device::bridge_device(self.config.device_mode, local.name(), remote.name(), family);

        let mut peers = BTreeSet::new();
        for claim in remote.claims_of(family) {
            let peer = if remote.relayed() {
                match remote.primary {
                    Some(primary) => primary,
                    None => continue,
                }
            } else {
                claim.peer
            };
            let Some((_, overlay)) = remote.members[peer].reachable(PoolKind::Bridge, family) else {
                continue;
            };
            out.route(&claim.cidr, &dev, overlay);
            out.keep_source(&claim.cidr);
            peers.insert(peer);
        }
        if peers.is_empty() {
            return;
        }

        out.devices
            .push(device::vxlan(local.name(), me.name, &dev, vni, family, &me.interface, addr.to_string()));
        for peer in peers {
            let member = &remote.members[peer];
            if let Some((underlay, overlay)) = member.reachable(PoolKind::Bridge, family) {
                out.tunnel_peer(&dev, underlay, overlay, device::device_mac(remote.name(), member.name, &dev));
            }
        }
    }
}

/// Intra-cluster tunnels of a gateway-model cluster
fn relay(out: &mut Builder, local: &View, index: usize, remotes: &[&View], family: Family) {
    if !local.allows(family) {
        return;
    }
    let Some(primary) = local.primary else {
        return;
    };
    let me = &local.members[index];
    let Some(addr) = me.tunnel.get(PoolKind::Local, family) else {
        return;
    };
    if !me.underlay.contains_key(&family) {
        return;
    }
    let (dev, vni) = device::local_device(family);

    if index == primary {
        let mut served = false;
        for member in local.members.iter().filter(|m| m.key != me.key) {
            if let Some((underlay, overlay)) = member.reachable(PoolKind::Local, family) {
                out.tunnel_peer(dev, underlay, overlay, device::device_mac(local.name(), member.name, dev));
                served = true;
            }
        }
        for claim in local.claims_of(family).filter(|c| c.peer != index) {
            if let Some((_, overlay)) = local.members[claim.peer].reachable(PoolKind::Local, family) {
                out.route(&claim.cidr, dev, overlay);
            }
        }
        if served {
            out.devices
                .push(device::vxlan(local.name(), me.name, dev, vni, family, &me.interface, addr.to_string()));
            out.iptables.push(Iptables {
                table: "filter".to_string(),
                chain: "FORWARD".to_string(),
                rule: format!("-i {} -j ACCEPT", dev),
            });
        }
        return;
    }

    let gateway = &local.members[primary];
    let Some((underlay, overlay)) = gateway.reachable(PoolKind::Local, family) else {
        return;
    };
    out.devices
        .push(device::vxlan(local.name(), me.name, dev, vni, family, &me.interface, addr.to_string()));
    out.tunnel_peer(dev, underlay, overlay, device::device_mac(local.name(), gateway.name, dev));
    if me.elected {
        return;
    }

    let remote_cidrs: Vec<IpNetwork> = remotes
        .iter()
        .filter(|r| r.allows(family))
        .flat_map(|r| r.claims_of(family).map(|c| c.cidr))
        .collect();
    if let Some(cover) = net::supernet(&remote_cidrs) {
        out.route(&cover, dev, overlay);
        for cidr in &remote_cidrs {
            out.keep_source(cidr);
        }
    }
}

/// Resolve interface and underlay addresses, or None when the node cannot carry tunnels
fn schedule<'a>(cluster: &Cluster, node: &'a ClusterNode) -> Option<Candidate<'a>> {
    let interface = if node.spec.interface_name.is_empty() {
        cluster.interface_for(&node.spec.node_name)?.to_string()
    } else {
        node.spec.interface_name.clone()
    };

    let mut underlay = BTreeMap::new();
    for family in Family::ALL {
        if !cluster.spec.ip_family.allows(family) {
            continue;
        }
        let Some(raw) = node.spec.address(family) else {
            continue;
        };
        match net::parse_addr(raw) {
            Ok(ip) if ip.is_ipv4() == (family == Family::V4) => {
                underlay.insert(family, ip);
            }
            _ => warn!("Node {} reports invalid {} address {:?}", node.node_key(), family, raw),
        }
    }

    if underlay.is_empty() {
        return None;
    }
    Some(Candidate { node, interface, underlay })
}

fn build_view<'a>(
    cluster: &'a Cluster,
    candidates: Vec<(String, Candidate<'a>)>,
    addresses: &mut BTreeMap<String, TunnelAddresses>,
) -> View<'a> {
    let mut members: Vec<Member<'a>> = candidates
        .into_iter()
        .map(|(key, c)| Member {
            tunnel: addresses.remove(&key).unwrap_or_default(),
            pod_cidrs: c
                .node
                .spec
                .pod_cidrs
                .iter()
                .filter_map(|cidr| match net::parse_cidr(cidr) {
                    Ok(parsed) => Some(parsed),
                    Err(e) => {
                        warn!("Ignoring pod CIDR of node {}: {}", key, e);
                        None
                    }
                })
                .collect(),
            name: c.node.spec.node_name.as_str(),
            gateway_role: c.node.spec.is_gateway(),
            elected: false,
            interface: c.interface,
            underlay: c.underlay,
            key,
        })
        .collect();
    members.sort_by(|a, b| a.name.cmp(b.name).then_with(|| a.key.cmp(&b.key)));

    // Gateway role first, else the lowest node name
    let primary = members
        .iter()
        .position(|m| m.gateway_role)
        .or_else(|| (!members.is_empty()).then_some(0));
    if cluster.spec.network_type == NetworkType::Gateway {
        let any_role = members.iter().any(|m| m.gateway_role);
        for (i, member) in members.iter_mut().enumerate() {
            member.elected = if any_role { member.gateway_role } else { Some(i) == primary };
        }
    }

    let mut raw: Vec<(IpNetwork, bool, usize)> = Vec::new();
    for (i, member) in members.iter().enumerate() {
        raw.extend(member.pod_cidrs.iter().map(|cidr| (*cidr, false, i)));
    }
    if let (Some(p), Some(status)) = (primary, cluster.status.as_ref()) {
        for cidr in status.pod_cidrs.iter().chain(&status.service_cidrs) {
            match net::parse_cidr(cidr) {
                Ok(parsed) => raw.push((parsed, true, p)),
                Err(e) => warn!("Ignoring CIDR of cluster {}: {}", cluster.cluster_name(), e),
            }
        }
    }

    // Duplicate claims go to the node-level claim, then the gateway role, then the lowest name
    raw.sort_by_key(|(cidr, cluster_level, i)| {
        let (start, _) = net::bounds(cidr);
        (
            net::family_of(cidr),
            start,
            cidr.prefix(),
            *cluster_level,
            !members[*i].gateway_role,
            *i,
        )
    });
    let mut claims: Vec<Claim> = Vec::new();
    for (cidr, _, peer) in raw {
        if claims.last().map(|c| c.cidr) != Some(cidr) {
            claims.push(Claim { cidr, peer });
        }
    }

    View {
        cluster,
        members,
        claims,
        primary,
    }
}

/// Quarantine every pair of clusters routing overlapping CIDRs
fn detect_conflicts(views: &BTreeMap<&str, View>, failures: &mut BTreeMap<String, CoreError>) {
    let ordered: Vec<&View> = views.values().collect();
    for (i, a) in ordered.iter().enumerate() {
        for b in &ordered[i + 1..] {
            let Some((ca, cb)) = first_overlap(&a.claims, &b.claims) else {
                continue;
            };
            warn!(
                "Pod CIDR {} of cluster {} overlaps {} of cluster {}",
                ca,
                a.name(),
                cb,
                b.name()
            );
            failures
                .entry(a.name().to_string())
                .or_insert_with(|| CoreError::TopologyConflict {
                    cluster: a.name().to_string(),
                    cidr: ca.to_string(),
                    other: b.name().to_string(),
                    other_cidr: cb.to_string(),
                });
            failures
                .entry(b.name().to_string())
                .or_insert_with(|| CoreError::TopologyConflict {
                    cluster: b.name().to_string(),
                    cidr: cb.to_string(),
                    other: a.name().to_string(),
                    other_cidr: ca.to_string(),
                });
        }
    }
}

fn first_overlap(a: &[Claim], b: &[Claim]) -> Option<(IpNetwork, IpNetwork)> {
    a.iter()
        .flat_map(|x| b.iter().map(move |y| (x.cidr, y.cidr)))
        .find(|(x, y)| net::overlaps(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{cluster, dual_stack, gateway, ipv4_cluster, node};
    use link_api::v1alpha1::ClusterStatus;

    fn compile(clusters: &[Cluster], nodes: &[ClusterNode]) -> Compilation {
        Compiler::default().compile(&AllocationTable::default(), clusters, nodes)
    }

    fn gw_of(spec: &NodeConfigSpec, cidr: &str) -> String {
        spec.routes
            .iter()
            .find(|r| r.cidr == cidr)
            .map(|r| r.gw.clone())
            .unwrap_or_default()
    }

    fn assert_no_dangling(key: &str, spec: &NodeConfigSpec) {
        let devices: BTreeSet<&str> = spec.devices.iter().map(|d| d.name.as_str()).collect();
        for route in &spec.routes {
            assert!(devices.contains(route.dev.as_str()), "{}: route {:?} has no device", key, route);
            assert!(
                spec.arps.iter().any(|a| a.dev == route.dev && a.ip == route.gw),
                "{}: gateway of {:?} has no neighbor entry",
                key,
                route
            );
        }
        for fdb in &spec.fdbs {
            assert!(devices.contains(fdb.dev.as_str()), "{}: fdb {:?} has no device", key, fdb);
        }
        for arp in &spec.arps {
            assert!(devices.contains(arp.dev.as_str()), "{}: arp {:?} has no device", key, arp);
        }
        let cidrs: BTreeSet<&str> = spec.routes.iter().map(|r| r.cidr.as_str()).collect();
        assert_eq!(cidrs.len(), spec.routes.len(), "{}: duplicate route destination", key);
    }

    #[test]
    fn test_two_cluster_p2p_scenario() {
        let clusters = vec![
            ipv4_cluster("a", NetworkType::P2P),
            ipv4_cluster("b", NetworkType::P2P),
        ];
        let nodes = vec![
            node("a", "a1", "192.168.0.1", &["10.1.0.0/16"]),
            node("b", "b1", "192.168.0.2", &["10.2.0.0/16"]),
        ];
        let out = compile(&clusters, &nodes);
        assert!(out.failures.is_empty());
        assert_eq!(out.configs.len(), 2);

        let a1 = &out.configs["a-a1"].spec;
        let b1 = &out.configs["b-b1"].spec;
        for (spec, remote, remote_cidr, remote_ip) in [
            (a1, b1, "10.2.0.0/16", "192.168.0.2"),
            (b1, a1, "10.1.0.0/16", "192.168.0.1"),
        ] {
            assert_eq!(spec.devices.len(), 1);
            assert_eq!(spec.routes.len(), 1);
            assert_eq!(spec.fdbs.len(), 1);
            assert_eq!(spec.arps.len(), 1);

            let device = &spec.devices[0];
            assert_eq!(device.device_type, "vxlan");
            assert_eq!(device.bind_dev, "eth0");
            assert_eq!(spec.routes[0].cidr, remote_cidr);
            assert_eq!(spec.routes[0].dev, device.name);

            let remote_device = &remote.devices[0];
            assert_eq!(device.name, remote_device.name);
            assert_eq!(device.id, remote_device.id);
            assert_eq!(spec.fdbs[0].ip, remote_ip);
            assert_eq!(spec.fdbs[0].mac, remote_device.mac);
            assert_eq!(spec.arps[0].mac, remote_device.mac);
            assert_eq!(Some(spec.routes[0].gw.as_str()), remote_device.addr.split('/').next());
            assert_eq!(
                spec.iptables,
                vec![Iptables {
                    table: "nat".to_string(),
                    chain: "POSTROUTING".to_string(),
                    rule: format!("-d {} -j RETURN", remote_cidr),
                }]
            );
        }
        assert_eq!(out.configs["a-a1"].cluster, "a");
    }

    #[test]
    fn test_compile_is_deterministic() {
        let clusters = vec![cluster("a"), cluster("b"), cluster("c")];
        let nodes = vec![
            dual_stack("a", "a1", "192.168.0.1", "fd00::1", &["10.1.0.0/24", "fd01::/64"]),
            node("a", "a2", "192.168.0.2", &["10.1.1.0/24"]),
            dual_stack("b", "b1", "192.168.1.1", "fd00::11", &["10.2.0.0/24", "fd02::/64"]),
            gateway("c", "c1", "192.168.2.1", &["10.3.0.0/24"]),
        ];
        let first = compile(&clusters, &nodes);

        let mut reversed = nodes.clone();
        reversed.reverse();
        let mut clusters_reversed = clusters.clone();
        clusters_reversed.reverse();
        let second = compile(&clusters_reversed, &reversed);

        assert_eq!(first.configs, second.configs);
        for (key, desired) in &first.configs {
            assert_eq!(
                serde_json::to_vec(&desired.spec).unwrap(),
                serde_json::to_vec(&second.configs[key].spec).unwrap()
            );
        }

        let again = Compiler::default().compile(&first.allocations, &clusters, &nodes);
        assert_eq!(again.configs, first.configs);
        assert!(!again.reallocated());
    }

    #[test]
    fn test_gateway_model_reduces_member_routes() {
        let clusters = vec![
            ipv4_cluster("a", NetworkType::Gateway),
            ipv4_cluster("b", NetworkType::P2P),
        ];
        let nodes = vec![
            gateway("a", "g1", "192.168.0.1", &["10.1.1.0/24"]),
            node("a", "m1", "192.168.0.2", &["10.1.2.0/24"]),
            node("a", "m2", "192.168.0.3", &["10.1.3.0/24"]),
            node("b", "b1", "192.168.1.1", &["10.2.0.0/16"]),
            node("b", "b2", "192.168.1.2", &["10.3.0.0/16"]),
        ];
        let out = compile(&clusters, &nodes);
        assert!(out.failures.is_empty());

        let g1 = &out.configs["a-g1"].spec;
        let m1 = &out.configs["a-m1"].spec;
        let b1 = &out.configs["b-b1"].spec;

        for key in ["a-m1", "a-m2"] {
            let member = &out.configs[key].spec;
            assert_eq!(member.routes.len(), 1);
            assert_eq!(member.routes[0].cidr, "10.2.0.0/15");
            assert_eq!(member.routes[0].dev, "vx-local");
            assert_eq!(member.devices.len(), 1);
            assert_eq!(member.fdbs.len(), 1);
            assert_eq!(member.fdbs[0].ip, "192.168.0.1");
        }

        // The gateway meshes with remote peers and relays for its members
        assert_eq!(g1.routes.len(), 4);
        assert!(g1.devices.iter().any(|d| d.name == "vx-local"));
        assert!(g1.devices.iter().any(|d| d.name.starts_with("vxb-")));
        assert!(g1
            .iptables
            .iter()
            .any(|r| r.table == "filter" && r.rule == "-i vx-local -j ACCEPT"));
        let m1_local = m1.devices[0].addr.split('/').next().unwrap_or_default().to_string();
        assert_eq!(gw_of(g1, "10.1.2.0/24"), m1_local);

        // Remote peers reach every CIDR of the gateway cluster through the gateway
        let g1_bridge = g1
            .devices
            .iter()
            .find(|d| d.name.starts_with("vxb-"))
            .and_then(|d| d.addr.split('/').next())
            .unwrap_or_default()
            .to_string();
        for cidr in ["10.1.1.0/24", "10.1.2.0/24", "10.1.3.0/24"] {
            assert_eq!(gw_of(b1, cidr), g1_bridge);
        }
        assert_eq!(b1.fdbs.len(), 1);

        for (key, desired) in &out.configs {
            assert_no_dangling(key, &desired.spec);
        }
    }

    #[test]
    fn test_gateway_election_without_gateway_role() {
        let clusters = vec![
            ipv4_cluster("a", NetworkType::Gateway),
            ipv4_cluster("b", NetworkType::P2P),
        ];
        let nodes = vec![
            node("a", "n2", "192.168.0.2", &["10.1.2.0/24"]),
            node("a", "n1", "192.168.0.1", &["10.1.1.0/24"]),
            node("b", "b1", "192.168.1.1", &["10.2.0.0/16"]),
        ];
        let out = compile(&clusters, &nodes);
        let n1 = &out.configs["a-n1"].spec;
        let n2 = &out.configs["a-n2"].spec;
        assert!(n1.devices.iter().any(|d| d.name.starts_with("vxb-")));
        assert_eq!(n2.routes.len(), 1);
        assert_eq!(n2.fdbs[0].ip, "192.168.0.1");
    }

    #[test]
    fn test_overlapping_pod_cidrs_quarantine_both_clusters() {
        let clusters = vec![
            ipv4_cluster("a", NetworkType::P2P),
            ipv4_cluster("b", NetworkType::P2P),
            ipv4_cluster("c", NetworkType::P2P),
        ];
        let nodes = vec![
            node("a", "a1", "192.168.0.1", &["10.1.0.0/16"]),
            node("b", "b1", "192.168.0.2", &["10.1.128.0/17"]),
            node("c", "c1", "192.168.0.3", &["10.3.0.0/16"]),
        ];
        let out = compile(&clusters, &nodes);

        for (name, other) in [("a", "b"), ("b", "a")] {
            match out.failures.get(name) {
                Some(CoreError::TopologyConflict { other: o, .. }) => assert_eq!(o, other),
                other => panic!("expected topology conflict, got {:?}", other),
            }
        }
        assert!(!out.configs.contains_key("a-a1"));
        assert!(!out.configs.contains_key("b-b1"));
        assert!(out.frozen.contains("a-a1"));
        assert!(out.frozen.contains("b-b1"));

        // The healthy cluster proceeds without peering the quarantined ones
        let c1 = &out.configs["c-c1"].spec;
        assert!(c1.is_empty());
    }

    #[test]
    fn test_status_cidrs_overlap_is_detected() {
        let mut a = ipv4_cluster("a", NetworkType::P2P);
        a.status = Some(ClusterStatus {
            service_cidrs: vec!["10.96.0.0/12".to_string()],
            ..Default::default()
        });
        let mut b = ipv4_cluster("b", NetworkType::P2P);
        b.status = a.status.clone();
        let nodes = vec![
            node("a", "a1", "192.168.0.1", &["10.1.0.0/16"]),
            node("b", "b1", "192.168.0.2", &["10.2.0.0/16"]),
        ];
        let out = compile(&[a, b], &nodes);
        assert_eq!(out.failures.len(), 2);
        assert!(out.configs.is_empty());
    }

    #[test]
    fn test_allocation_failure_is_isolated() {
        let a = ipv4_cluster("a", NetworkType::P2P);
        let mut b = ipv4_cluster("b", NetworkType::P2P);
        b.spec.bridge_cidrs.ip = "not-a-cidr".to_string();
        let nodes = vec![
            node("a", "a1", "192.168.0.1", &["10.1.0.0/16"]),
            node("b", "b1", "192.168.0.2", &["10.2.0.0/16"]),
        ];
        let out = compile(&[a, b], &nodes);
        assert!(matches!(
            out.failures.get("b"),
            Some(CoreError::InvalidConfiguration(_))
        ));
        assert!(out.configs["a-a1"].spec.routes.is_empty());
        assert!(out.frozen.contains("b-b1"));
    }

    #[test]
    fn test_unschedulable_node_is_skipped() {
        let clusters = vec![
            ipv4_cluster("a", NetworkType::P2P),
            ipv4_cluster("b", NetworkType::P2P),
        ];
        let mut pending = node("b", "b2", "192.168.0.3", &["10.3.0.0/16"]);
        pending.spec.interface_name = String::new();
        let nodes = vec![
            node("a", "a1", "192.168.0.1", &["10.1.0.0/16"]),
            node("b", "b1", "192.168.0.2", &["10.2.0.0/16"]),
            pending,
        ];
        let out = compile(&clusters, &nodes);
        assert!(out.frozen.contains("b-b2"));
        assert!(!out.configs.contains_key("b-b2"));
        let a1 = &out.configs["a-a1"].spec;
        assert!(a1.routes.iter().all(|r| r.cidr != "10.3.0.0/16"));
    }

    #[test]
    fn test_interface_from_cluster_default() {
        let mut b = ipv4_cluster("b", NetworkType::P2P);
        b.spec.default_nic_name = "bond0".to_string();
        let mut b1 = node("b", "b1", "192.168.0.2", &["10.2.0.0/16"]);
        b1.spec.interface_name = String::new();
        let nodes = vec![node("a", "a1", "192.168.0.1", &["10.1.0.0/16"]), b1];
        let out = compile(&[ipv4_cluster("a", NetworkType::P2P), b], &nodes);
        assert_eq!(out.configs["b-b1"].spec.devices[0].bind_dev, "bond0");
    }

    #[test]
    fn test_incremental_change_leaves_unaffected_nodes_identical() {
        let clusters = vec![
            ipv4_cluster("a", NetworkType::P2P),
            ipv4_cluster("b", NetworkType::P2P),
        ];
        let mut nodes = vec![
            node("a", "a1", "192.168.0.1", &["10.1.0.0/16"]),
            node("b", "b1", "192.168.0.2", &["10.2.0.0/16"]),
        ];
        let before = compile(&clusters, &nodes);

        nodes.push(node("b", "b2", "192.168.0.3", &["10.3.0.0/16"]));
        let after = Compiler::default().compile(&before.allocations, &clusters, &nodes);

        assert_eq!(
            serde_json::to_vec(&before.configs["b-b1"].spec).unwrap(),
            serde_json::to_vec(&after.configs["b-b1"].spec).unwrap()
        );
        assert_ne!(before.configs["a-a1"], after.configs["a-a1"]);
        assert_eq!(after.configs["a-a1"].spec.routes.len(), 2);

        // Removing the node drops it from every peer
        nodes.pop();
        let removed = Compiler::default().compile(&after.allocations, &clusters, &nodes);
        assert!(!removed.configs.contains_key("b-b2"));
        assert_eq!(removed.configs["a-a1"], before.configs["a-a1"]);
    }

    #[test]
    fn test_dual_stack_emits_both_families() {
        let clusters = vec![cluster("a"), cluster("b")];
        let nodes = vec![
            dual_stack("a", "a1", "192.168.0.1", "fd00::1", &["10.1.0.0/16", "fd01::/64"]),
            dual_stack("b", "b1", "192.168.0.2", "fd00::2", &["10.2.0.0/16", "fd02::/64"]),
        ];
        let out = compile(&clusters, &nodes);
        let a1 = &out.configs["a-a1"].spec;
        assert_eq!(a1.devices.len(), 2);
        assert!(a1.devices.iter().any(|d| d.name.starts_with("vxb6-") && d.addr.starts_with("9470:")));
        let v6 = a1.routes.iter().find(|r| r.cidr == "fd02::/64").unwrap();
        assert!(v6.gw.contains(':'));
        assert_eq!(a1.routes.len(), 2);
        assert_eq!(a1.fdbs.len(), 2);
        assert_no_dangling("a-a1", a1);
    }

    #[test]
    fn test_family_restricted_cluster_emits_one_family() {
        let a = cluster("a");
        let mut b = cluster("b");
        b.spec.ip_family = link_api::v1alpha1::IpFamily::Ipv6;
        let nodes = vec![
            dual_stack("a", "a1", "192.168.0.1", "fd00::1", &["10.1.0.0/16", "fd01::/64"]),
            dual_stack("b", "b1", "192.168.0.2", "fd00::2", &["10.2.0.0/16", "fd02::/64"]),
        ];
        let out = compile(&[a, b], &nodes);
        let a1 = &out.configs["a-a1"].spec;
        assert_eq!(a1.routes.len(), 1);
        assert_eq!(a1.routes[0].cidr, "fd02::/64");
    }

    #[test]
    fn test_shared_device_mode() {
        let compiler = Compiler::new(CompilerConfig {
            device_mode: DeviceMode::Shared,
            ..Default::default()
        });
        let clusters = vec![
            ipv4_cluster("a", NetworkType::P2P),
            ipv4_cluster("b", NetworkType::P2P),
            ipv4_cluster("c", NetworkType::P2P),
        ];
        let nodes = vec![
            node("a", "a1", "192.168.0.1", &["10.1.0.0/16"]),
            node("b", "b1", "192.168.0.2", &["10.2.0.0/16"]),
            node("c", "c1", "192.168.0.3", &["10.3.0.0/16"]),
        ];
        let out = compiler.compile(&AllocationTable::default(), &clusters, &nodes);
        let a1 = &out.configs["a-a1"].spec;
        assert_eq!(a1.devices.len(), 1);
        assert_eq!(a1.devices[0].name, "vx-bridge");
        assert_eq!(a1.devices[0].id, 54);
        assert_eq!(a1.routes.len(), 2);
        assert_eq!(a1.fdbs.len(), 2);
        assert_no_dangling("a-a1", a1);
    }

    #[test]
    fn test_mixed_topology_has_no_dangling_references() {
        let clusters = vec![
            cluster("a"),
            {
                let mut b = cluster("b");
                b.spec.network_type = NetworkType::Gateway;
                b
            },
            {
                let mut c = cluster("c");
                c.spec.use_ip_pool = true;
                c
            },
        ];
        let nodes = vec![
            dual_stack("a", "a1", "192.168.0.1", "fd00::1", &["10.1.0.0/24", "fd01::/64"]),
            node("a", "a2", "192.168.0.2", &["10.1.1.0/24"]),
            gateway("b", "b1", "192.168.1.1", &["10.2.0.0/24"]),
            dual_stack("b", "b2", "192.168.1.2", "fd00::12", &["10.2.1.0/24", "fd02::/64"]),
            gateway("b", "b3", "192.168.1.3", &["10.2.2.0/24"]),
            dual_stack("c", "c1", "192.168.2.1", "fd00::21", &["10.3.0.0/24", "fd03::/64"]),
        ];
        let out = compile(&clusters, &nodes);
        assert!(out.failures.is_empty());
        assert_eq!(out.configs.len(), 6);
        for (key, desired) in &out.configs {
            assert_no_dangling(key, &desired.spec);
        }
    }
}
