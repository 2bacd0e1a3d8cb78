//! CIDR allocation for overlay tunnel addresses
//!
//! Every cluster receives a fixed-size block from its local and bridge pools,
//! carved at a slot derived from a stable hash of the cluster name, and each
//! node keeps a host address inside it. Clusters with `useIPPool` instead
//! receive one host address per node, taken lowest free first. Both strategies
//! share one table, so blocks and node addresses of the same family never
//! overlap across clusters.

use crate::net;
use crate::{CoreError, Result};
use ipnetwork::IpNetwork;
use link_api::v1alpha1::{AddressPair, Cluster, ClusterAllocation, ClusterNode, Family};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Upper bound on slots inspected for one block request
const MAX_PROBES: u128 = 65_536;

/// Pool a tunnel address is drawn from
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PoolKind {
    /// Intra-cluster tunnels between members and their gateway
    Local,
    /// Inter-cluster tunnels
    Bridge,
}

impl PoolKind {
    pub const ALL: [PoolKind; 2] = [PoolKind::Local, PoolKind::Bridge];
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Local => write!(f, "local"),
            PoolKind::Bridge => write!(f, "bridge"),
        }
    }
}

/// Allocator configuration
#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    /// Prefix length of per-cluster IPv4 blocks
    pub ipv4_block_prefix: u8,
    /// Prefix length of per-cluster IPv6 blocks
    pub ipv6_block_prefix: u8,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            ipv4_block_prefix: 16,
            ipv6_block_prefix: 64,
        }
    }
}

impl AllocatorConfig {
    fn block_prefix(&self, family: Family) -> u8 {
        match family {
            Family::V4 => self.ipv4_block_prefix,
            Family::V6 => self.ipv6_block_prefix,
        }
    }
}

type BlockKey = (String, PoolKind, Family);
type NodeKey = (String, String, PoolKind, Family);

/// Something already holding part of the address space
#[derive(Clone, Debug)]
struct Holder {
    net: IpNetwork,
    owner: String,
}

/// Authoritative allocation state of every cluster.
///
/// `version` increases on every mutation so writers can tell whether a pass
/// changed anything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AllocationTable {
    version: u64,
    blocks: BTreeMap<BlockKey, IpNetwork>,
    nodes: BTreeMap<NodeKey, IpNetwork>,
    reallocated: BTreeSet<String>,
}

impl AllocationTable {
    /// Rebuild the table from the allocation records persisted on Cluster status
    pub fn from_clusters<'a>(clusters: impl IntoIterator<Item = &'a Cluster>) -> Self {
        let mut table = Self::default();
        for cluster in clusters {
            let name = cluster.cluster_name();
            let Some(record) = cluster.status.as_ref().and_then(|s| s.allocation.as_ref()) else {
                continue;
            };
            for kind in PoolKind::ALL {
                for family in Family::ALL {
                    if let Some(cidr) = pair(record, kind).get(family) {
                        match net::parse_cidr(cidr) {
                            Ok(block) => {
                                table.blocks.insert((name.to_string(), kind, family), block);
                            }
                            Err(e) => warn!("Ignoring persisted block of cluster {}: {}", name, e),
                        }
                    }
                    for (node, addrs) in &record.nodes {
                        let value = match kind {
                            PoolKind::Local => addrs.local.get(family),
                            PoolKind::Bridge => addrs.bridge.get(family),
                        };
                        let Some(value) = value else { continue };
                        match net::parse_addr(value).and_then(host_network) {
                            Ok(host) => {
                                table
                                    .nodes
                                    .insert((name.to_string(), node.clone(), kind, family), host);
                            }
                            Err(e) => warn!("Ignoring persisted address of node {}/{}: {}", name, node, e),
                        }
                    }
                }
            }
        }
        table
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Clusters whose previously held space was moved or released during the last pass
    pub fn reallocated(&self) -> &BTreeSet<String> {
        &self.reallocated
    }

    pub fn block(&self, cluster: &str, kind: PoolKind, family: Family) -> Option<IpNetwork> {
        self.blocks.get(&(cluster.to_string(), kind, family)).copied()
    }

    pub fn node_address(&self, cluster: &str, node: &str, kind: PoolKind, family: Family) -> Option<IpAddr> {
        self.nodes
            .get(&(cluster.to_string(), node.to_string(), kind, family))
            .map(|n| n.ip())
    }

    /// Allocation record of one cluster in its persisted form
    pub fn record(&self, cluster: &str) -> ClusterAllocation {
        let mut record = ClusterAllocation::default();
        for ((owner, kind, family), block) in &self.blocks {
            if owner == cluster {
                pair_mut(&mut record, *kind).set(*family, Some(block.to_string()));
            }
        }
        for ((owner, node, kind, family), host) in &self.nodes {
            if owner == cluster {
                let entry = record.nodes.entry(node.clone()).or_default();
                let addrs = match kind {
                    PoolKind::Local => &mut entry.local,
                    PoolKind::Bridge => &mut entry.bridge,
                };
                addrs.set(*family, Some(host.ip().to_string()));
            }
        }
        record
    }

    /// Release everything held by clusters that are no longer registered
    pub fn retain_clusters(&mut self, live: &BTreeSet<String>) {
        let before = self.blocks.len() + self.nodes.len();
        self.blocks.retain(|(c, _, _), _| live.contains(c));
        self.nodes.retain(|(c, _, _, _), _| live.contains(c));
        if self.blocks.len() + self.nodes.len() != before {
            self.version += 1;
        }
    }

    fn set_block(&mut self, key: BlockKey, block: IpNetwork) {
        match self.blocks.insert(key.clone(), block) {
            Some(previous) if previous == block => {}
            Some(_) => {
                self.reallocated.insert(key.0);
                self.version += 1;
            }
            None => self.version += 1,
        }
    }

    fn remove_block(&mut self, key: &BlockKey) {
        if self.blocks.remove(key).is_some() {
            self.reallocated.insert(key.0.clone());
            self.version += 1;
        }
    }

    fn set_node(&mut self, key: NodeKey, host: IpNetwork) {
        if self.nodes.insert(key, host) != Some(host) {
            self.version += 1;
        }
    }

    /// Drop node addresses of one cluster/pool/family whose node is not in `live`
    fn retain_nodes(&mut self, cluster: &str, kind: PoolKind, family: Family, live: &BTreeSet<String>) {
        let before = self.nodes.len();
        self.nodes.retain(|(c, n, k, f), _| {
            c != cluster || *k != kind || *f != family || live.contains(n)
        });
        if self.nodes.len() != before {
            self.reallocated.insert(cluster.to_string());
            self.version += 1;
        }
    }

    /// First holder overlapping `candidate`, ignoring the entry being (re)assigned.
    ///
    /// Node addresses carved from `skip_block` are ignored along with it.
    fn holder(&self, candidate: &IpNetwork, skip_block: Option<&BlockKey>, skip_node: Option<&NodeKey>) -> Option<Holder> {
        let carved_from_skipped = |(c, _, kind, family): &NodeKey| {
            skip_block.is_some_and(|(bc, bkind, bfamily)| c == bc && kind == bkind && family == bfamily)
        };
        self.blocks
            .iter()
            .filter(|(k, _)| Some(*k) != skip_block)
            .find(|(_, b)| net::overlaps(b, candidate))
            .map(|((c, kind, _), b)| Holder {
                net: *b,
                owner: format!("{} block {} of cluster {}", kind, b, c),
            })
            .or_else(|| {
                self.nodes
                    .iter()
                    .filter(|(k, _)| Some(*k) != skip_node && !carved_from_skipped(k))
                    .find(|(_, h)| net::overlaps(h, candidate))
                    .map(|((c, n, kind, _), h)| Holder {
                        net: *h,
                        owner: format!("{} address {} of node {}/{}", kind, h.ip(), c, n),
                    })
            })
    }
}

/// Tunnel addresses of one node, keyed by pool and family.
///
/// Each value carries the pool prefix so it can be used verbatim as a device address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TunnelAddresses {
    entries: BTreeMap<(PoolKind, Family), IpNetwork>,
}

impl TunnelAddresses {
    pub fn get(&self, kind: PoolKind, family: Family) -> Option<&IpNetwork> {
        self.entries.get(&(kind, family))
    }

    fn insert(&mut self, kind: PoolKind, family: Family, addr: IpNetwork) {
        self.entries.insert((kind, family), addr);
    }
}

/// Result of allocating for a whole inventory
#[derive(Debug, Default)]
pub struct Assignment {
    /// Tunnel addresses per NodeKey
    pub addresses: BTreeMap<String, TunnelAddresses>,
    /// Clusters whose allocation failed
    pub failures: BTreeMap<String, CoreError>,
}

/// Allocator for local and bridge tunnel address space
#[derive(Clone, Debug, Default)]
pub struct Allocator {
    config: AllocatorConfig,
}

impl Allocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self { config }
    }

    /// Allocate (or confirm) the block of one cluster, pool kind and family.
    ///
    /// An explicit override wins; otherwise a still-valid existing block is
    /// kept; otherwise a block is carved at the cluster's hash slot, probing
    /// forward past occupied slots.
    pub fn allocate(
        &self,
        table: &mut AllocationTable,
        cluster: &Cluster,
        family: Family,
        kind: PoolKind,
        override_cidr: Option<IpNetwork>,
    ) -> Result<IpNetwork> {
        let name = cluster.cluster_name();
        let key: BlockKey = (name.to_string(), kind, family);
        let pool = pool_of(cluster, kind, family)?;
        let prefix = self.config.block_prefix(family);
        if prefix < pool.prefix() || prefix as u32 > net::bits(family) {
            return Err(CoreError::InvalidConfiguration(format!(
                "{} block prefix /{} does not fit {} pool {} of cluster {}",
                family, prefix, kind, pool, name
            )));
        }

        if let Some(cidr) = override_cidr {
            if let Some(holder) = table.holder(&cidr, Some(&key), None) {
                return Err(CoreError::ConflictingOverride {
                    cluster: name.to_string(),
                    cidr: cidr.to_string(),
                    existing: holder.owner,
                });
            }
            table.set_block(key, cidr);
            return Ok(cidr);
        }

        if let Some(current) = table.blocks.get(&key).copied() {
            let valid = net::within(&current, &pool)
                && current.prefix() == prefix
                && table.holder(&current, Some(&key), None).is_none();
            if valid {
                return Ok(current);
            }
            debug!("Releasing {} {} block {} of cluster {}", family, kind, current, name);
            table.remove_block(&key);
        }

        let slots = net::slot_count(&pool, prefix);
        let start = slot_hash(name, kind, family) % slots;
        for probe in 0..slots.min(MAX_PROBES) {
            let index = start.wrapping_add(probe) % slots;
            let candidate = net::subnet(&pool, prefix, index)?;
            if table.holder(&candidate, Some(&key), None).is_none() {
                debug!("Allocated {} {} block {} to cluster {}", family, kind, candidate, name);
                table.set_block(key, candidate);
                return Ok(candidate);
            }
        }

        Err(CoreError::PoolExhausted {
            cluster: name.to_string(),
            pool: kind.to_string(),
            family,
        })
    }

    /// Allocate (or confirm) the pool-mode address of one node
    pub fn allocate_node(
        &self,
        table: &mut AllocationTable,
        cluster: &Cluster,
        node: &str,
        family: Family,
        kind: PoolKind,
    ) -> Result<IpAddr> {
        let name = cluster.cluster_name();
        let key: NodeKey = (name.to_string(), node.to_string(), kind, family);
        let pool = pool_of(cluster, kind, family)?;

        if let Some(current) = table.nodes.get(&key).copied() {
            if net::within(&current, &pool) && table.holder(&current, None, Some(&key)).is_none() {
                return Ok(current.ip());
            }
            table.nodes.remove(&key);
            table.reallocated.insert(name.to_string());
            table.version += 1;
        }

        let (first, last) = net::bounds(&pool);
        // The network address is never handed out, nor the IPv4 broadcast address
        let end = match family {
            Family::V4 => last.saturating_sub(1),
            Family::V6 => last,
        };
        let mut cursor = first + 1;
        while cursor <= end {
            let candidate = host_network(net::from_u128(cursor, family))?;
            match table.holder(&candidate, None, Some(&key)) {
                None => {
                    debug!("Allocated {} {} address {} to node {}/{}", family, kind, candidate.ip(), name, node);
                    table.set_node(key, candidate);
                    return Ok(candidate.ip());
                }
                Some(holder) => match net::bounds(&holder.net).1.checked_add(1) {
                    Some(next) => cursor = next,
                    None => break,
                },
            }
        }

        Err(CoreError::PoolExhausted {
            cluster: name.to_string(),
            pool: kind.to_string(),
            family,
        })
    }

    /// Allocate for every cluster and node of an inventory.
    ///
    /// Clusters are processed in name order. A failing cluster has its table
    /// entries restored and is reported in `failures`; the others proceed.
    pub fn assign(&self, table: &mut AllocationTable, clusters: &[&Cluster], nodes: &[&ClusterNode]) -> Assignment {
        table.reallocated.clear();
        let live: BTreeSet<String> = clusters.iter().map(|c| c.cluster_name().to_string()).collect();
        table.retain_clusters(&live);

        let mut sorted = clusters.to_vec();
        sorted.sort_by(|a, b| a.cluster_name().cmp(b.cluster_name()));

        let (overrides, mut failures) = resolve_overrides(&sorted);
        self.reserve_overrides(table, &sorted, &overrides, &mut failures);
        let mut addresses = BTreeMap::new();

        for cluster in sorted {
            let name = cluster.cluster_name();
            if failures.contains_key(name) {
                continue;
            }
            let mut members: Vec<&ClusterNode> = nodes
                .iter()
                .copied()
                .filter(|n| n.spec.cluster_name == name)
                .collect();
            members.sort_by(|a, b| a.spec.node_name.cmp(&b.spec.node_name));

            let before = table.clone();
            match self.assign_cluster(table, cluster, &members, overrides.get(name)) {
                Ok(addrs) => addresses.extend(addrs),
                Err(e) => {
                    warn!("Allocation failed for cluster {}: {}", name, e);
                    *table = before;
                    failures.insert(name.to_string(), e);
                }
            }
        }

        Assignment { addresses, failures }
    }

    /// Claim every explicit override before any block is carved by hash.
    /// Overrides still conflict with space already held in the table.
    fn reserve_overrides(
        &self,
        table: &mut AllocationTable,
        clusters: &[&Cluster],
        overrides: &BTreeMap<String, IpNetwork>,
        failures: &mut BTreeMap<String, CoreError>,
    ) {
        for cluster in clusters {
            let name = cluster.cluster_name();
            let Some(cidr) = overrides.get(name) else { continue };
            let family = net::family_of(cidr);
            if failures.contains_key(name) || cluster.spec.use_ip_pool || !cluster.spec.ip_family.allows(family) {
                continue;
            }
            let kind = override_kind(cluster, cidr);
            if let Err(e) = self.allocate(table, cluster, family, kind, Some(*cidr)) {
                warn!("Allocation failed for cluster {}: {}", name, e);
                failures.insert(name.to_string(), e);
            }
        }
    }

    fn assign_cluster(
        &self,
        table: &mut AllocationTable,
        cluster: &Cluster,
        members: &[&ClusterNode],
        override_cidr: Option<&IpNetwork>,
    ) -> Result<BTreeMap<String, TunnelAddresses>> {
        let name = cluster.cluster_name();
        let mut out: BTreeMap<String, TunnelAddresses> = members
            .iter()
            .map(|n| (n.node_key(), TunnelAddresses::default()))
            .collect();
        let nobody = BTreeSet::new();

        for family in Family::ALL {
            if !cluster.spec.ip_family.allows(family) {
                for kind in PoolKind::ALL {
                    table.remove_block(&(name.to_string(), kind, family));
                    table.retain_nodes(name, kind, family, &nobody);
                }
                continue;
            }

            for kind in PoolKind::ALL {
                let pool = pool_of(cluster, kind, family)?;

                if cluster.spec.use_ip_pool {
                    table.remove_block(&(name.to_string(), kind, family));
                    let live: BTreeSet<String> = members
                        .iter()
                        .filter(|n| n.spec.address(family).is_some())
                        .map(|n| n.spec.node_name.clone())
                        .collect();
                    table.retain_nodes(name, kind, family, &live);

                    for node in members.iter().filter(|n| n.spec.address(family).is_some()) {
                        let ip = self.allocate_node(table, cluster, &node.spec.node_name, family, kind)?;
                        if let Some(addrs) = out.get_mut(&node.node_key()) {
                            addrs.insert(kind, family, net::network(ip, pool.prefix())?);
                        }
                    }
                    continue;
                }

                let explicit = override_cidr
                    .filter(|o| net::family_of(o) == family && override_kind(cluster, o) == kind)
                    .copied();
                let block = self.allocate(table, cluster, family, kind, explicit)?;

                let mut underlays = Vec::new();
                for node in members {
                    let Some(addr) = node.spec.address(family) else { continue };
                    match net::parse_addr(addr) {
                        Ok(ip) if ip.is_ipv4() == (family == Family::V4) => underlays.push((*node, ip)),
                        _ => warn!("Node {}/{} reports invalid {} address {:?}", name, node.spec.node_name, family, addr),
                    }
                }
                let live: BTreeSet<String> = underlays.iter().map(|(n, _)| n.spec.node_name.clone()).collect();
                table.retain_nodes(name, kind, family, &live);

                // Addresses already held inside the block stay put; newcomers fill around them
                let start = net::to_u128(block.network());
                let mut taken = BTreeSet::new();
                let mut newcomers = Vec::new();
                for (node, underlay) in underlays {
                    let key: NodeKey = (name.to_string(), node.spec.node_name.clone(), kind, family);
                    let kept = table
                        .nodes
                        .get(&key)
                        .filter(|h| block.contains(h.ip()))
                        .map(|h| net::to_u128(h.ip()) - start)
                        .filter(|offset| !reserved_offset(&block, *offset) && taken.insert(*offset));
                    if kept.is_none() {
                        newcomers.push((key, underlay));
                    }
                }
                for (key, underlay) in newcomers {
                    let ip = host_in_block(&block, underlay, &mut taken).ok_or_else(|| CoreError::PoolExhausted {
                        cluster: name.to_string(),
                        pool: kind.to_string(),
                        family,
                    })?;
                    debug!("Assigned {} {} address {} to node {}/{}", family, kind, ip, name, key.1);
                    table.set_node(key, host_network(ip)?);
                }

                for node in members {
                    let Some(ip) = table.node_address(name, &node.spec.node_name, kind, family) else { continue };
                    if let Some(addrs) = out.get_mut(&node.node_key()) {
                        addrs.insert(kind, family, net::network(ip, pool.prefix())?);
                    }
                }
            }
        }

        Ok(out)
    }
}

/// Merge the override maps declared by every cluster.
///
/// Returns the overrides by target cluster plus per-cluster errors for
/// unparsable or contradicting entries.
pub fn resolve_overrides(clusters: &[&Cluster]) -> (BTreeMap<String, IpNetwork>, BTreeMap<String, CoreError>) {
    let mut overrides: BTreeMap<String, IpNetwork> = BTreeMap::new();
    let mut failures = BTreeMap::new();

    for cluster in clusters {
        for (target, cidr) in &cluster.spec.global_cidrs_map {
            let parsed = match net::parse_cidr(cidr) {
                Ok(parsed) => parsed,
                Err(e) => {
                    failures.insert(target.clone(), e);
                    continue;
                }
            };
            match overrides.get(target) {
                Some(existing) if *existing != parsed => {
                    failures.insert(
                        target.clone(),
                        CoreError::ConflictingOverride {
                            cluster: target.clone(),
                            cidr: parsed.to_string(),
                            existing: format!("override {} declared by another cluster", existing),
                        },
                    );
                }
                _ => {
                    overrides.insert(target.clone(), parsed);
                }
            }
        }
    }

    (overrides, failures)
}

/// Pool kind an override applies to: local when the local pool contains it
fn override_kind(cluster: &Cluster, cidr: &IpNetwork) -> PoolKind {
    match pool_of(cluster, PoolKind::Local, net::family_of(cidr)) {
        Ok(local) if net::within(cidr, &local) => PoolKind::Local,
        _ => PoolKind::Bridge,
    }
}

fn pool_of(cluster: &Cluster, kind: PoolKind, family: Family) -> Result<IpNetwork> {
    let cidrs = match kind {
        PoolKind::Local => &cluster.spec.local_cidrs,
        PoolKind::Bridge => &cluster.spec.bridge_cidrs,
    };
    let pool = net::parse_cidr(cidrs.get(family))?;
    if net::family_of(&pool) != family {
        return Err(CoreError::InvalidConfiguration(format!(
            "{} pool {} of cluster {} is not {}",
            kind,
            pool,
            cluster.cluster_name(),
            family
        )));
    }
    Ok(pool)
}

fn pair(record: &ClusterAllocation, kind: PoolKind) -> &AddressPair {
    match kind {
        PoolKind::Local => &record.local,
        PoolKind::Bridge => &record.bridge,
    }
}

fn pair_mut(record: &mut ClusterAllocation, kind: PoolKind) -> &mut AddressPair {
    match kind {
        PoolKind::Local => &mut record.local,
        PoolKind::Bridge => &mut record.bridge,
    }
}

fn host_network(ip: IpAddr) -> Result<IpNetwork> {
    let width = if ip.is_ipv4() { 32 } else { 128 };
    net::network(ip, width)
}

fn slot_hash(cluster: &str, kind: PoolKind, family: Family) -> u128 {
    let digest = Sha256::digest(format!("{}/{}/{}", cluster, kind, family).as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    u128::from_be_bytes(bytes)
}

/// Node address inside a static block: the underlay address's host bits,
/// probing forward past reserved and already used offsets
fn host_in_block(block: &IpNetwork, underlay: IpAddr, taken: &mut BTreeSet<u128>) -> Option<IpAddr> {
    let family = net::family_of(block);
    let host_bits = net::host_bits(block);
    let mask = net::low_mask(host_bits);
    let start = net::to_u128(block.network());
    let attempts = mask.min(MAX_PROBES);
    let mut offset = net::to_u128(underlay) & mask;

    for _ in 0..=attempts {
        if !reserved_offset(block, offset) && taken.insert(offset) {
            return Some(net::from_u128(start + offset, family));
        }
        offset = offset.wrapping_add(1) & mask;
    }
    None
}

/// Network offset, plus the broadcast offset for IPv4
fn reserved_offset(block: &IpNetwork, offset: u128) -> bool {
    offset == 0 || (net::family_of(block) == Family::V4 && offset == net::low_mask(net::host_bits(block)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{cluster, node};

    fn refs<T>(items: &[T]) -> Vec<&T> {
        items.iter().collect()
    }

    #[test]
    fn test_blocks_are_disjoint_across_many_clusters() {
        let clusters: Vec<Cluster> = (0..60).map(|i| cluster(&format!("c{}", i))).collect();
        let mut table = AllocationTable::default();
        let assignment = Allocator::default().assign(&mut table, &refs(&clusters), &[]);
        assert!(assignment.failures.is_empty());

        let blocks: Vec<IpNetwork> = table.blocks.values().copied().collect();
        assert_eq!(blocks.len(), 60 * 2 * 2);
        for (i, a) in blocks.iter().enumerate() {
            for b in &blocks[i + 1..] {
                assert!(!net::overlaps(a, b), "{} overlaps {}", a, b);
            }
        }
    }

    #[test]
    fn test_allocation_is_idempotent_and_survives_persistence() {
        let mut clusters = vec![cluster("a"), cluster("b"), cluster("c")];
        let nodes = vec![node("a", "a1", "192.168.1.10", &["10.1.0.0/24"])];

        let mut first = AllocationTable::default();
        let assigned = Allocator::default().assign(&mut first, &refs(&clusters), &refs(&nodes));

        let mut second = AllocationTable::default();
        let again = Allocator::default().assign(&mut second, &refs(&clusters), &refs(&nodes));
        assert_eq!(first.blocks, second.blocks);
        assert_eq!(assigned.addresses, again.addresses);

        for c in clusters.iter_mut() {
            let record = first.record(c.cluster_name());
            c.status = Some(link_api::v1alpha1::ClusterStatus {
                allocation: Some(record),
                ..Default::default()
            });
        }
        let mut restored = AllocationTable::from_clusters(&clusters);
        let version = restored.version();
        Allocator::default().assign(&mut restored, &refs(&clusters), &refs(&nodes));
        assert_eq!(restored.blocks, first.blocks);
        assert_eq!(restored.version(), version);
        assert!(restored.reallocated().is_empty());
    }

    #[test]
    fn test_node_address_uses_underlay_host_bits() {
        let clusters = vec![cluster("a")];
        let nodes = vec![
            node("a", "a1", "192.168.3.7", &[]),
            node("a", "a2", "10.9.3.7", &[]),
        ];
        let mut table = AllocationTable::default();
        let assignment = Allocator::default().assign(&mut table, &refs(&clusters), &refs(&nodes));

        let block = table.block("a", PoolKind::Bridge, Family::V4).unwrap();
        let a1 = assignment.addresses["a-a1"].get(PoolKind::Bridge, Family::V4).unwrap();
        let a2 = assignment.addresses["a-a2"].get(PoolKind::Bridge, Family::V4).unwrap();

        assert!(block.contains(a1.ip()));
        assert_eq!(net::to_u128(a1.ip()) & 0xffff, 0x0307);
        // a2 collides on the low bits and probes to the next offset
        assert_eq!(net::to_u128(a2.ip()) & 0xffff, 0x0308);
        assert_eq!(a1.prefix(), 8);
    }

    #[test]
    fn test_static_addresses_stay_put_when_node_joins() {
        let clusters = vec![cluster("a")];
        let mut nodes = vec![node("a", "a5", "192.168.3.7", &[])];
        let mut table = AllocationTable::default();
        let first = Allocator::default().assign(&mut table, &refs(&clusters), &refs(&nodes));
        let a5 = *first.addresses["a-a5"].get(PoolKind::Bridge, Family::V4).unwrap();

        // Sorts first and shares a5's low host bits
        nodes.push(node("a", "a0", "10.0.3.7", &[]));
        let second = Allocator::default().assign(&mut table, &refs(&clusters), &refs(&nodes));
        assert_eq!(second.addresses["a-a5"].get(PoolKind::Bridge, Family::V4), Some(&a5));
        let a0 = second.addresses["a-a0"].get(PoolKind::Bridge, Family::V4).unwrap();
        assert_eq!(net::to_u128(a0.ip()) & 0xffff, 0x0308);
        assert!(table.reallocated().is_empty());

        let record = table.record("a");
        assert_eq!(record.nodes["a5"].bridge.ip.as_deref(), Some(a5.ip().to_string().as_str()));
        assert!(record.nodes.contains_key("a0"));

        // The same holds after rebuilding from persisted status
        let mut persisted = cluster("a");
        persisted.status = Some(link_api::v1alpha1::ClusterStatus {
            allocation: Some(record),
            ..Default::default()
        });
        let mut restored = AllocationTable::from_clusters([&persisted]);
        nodes.reverse();
        let third = Allocator::default().assign(&mut restored, &[&persisted], &refs(&nodes));
        assert_eq!(third.addresses, second.addresses);
    }

    #[test]
    fn test_departed_static_node_frees_its_offset() {
        let clusters = vec![cluster("a")];
        let mut nodes = vec![
            node("a", "a1", "192.168.3.7", &[]),
            node("a", "a2", "10.9.3.7", &[]),
        ];
        let mut table = AllocationTable::default();
        Allocator::default().assign(&mut table, &refs(&clusters), &refs(&nodes));

        nodes.remove(0);
        Allocator::default().assign(&mut table, &refs(&clusters), &refs(&nodes));
        assert!(table.node_address("a", "a1", PoolKind::Bridge, Family::V4).is_none());
        let a2 = table.node_address("a", "a2", PoolKind::Bridge, Family::V4).unwrap();
        assert_eq!(net::to_u128(a2) & 0xffff, 0x0308);

        nodes.push(node("a", "a3", "172.16.3.7", &[]));
        Allocator::default().assign(&mut table, &refs(&clusters), &refs(&nodes));
        let a3 = table.node_address("a", "a3", PoolKind::Bridge, Family::V4).unwrap();
        assert_eq!(net::to_u128(a3) & 0xffff, 0x0307);
    }

    #[test]
    fn test_override_wins_over_hashed_slot_in_same_pass() {
        let mut table = AllocationTable::default();
        Allocator::default().assign(&mut table, &[&cluster("a")], &[]);
        let slot = table.block("a", PoolKind::Bridge, Family::V4).unwrap();

        let mut z = cluster("z");
        z.spec.global_cidrs_map.insert("z".to_string(), slot.to_string());
        let clusters = vec![cluster("a"), z];
        let mut table = AllocationTable::default();
        let assignment = Allocator::default().assign(&mut table, &refs(&clusters), &[]);
        assert!(assignment.failures.is_empty(), "{:?}", assignment.failures);
        assert_eq!(table.block("z", PoolKind::Bridge, Family::V4), Some(slot));
        let moved = table.block("a", PoolKind::Bridge, Family::V4).unwrap();
        assert!(!net::overlaps(&moved, &slot));
    }

    #[test]
    fn test_override_still_conflicts_with_held_block() {
        let mut table = AllocationTable::default();
        Allocator::default().assign(&mut table, &[&cluster("a")], &[]);
        let held = table.block("a", PoolKind::Bridge, Family::V4).unwrap();

        let mut z = cluster("z");
        z.spec.global_cidrs_map.insert("z".to_string(), held.to_string());
        let clusters = vec![cluster("a"), z];
        let assignment = Allocator::default().assign(&mut table, &refs(&clusters), &[]);
        assert!(matches!(
            assignment.failures.get("z"),
            Some(CoreError::ConflictingOverride { .. })
        ));
        assert_eq!(table.block("a", PoolKind::Bridge, Family::V4), Some(held));
    }

    #[test]
    fn test_override_is_used() {
        let mut a = cluster("a");
        a.spec.global_cidrs_map.insert("b".to_string(), "220.200.0.0/16".to_string());
        let clusters = vec![a, cluster("b")];
        let mut table = AllocationTable::default();
        let assignment = Allocator::default().assign(&mut table, &refs(&clusters), &[]);
        assert!(assignment.failures.is_empty());
        assert_eq!(
            table.block("b", PoolKind::Bridge, Family::V4).unwrap().to_string(),
            "220.200.0.0/16"
        );
    }

    #[test]
    fn test_contradicting_overrides_fail_target_cluster() {
        let mut a = cluster("a");
        a.spec.global_cidrs_map.insert("c".to_string(), "220.200.0.0/16".to_string());
        let mut b = cluster("b");
        b.spec.global_cidrs_map.insert("c".to_string(), "220.201.0.0/16".to_string());
        let clusters = vec![a, b, cluster("c")];

        let mut table = AllocationTable::default();
        let assignment = Allocator::default().assign(&mut table, &refs(&clusters), &[]);
        assert!(matches!(
            assignment.failures.get("c"),
            Some(CoreError::ConflictingOverride { .. })
        ));
        assert!(!assignment.failures.contains_key("a"));
        assert!(table.block("c", PoolKind::Bridge, Family::V4).is_none());
    }

    #[test]
    fn test_override_colliding_with_existing_block() {
        let clusters = vec![cluster("a")];
        let mut table = AllocationTable::default();
        Allocator::default().assign(&mut table, &refs(&clusters), &[]);
        let taken = table.block("a", PoolKind::Bridge, Family::V4).unwrap();

        let mut b = cluster("b");
        b.spec.global_cidrs_map.insert("b".to_string(), taken.to_string());
        let result = Allocator::default().allocate(&mut table, &b, Family::V4, PoolKind::Bridge, Some(taken));
        assert!(matches!(result, Err(CoreError::ConflictingOverride { .. })));
    }

    #[test]
    fn test_pool_exhausted() {
        let allocator = Allocator::new(AllocatorConfig {
            ipv4_block_prefix: 8,
            ipv6_block_prefix: 64,
        });
        let mut a = cluster("a");
        a.spec.ip_family = link_api::v1alpha1::IpFamily::Ipv4;
        let mut b = cluster("b");
        b.spec.ip_family = link_api::v1alpha1::IpFamily::Ipv4;
        let clusters = vec![a, b];

        let mut table = AllocationTable::default();
        let assignment = allocator.assign(&mut table, &refs(&clusters), &[]);
        assert!(!assignment.failures.contains_key("a"));
        assert!(matches!(
            assignment.failures.get("b"),
            Some(CoreError::PoolExhausted { .. })
        ));
        // The failed cluster holds nothing
        assert!(table.block("b", PoolKind::Local, Family::V4).is_none());
    }

    #[test]
    fn test_ip_pool_mode_allocates_and_reclaims_per_node() {
        let mut a = cluster("a");
        a.spec.use_ip_pool = true;
        a.spec.ip_family = link_api::v1alpha1::IpFamily::Ipv4;
        let clusters = vec![a];
        let mut nodes = vec![
            node("a", "a1", "192.168.0.1", &[]),
            node("a", "a2", "192.168.0.2", &[]),
        ];

        let mut table = AllocationTable::default();
        let assignment = Allocator::default().assign(&mut table, &refs(&clusters), &refs(&nodes));
        assert!(assignment.failures.is_empty());
        assert!(table.block("a", PoolKind::Bridge, Family::V4).is_none());
        let a1 = table.node_address("a", "a1", PoolKind::Bridge, Family::V4).unwrap();
        let a2 = table.node_address("a", "a2", PoolKind::Bridge, Family::V4).unwrap();
        assert_eq!(a1.to_string(), "220.0.0.1");
        assert_eq!(a2.to_string(), "220.0.0.2");

        nodes.remove(0);
        nodes.push(node("a", "a3", "192.168.0.3", &[]));
        Allocator::default().assign(&mut table, &refs(&clusters), &refs(&nodes));
        assert!(table.node_address("a", "a1", PoolKind::Bridge, Family::V4).is_none());
        assert_eq!(
            table.node_address("a", "a2", PoolKind::Bridge, Family::V4),
            Some(a2)
        );
        // a1's address was reclaimed and handed to the newcomer
        assert_eq!(
            table.node_address("a", "a3", PoolKind::Bridge, Family::V4),
            Some(a1)
        );
    }

    #[test]
    fn test_pool_mode_skips_static_blocks_of_other_clusters() {
        let mut a = cluster("a");
        a.spec.global_cidrs_map.insert("a".to_string(), "220.0.0.0/16".to_string());
        let mut b = cluster("b");
        b.spec.use_ip_pool = true;
        let clusters = vec![a, b];
        let nodes = vec![node("b", "b1", "192.168.0.1", &[])];

        let mut table = AllocationTable::default();
        let assignment = Allocator::default().assign(&mut table, &refs(&clusters), &refs(&nodes));
        assert!(assignment.failures.is_empty());
        let b1 = table.node_address("b", "b1", PoolKind::Bridge, Family::V4).unwrap();
        assert_eq!(b1.to_string(), "220.1.0.0");
    }

    #[test]
    fn test_removed_cluster_releases_space() {
        let clusters = vec![cluster("a"), cluster("b")];
        let mut table = AllocationTable::default();
        Allocator::default().assign(&mut table, &refs(&clusters), &[]);
        assert!(table.block("b", PoolKind::Bridge, Family::V4).is_some());

        Allocator::default().assign(&mut table, &refs(&clusters[..1]), &[]);
        assert!(table.block("b", PoolKind::Bridge, Family::V4).is_none());
        assert!(table.block("a", PoolKind::Bridge, Family::V4).is_some());
    }
}
