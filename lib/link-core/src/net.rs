//! CIDR arithmetic over `ipnetwork` types

use crate::{CoreError, Result};
use ipnetwork::IpNetwork;
use link_api::v1alpha1::Family;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Parse a CIDR, normalizing it to its network address
pub fn parse_cidr(cidr: &str) -> Result<IpNetwork> {
    let net = IpNetwork::from_str(cidr.trim())
        .map_err(|e| CoreError::InvalidConfiguration(format!("invalid CIDR {:?}: {}", cidr, e)))?;
    network(net.network(), net.prefix())
}

/// Parse a bare address or a CIDR into a single-address value
pub fn parse_addr(addr: &str) -> Result<IpAddr> {
    let addr = addr.trim();
    let host = addr.split('/').next().unwrap_or(addr);
    IpAddr::from_str(host)
        .map_err(|e| CoreError::InvalidConfiguration(format!("invalid address {:?}: {}", addr, e)))
}

pub fn network(ip: IpAddr, prefix: u8) -> Result<IpNetwork> {
    IpNetwork::new(ip, prefix)
        .map_err(|e| CoreError::InvalidConfiguration(format!("invalid prefix /{} for {}: {}", prefix, ip, e)))
}

pub fn family_of(net: &IpNetwork) -> Family {
    match net {
        IpNetwork::V4(_) => Family::V4,
        IpNetwork::V6(_) => Family::V6,
    }
}

pub fn bits(family: Family) -> u32 {
    match family {
        Family::V4 => 32,
        Family::V6 => 128,
    }
}

pub fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

pub fn from_u128(value: u128, family: Family) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
        Family::V6 => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

pub(crate) fn low_mask(n_bits: u32) -> u128 {
    if n_bits >= 128 {
        u128::MAX
    } else {
        (1u128 << n_bits) - 1
    }
}

/// Number of host bits in a network
pub fn host_bits(net: &IpNetwork) -> u32 {
    bits(family_of(net)) - net.prefix() as u32
}

/// First and last address of a network as integers
pub fn bounds(net: &IpNetwork) -> (u128, u128) {
    let start = to_u128(net.network());
    (start, start | low_mask(host_bits(net)))
}

pub fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    if family_of(a) != family_of(b) {
        return false;
    }
    let (a_start, a_end) = bounds(a);
    let (b_start, b_end) = bounds(b);
    a_start <= b_end && b_start <= a_end
}

/// Whether `inner` lies entirely within `outer`
pub fn within(inner: &IpNetwork, outer: &IpNetwork) -> bool {
    family_of(inner) == family_of(outer)
        && inner.prefix() >= outer.prefix()
        && outer.contains(inner.network())
}

/// Number of `/prefix` subnets inside `base`, saturating
pub fn slot_count(base: &IpNetwork, prefix: u8) -> u128 {
    let diff = prefix.saturating_sub(base.prefix()) as u32;
    if diff >= 128 {
        u128::MAX
    } else {
        1u128 << diff
    }
}

/// The `index`-th `/prefix` subnet of `base`
pub fn subnet(base: &IpNetwork, prefix: u8, index: u128) -> Result<IpNetwork> {
    let family = family_of(base);
    let step_bits = bits(family) - prefix as u32;
    let offset = if step_bits >= 128 { 0 } else { index << step_bits };
    let start = to_u128(base.network()) + offset;
    network(from_u128(start, family), prefix)
}

/// Smallest network covering every given network of one family
pub fn supernet(nets: &[IpNetwork]) -> Option<IpNetwork> {
    let first = nets.first()?;
    let family = family_of(first);
    let width = bits(family);
    let base = to_u128(first.network());
    let mut prefix = nets.iter().map(|n| n.prefix() as u32).min().unwrap_or(width);
    for net in nets {
        if family_of(net) != family {
            return None;
        }
        let diff = base ^ to_u128(net.network());
        if diff != 0 {
            let common = diff.leading_zeros() - (128 - width);
            prefix = prefix.min(common);
        }
    }
    let mask = low_mask(width) & !low_mask(width - prefix);
    network(from_u128(base & mask, family), prefix as u8).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        parse_cidr(s).unwrap()
    }

    #[test]
    fn test_parse_normalizes_host_bits() {
        assert_eq!(net("10.1.2.3/16").to_string(), "10.1.0.0/16");
        assert!(parse_cidr("10.1.0.0/33").is_err());
        assert!(parse_cidr("not-a-cidr").is_err());
    }

    #[test]
    fn test_overlap() {
        assert!(overlaps(&net("10.0.0.0/8"), &net("10.2.0.0/16")));
        assert!(overlaps(&net("10.2.0.0/16"), &net("10.0.0.0/8")));
        assert!(!overlaps(&net("10.1.0.0/16"), &net("10.2.0.0/16")));
        assert!(!overlaps(&net("10.1.0.0/16"), &net("fd00::/8")));
    }

    #[test]
    fn test_subnet_carving() {
        let pool = net("220.0.0.0/8");
        assert_eq!(slot_count(&pool, 16), 256);
        assert_eq!(subnet(&pool, 16, 0).unwrap().to_string(), "220.0.0.0/16");
        assert_eq!(subnet(&pool, 16, 255).unwrap().to_string(), "220.255.0.0/16");

        let pool6 = net("9470::/16");
        assert_eq!(slot_count(&pool6, 64), 1u128 << 48);
        assert_eq!(subnet(&pool6, 64, 1).unwrap().to_string(), "9470:0:0:1::/64");
    }

    #[test]
    fn test_supernet() {
        let cover = supernet(&[net("10.1.0.0/16"), net("10.2.0.0/16")]).unwrap();
        assert_eq!(cover.to_string(), "10.0.0.0/14");

        let single = supernet(&[net("10.2.0.0/16")]).unwrap();
        assert_eq!(single.to_string(), "10.2.0.0/16");

        assert!(supernet(&[net("10.2.0.0/16"), net("fd00::/64")]).is_none());
        assert!(supernet(&[]).is_none());
    }

    #[test]
    fn test_within() {
        assert!(within(&net("220.4.0.0/16"), &net("220.0.0.0/8")));
        assert!(!within(&net("220.0.0.0/8"), &net("220.4.0.0/16")));
        assert!(!within(&net("221.4.0.0/16"), &net("220.0.0.0/8")));
    }
}
