use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use crate::error::{Result, ScanError};

/// Detect local non-loopback IPv4 networks, each widened to a /24.
///
/// For example, an interface address `192.168.1.42` yields `192.168.1.0/24`.
pub fn detect_local_cidrs() -> Result<Vec<IpNet>> {
    let mut set = HashSet::<Ipv4Net>::new();
    for iface in get_if_addrs()? {
        if let IfAddr::V4(v4) = iface.addr {
            if v4.ip.is_loopback() || v4.ip.is_link_local() {
                continue;
            }
            set.insert(ipv4_to_default_cidr(v4.ip));
        }
    }
    let mut cidrs: Vec<Ipv4Net> = set.into_iter().collect();
    cidrs.sort_by_key(|n| (u32::from(n.network()), n.prefix_len()));
    Ok(cidrs.into_iter().map(IpNet::V4).collect())
}

/// Expand a CIDR block into the host addresses worth probing.
///
/// IPv4 blocks exclude the network and broadcast addresses, except /31 and
/// /32 which have none. IPv6 blocks are refused when they hold more than
/// `limit` addresses.
pub fn expand_cidr_to_ips(cidr: IpNet, limit: usize) -> Result<Vec<IpAddr>> {
    match cidr {
        IpNet::V4(n4) => {
            let count = 1u64 << (32 - n4.prefix_len());
            if count > limit as u64 + 2 {
                return Err(ScanError::Validation(format!(
                    "{cidr} expands to {count} addresses (limit {limit})"
                )));
            }
            Ok(expand_ipv4net_hosts(n4).into_iter().map(IpAddr::V4).collect())
        }
        IpNet::V6(n6) => expand_ipv6net_hosts(n6, limit),
    }
}

/// Helper: convert an IPv4 address into its default /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    Ipv4Net::new(Ipv4Addr::new(o[0], o[1], o[2], 0), 24).unwrap_or_else(|_| Ipv4Net::from(ip))
}

fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        return (start..=end).map(Ipv4Addr::from).collect();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}

fn expand_ipv6net_hosts(net: Ipv6Net, limit: usize) -> Result<Vec<IpAddr>> {
    let bits = 128 - u32::from(net.prefix_len());
    if bits >= 64 || (1u128 << bits) > limit as u128 {
        return Err(ScanError::Validation(format!(
            "{net} is too large to enumerate (limit {limit})"
        )));
    }
    Ok(net.hosts().map(IpAddr::V6).collect())
}
