//! Target specification parsing.
//!
//! A specification is a comma-separated list of fragments, each one of:
//! * a single address (`192.168.1.5`, `fd00::1`);
//! * a CIDR block (`192.168.1.0/24`), expanded to its usable hosts;
//! * an IPv4 range with a full or shorthand end (`10.0.0.1-10.0.0.9`, `10.0.0.1-9`);
//! * the keyword `lan`, expanded to the detected local /24 networks.
//!
//! Fragments are parsed independently. A malformed fragment is skipped with a
//! warning; only a specification that yields no address at all is an error.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::IpNet;
use tracing::warn;

use crate::error::{Result, ScanError};
use crate::netdetect;

/// Resolve a specification into an ordered, duplicate-free address list.
///
/// `limit` bounds the total number of addresses the specification may produce.
pub fn resolve(spec: &str, limit: usize) -> Result<Vec<IpAddr>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut rejected = Vec::new();

    for fragment in spec.split(',').map(str::trim).filter(|f| !f.is_empty()) {
        match parse_fragment(fragment, limit) {
            Ok(addrs) => {
                for addr in addrs {
                    if seen.insert(addr) {
                        out.push(addr);
                    }
                }
                if out.len() > limit {
                    return Err(ScanError::Validation(format!(
                        "'{spec}' expands to more than {limit} addresses"
                    )));
                }
            }
            Err(reason) => {
                warn!(fragment, %reason, "skipping malformed target fragment");
                rejected.push(format!("{fragment}: {reason}"));
            }
        }
    }

    if out.is_empty() {
        let detail = if rejected.is_empty() {
            "no targets given".to_string()
        } else {
            rejected.join("; ")
        };
        return Err(ScanError::Validation(format!("'{spec}' yields no addresses ({detail})")));
    }
    Ok(out)
}

fn parse_fragment(fragment: &str, limit: usize) -> std::result::Result<Vec<IpAddr>, String> {
    if fragment.eq_ignore_ascii_case("lan") {
        return lan_hosts(limit);
    }
    if let Ok(addr) = fragment.parse::<IpAddr>() {
        return Ok(vec![addr]);
    }
    if fragment.contains('/') {
        let net = fragment
            .parse::<IpNet>()
            .map_err(|e| format!("invalid CIDR: {e}"))?;
        return netdetect::expand_cidr_to_ips(net.trunc(), limit).map_err(|e| e.to_string());
    }
    if let Some((start, end)) = fragment.split_once('-') {
        return parse_range(start.trim(), end.trim(), limit);
    }
    Err("not an address, range or CIDR block".to_string())
}

fn lan_hosts(limit: usize) -> std::result::Result<Vec<IpAddr>, String> {
    let mut hosts = Vec::new();
    for net in netdetect::detect_local_cidrs().map_err(|e| e.to_string())? {
        hosts.extend(netdetect::expand_cidr_to_ips(net, limit).map_err(|e| e.to_string())?);
    }
    if hosts.is_empty() {
        return Err("no local IPv4 network detected".to_string());
    }
    Ok(hosts)
}

fn parse_range(start: &str, end: &str, limit: usize) -> std::result::Result<Vec<IpAddr>, String> {
    let start_addr = start
        .parse::<Ipv4Addr>()
        .map_err(|e| format!("invalid start address '{start}': {e}"))?;
    let end_addr = parse_range_end(end, start_addr)?;

    let (lo, hi) = (u32::from(start_addr), u32::from(end_addr));
    if lo > hi {
        return Err(format!("range end {end_addr} precedes start {start_addr}"));
    }
    if (hi - lo) as usize >= limit {
        return Err(format!("range holds more than {limit} addresses"));
    }
    Ok((lo..=hi).map(|n| IpAddr::V4(Ipv4Addr::from(n))).collect())
}

/// Parse the end of a range. A shorthand end replaces the trailing octets of
/// the start address: `192.168.1.10-50` ends at `192.168.1.50` and
/// `192.168.1.10-2.66` at `192.168.2.66`.
fn parse_range_end(end: &str, start: Ipv4Addr) -> std::result::Result<Ipv4Addr, String> {
    if let Ok(full) = end.parse::<Ipv4Addr>() {
        return Ok(full);
    }
    if end.is_empty() {
        return Err("range end is empty".to_string());
    }
    let partial = end
        .split('.')
        .map(str::parse::<u8>)
        .collect::<std::result::Result<Vec<u8>, _>>()
        .map_err(|e| format!("invalid range end '{end}': {e}"))?;
    if partial.len() > 3 {
        return Err(format!("range end has too many octets: {end}"));
    }

    let mut octets = start.octets();
    octets[4 - partial.len()..].copy_from_slice(&partial);
    Ok(Ipv4Addr::from(octets))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn shorthand_range_end() {
        let start = Ipv4Addr::new(192, 168, 1, 10);
        assert_eq!(parse_range_end("50", start), Ok(Ipv4Addr::new(192, 168, 1, 50)));
        assert_eq!(parse_range_end("2.66", start), Ok(Ipv4Addr::new(192, 168, 2, 66)));
        assert_eq!(parse_range_end("10.2.1", start), Ok(Ipv4Addr::new(192, 10, 2, 1)));
        assert_eq!(
            parse_range_end("192.168.1.60", start),
            Ok(Ipv4Addr::new(192, 168, 1, 60))
        );
        assert!(parse_range_end("2.256", start).is_err());
        assert!(parse_range_end("", start).is_err());
    }

    #[test]
    fn cidr_yields_usable_hosts() {
        let addrs = resolve("10.0.0.0/30", 1024).unwrap();
        assert_eq!(addrs, vec![v4(10, 0, 0, 1), v4(10, 0, 0, 2)]);
    }

    #[test]
    fn cidr_with_host_bits_is_truncated() {
        let addrs = resolve("10.0.0.3/30", 1024).unwrap();
        assert_eq!(addrs, vec![v4(10, 0, 0, 1), v4(10, 0, 0, 2)]);
    }

    #[test]
    fn shorthand_range_expands_inclusively() {
        let addrs = resolve("192.168.1.1-254", 1024).unwrap();
        assert_eq!(addrs.len(), 254);
        assert_eq!(addrs.first(), Some(&v4(192, 168, 1, 1)));
        assert_eq!(addrs.last(), Some(&v4(192, 168, 1, 254)));
    }

    #[test]
    fn comma_list_keeps_order_and_drops_duplicates() {
        let addrs = resolve("10.0.0.5, 10.0.0.1-3, 10.0.0.2, ::1", 1024).unwrap();
        assert_eq!(
            addrs,
            vec![
                v4(10, 0, 0, 5),
                v4(10, 0, 0, 1),
                v4(10, 0, 0, 2),
                v4(10, 0, 0, 3),
                "::1".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn malformed_fragment_is_skipped() {
        let addrs = resolve("10.0.0.1, bogus, 10.0.0.9-7, 10.0.0.2", 1024).unwrap();
        assert_eq!(addrs, vec![v4(10, 0, 0, 1), v4(10, 0, 0, 2)]);
    }

    #[test]
    fn wholly_malformed_spec_is_validation_error() {
        for spec in ["", "   ", "bogus", "10.0.0.1/33, nope", "300.1.1.1-5"] {
            let err = resolve(spec, 1024).unwrap_err();
            assert!(matches!(err, ScanError::Validation(_)), "{spec}: {err}");
        }
    }

    #[test]
    fn expansion_limit_is_enforced() {
        assert!(resolve("10.0.0.0/16", 1024).is_err());
        assert!(matches!(
            resolve("10.0.0.0/24, 10.0.1.0/24", 300),
            Err(ScanError::Validation(_))
        ));
    }
}
