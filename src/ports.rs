use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::{Result, ScanError};
use crate::types::{ScanOptions, ScanStrategy};

/// Parse a port list into a deduplicated list of TCP ports (1..=65535).
///
/// Entries are separated by commas or newlines. Each entry is a single port
/// (`80`) or an inclusive range (`8000-8010`). Everything after `#` on a line
/// is ignored, as are blank entries.
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().unwrap_or("");
        for entry in line.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if let Some((a, b)) = entry.split_once('-') {
                let start = parse_port_str(a.trim())
                    .map_err(|e| invalid(line_no, format!("invalid start in range {entry}: {e}")))?;
                let end = parse_port_str(b.trim())
                    .map_err(|e| invalid(line_no, format!("invalid end in range {entry}: {e}")))?;
                if start > end {
                    return Err(invalid(line_no, format!("invalid range {start}-{end} (start > end)")));
                }
                for p in start..=end {
                    if seen.insert(p) {
                        out.push(p);
                    }
                }
                continue;
            }

            let p = parse_port_str(entry)
                .map_err(|e| invalid(line_no, format!("invalid port value {entry}: {e}")))?;
            if seen.insert(p) {
                out.push(p);
            }
        }
    }

    Ok(out)
}

/// Load a port list from a file. Errors if the file cannot be read or parsed.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        ScanError::Validation(format!("failed to read ports file {}: {e}", path.display()))
    })?;
    parse_ports_str(&content)
}

/// Ports for a named profile: `common`, `web`, `top-100` or `all`.
pub fn profile_ports(name: &str) -> Option<Vec<u16>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "common" | "default" => Some(default_ports()),
        "web" => Some(WEB.to_vec()),
        "top-100" | "top100" => Some(TOP_100.to_vec()),
        "all" => Some((1..=u16::MAX).collect()),
        _ => None,
    }
}

/// Ports probed by the built-in pool for a job. Empty for a ping sweep unless
/// the caller asked for ports explicitly.
pub fn ports_for(strategy: ScanStrategy, options: &ScanOptions) -> Result<Vec<u16>> {
    if let Some(list) = options.ports.as_deref() {
        let ports = parse_ports_str(list)?;
        if ports.is_empty() {
            return Err(ScanError::Validation(format!("port list '{list}' is empty")));
        }
        return Ok(ports);
    }
    if let Some(profile) = options.port_profile.as_deref() {
        return profile_ports(profile)
            .ok_or_else(|| ScanError::Validation(format!("unknown port profile: {profile}")));
    }
    Ok(match strategy {
        ScanStrategy::PingSweep => Vec::new(),
        ScanStrategy::DeepScan => TOP_100.to_vec(),
        _ => default_ports(),
    })
}

/// IANA service name for well-known TCP ports.
pub fn service_name(port: u16) -> Option<&'static str> {
    let name = match port {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 => "smtp",
        53 => "domain",
        80 => "http",
        110 => "pop3",
        135 => "msrpc",
        139 => "netbios-ssn",
        143 => "imap",
        161 => "snmp",
        389 => "ldap",
        443 => "https",
        445 => "microsoft-ds",
        515 => "printer",
        587 => "submission",
        631 => "ipp",
        993 => "imaps",
        995 => "pop3s",
        1433 => "ms-sql-s",
        1521 => "oracle",
        1723 => "pptp",
        1883 => "mqtt",
        2049 => "nfs",
        3306 => "mysql",
        3389 => "ms-wbt-server",
        5432 => "postgresql",
        5900 => "vnc",
        5985 => "wsman",
        6379 => "redis",
        8000 | 8080 | 8008 => "http-alt",
        8443 => "https-alt",
        9100 => "jetdirect",
        _ => return None,
    };
    Some(name)
}

/// A conservative list of commonly used TCP ports.
pub fn default_ports() -> Vec<u16> {
    const DEFAULT: &[u16] = &[
        21, 22, 23, 25, 53, 80, 110, 135, 139, 143, 161, 389, 443, 445, 515, 587, 631, 993, 995,
        1433, 1521, 1723, 1883, 2049, 3306, 3389, 5432, 5900, 5985, 6379, 8000, 8080, 8443, 9100,
    ];
    DEFAULT.to_vec()
}

const WEB: &[u16] = &[80, 443, 591, 593, 8000, 8008, 8080, 8081, 8088, 8443, 8888, 9443];

pub const TOP_100: &[u16] = &[
    7, 9, 13, 21, 22, 23, 25, 26, 37, 53, 79, 80, 81, 88, 106, 110, 111, 113, 119, 135, 139, 143,
    144, 179, 199, 389, 427, 443, 444, 445, 465, 513, 514, 515, 543, 544, 548, 554, 587, 631, 646,
    873, 990, 993, 995, 1025, 1026, 1027, 1028, 1029, 1110, 1433, 1720, 1723, 1755, 1900, 2000,
    2001, 2049, 2121, 2717, 3000, 3128, 3306, 3389, 3986, 4899, 5000, 5009, 5051, 5060, 5101, 5190,
    5357, 5432, 5631, 5666, 5800, 5900, 6000, 6001, 6646, 7070, 8000, 8008, 8009, 8080, 8081, 8443,
    8888, 9100, 9999, 10000, 32768, 49152, 49153, 49154, 49155, 49156, 49157,
];

fn parse_port_str(s: &str) -> std::result::Result<u16, String> {
    let val: u32 = s.parse::<u32>().map_err(|e| e.to_string())?;
    if val == 0 || val > 65535 {
        return Err(format!("port out of range: {val}"));
    }
    Ok(val as u16)
}

fn invalid(line_no: usize, msg: String) -> ScanError {
    ScanError::Validation(format!("line {line_no}: {msg}"))
}
