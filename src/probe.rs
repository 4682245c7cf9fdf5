use std::net::{IpAddr, SocketAddr};
use std::process::{Output, Stdio};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{self, Instant};
use tracing::trace;

use crate::error::{Result, ScanError};
use crate::types::PortInfo;

/// What a successful echo reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PingReply {
    pub latency_ms: Option<u64>,
    pub ttl: Option<u8>,
}

/// Host-level probing primitives used by the worker pool.
///
/// Implementations report "no answer" as `Ok(None)`. An `Err` means the probe
/// itself could not be carried out; the pool treats both as a down host or a
/// missing enrichment field.
#[async_trait]
pub trait HostProber: Send + Sync {
    /// Verify the prober can run at all before any work is scheduled.
    async fn check(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self, addr: IpAddr, timeout: Duration) -> Result<Option<PingReply>>;

    /// Reverse lookup of the host name, abandoned after `timeout`.
    async fn hostname(&self, addr: IpAddr, timeout: Duration) -> Result<Option<String>>;

    /// Hardware address from the neighbor table, `aa:bb:cc:dd:ee:ff` form.
    async fn hardware_address(&self, addr: IpAddr, timeout: Duration) -> Result<Option<String>>;

    /// Bounded TCP connect. `Some` when the port accepted the connection.
    async fn tcp_probe(&self, addr: SocketAddr, timeout: Duration) -> Option<PortInfo>;
}

/// OS family guessed from the TTL of an echo reply.
pub fn os_hint_from_ttl(ttl: u8) -> &'static str {
    match ttl {
        0..=64 => "Linux/Unix",
        65..=128 => "Windows",
        _ => "networking gear/Cisco-like",
    }
}

/// Prober backed by the platform `ping` utility, the kernel neighbor table,
/// the system resolver and plain TCP connects.
#[derive(Debug, Clone, Default)]
pub struct SystemProber;

#[async_trait]
impl HostProber for SystemProber {
    async fn check(&self) -> Result<()> {
        which::which("ping")
            .map(|_| ())
            .map_err(|e| ScanError::Pool(format!("ping utility not available: {e}")))
    }

    async fn ping(&self, addr: IpAddr, timeout: Duration) -> Result<Option<PingReply>> {
        let mut cmd = Command::new("ping");
        cmd.args(ping_args(addr, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let started = Instant::now();
        let output = match time::timeout(timeout + Duration::from_secs(1), cmd.output()).await {
            Ok(res) => res?,
            Err(_) => return Ok(None),
        };
        if !output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut reply = parse_ping_output(&stdout).unwrap_or_default();
        if reply.latency_ms.is_none() {
            reply.latency_ms = Some(started.elapsed().as_millis() as u64);
        }
        Ok(Some(reply))
    }

    async fn hostname(&self, addr: IpAddr, timeout: Duration) -> Result<Option<String>> {
        let mut cmd = if cfg!(unix) {
            let mut cmd = Command::new("getent");
            cmd.args(["hosts", &addr.to_string()]);
            cmd
        } else {
            let mut cmd = Command::new("nslookup");
            cmd.arg(addr.to_string());
            cmd
        };
        let Some(output) = bounded_output(&mut cmd, timeout).await? else {
            trace!(%addr, "reverse lookup timed out");
            return Ok(None);
        };
        if !output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_hostname_output(&stdout, addr))
    }

    async fn hardware_address(&self, addr: IpAddr, timeout: Duration) -> Result<Option<String>> {
        if cfg!(target_os = "linux") {
            if let Ok(table) = tokio::fs::read_to_string("/proc/net/arp").await {
                return Ok(parse_proc_arp(&table, addr));
            }
        }
        let mut cmd = Command::new("arp");
        cmd.args(["-n", &addr.to_string()]);
        let Some(output) = bounded_output(&mut cmd, timeout).await? else {
            trace!(%addr, "neighbor lookup timed out");
            return Ok(None);
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(find_mac(&stdout))
    }

    async fn tcp_probe(&self, addr: SocketAddr, timeout: Duration) -> Option<PortInfo> {
        match time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                let mut info = PortInfo::tcp(addr.port());
                info.banner = read_banner(&mut stream).await;
                Some(info)
            }
            Ok(Err(e)) => {
                trace!(%addr, error = %e, "port closed");
                None
            }
            Err(_) => None,
        }
    }
}

/// Run a lookup helper to completion, or `None` once `limit` passes.
/// The child is killed when abandoned.
async fn bounded_output(cmd: &mut Command, limit: Duration) -> Result<Option<Output>> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    match time::timeout(limit, cmd.output()).await {
        Ok(res) => Ok(Some(res?)),
        Err(_) => Ok(None),
    }
}

fn ping_args(addr: IpAddr, timeout: Duration) -> Vec<String> {
    let ms = timeout.as_millis().max(1);
    let mut args: Vec<String> = Vec::new();
    if cfg!(windows) {
        args.extend(["-n".into(), "1".into(), "-w".into(), ms.to_string()]);
    } else if cfg!(target_os = "macos") {
        args.extend(["-n".into(), "-c".into(), "1".into(), "-W".into(), ms.to_string()]);
    } else {
        // iputils takes whole seconds.
        let secs = ms.div_ceil(1000);
        args.extend(["-n".into(), "-c".into(), "1".into(), "-W".into(), secs.to_string()]);
    }
    args.push(addr.to_string());
    args
}

fn ping_regexes() -> &'static (Regex, Regex) {
    static RE: OnceLock<(Regex, Regex)> = OnceLock::new();
    RE.get_or_init(|| {
        (
            Regex::new(r"(?i)\bttl[=:](\d+)").expect("valid ttl regex"),
            Regex::new(r"(?i)\btime[=<]\s*([\d.]+)\s*ms").expect("valid time regex"),
        )
    })
}

/// Extract TTL and round-trip time from `ping` output.
pub fn parse_ping_output(out: &str) -> Option<PingReply> {
    let (ttl_re, time_re) = ping_regexes();
    let ttl = ttl_re
        .captures(out)
        .and_then(|c| c[1].parse::<u16>().ok())
        .map(|t| t.min(255) as u8);
    let latency_ms = time_re
        .captures(out)
        .and_then(|c| c[1].parse::<f64>().ok())
        .map(|t| t.round() as u64);
    if ttl.is_none() && latency_ms.is_none() {
        return None;
    }
    Some(PingReply { latency_ms, ttl })
}

/// Host name from `getent hosts` (`<addr> <name> [aliases]`) or `nslookup`
/// (`... name = <name>.`) output.
pub fn parse_hostname_output(out: &str, addr: IpAddr) -> Option<String> {
    let addr_s = addr.to_string();
    for line in out.lines() {
        if let Some((_, name)) = line.split_once("name =") {
            let name = name.trim().trim_end_matches('.');
            if !name.is_empty() && name != addr_s {
                return Some(name.to_string());
            }
        }
        let mut cols = line.split_whitespace();
        if cols.next() == Some(addr_s.as_str()) {
            if let Some(name) = cols.next() {
                return Some(name.trim_end_matches('.').to_string());
            }
        }
    }
    None
}

/// Look an address up in `/proc/net/arp`. Incomplete entries are ignored.
pub fn parse_proc_arp(table: &str, addr: IpAddr) -> Option<String> {
    let addr_s = addr.to_string();
    table.lines().skip(1).find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() >= 4 && cols[0] == addr_s {
            normalize_mac(cols[3])
        } else {
            None
        }
    })
}

fn find_mac(out: &str) -> Option<String> {
    out.split_whitespace().find_map(normalize_mac)
}

/// Canonical lowercase colon form; `None` for malformed or all-zero addresses.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw.split([':', '-']).collect();
    if parts.len() != 6 {
        return None;
    }
    let mut bytes = [0u8; 6];
    for (b, p) in bytes.iter_mut().zip(&parts) {
        if p.is_empty() || p.len() > 2 {
            return None;
        }
        *b = u8::from_str_radix(p, 16).ok()?;
    }
    if bytes == [0u8; 6] {
        return None;
    }
    Some(
        bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

/// Try to read up to 256 bytes from the stream with a short timeout and convert to a lossy UTF-8 string.
async fn read_banner(stream: &mut TcpStream) -> Option<String> {
    let mut buf = vec![0u8; 256];
    match time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            let s = String::from_utf8_lossy(&buf).trim().to_string();
            Some(s.replace('\n', "\\n").replace('\r', "\\r"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_lookup_helpers_are_abandoned() {
        let started = Instant::now();
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let out = bounded_output(&mut cmd, Duration::from_millis(100)).await.unwrap();
        assert!(out.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));

        let mut cmd = Command::new("echo");
        cmd.arg("10.0.0.1 nas.lan");
        let out = bounded_output(&mut cmd, Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(out.status.success());
        let stdout = String::from_utf8_lossy(&out.stdout);
        let name = parse_hostname_output(&stdout, "10.0.0.1".parse().unwrap());
        assert_eq!(name.as_deref(), Some("nas.lan"));
    }

    #[test]
    fn ttl_threshold_table() {
        assert_eq!(os_hint_from_ttl(64), "Linux/Unix");
        assert_eq!(os_hint_from_ttl(1), "Linux/Unix");
        assert_eq!(os_hint_from_ttl(65), "Windows");
        assert_eq!(os_hint_from_ttl(128), "Windows");
        assert_eq!(os_hint_from_ttl(200), "networking gear/Cisco-like");
        assert_eq!(os_hint_from_ttl(255), "networking gear/Cisco-like");
    }

    #[test]
    fn parses_linux_ping() {
        let out = "PING 10.0.0.1 (10.0.0.1) 56(84) bytes of data.\n\
                   64 bytes from 10.0.0.1: icmp_seq=1 ttl=63 time=1.84 ms\n";
        assert_eq!(
            parse_ping_output(out),
            Some(PingReply { latency_ms: Some(2), ttl: Some(63) })
        );
    }

    #[test]
    fn parses_windows_ping() {
        let out = "Reply from 10.0.0.1: bytes=32 time<1ms TTL=128\n";
        assert_eq!(
            parse_ping_output(out),
            Some(PingReply { latency_ms: Some(1), ttl: Some(128) })
        );
        assert_eq!(parse_ping_output("Request timed out."), None);
    }

    #[test]
    fn parses_hostnames() {
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(
            parse_hostname_output("10.0.0.7       printer.lan printer\n", addr),
            Some("printer.lan".to_string())
        );
        assert_eq!(
            parse_hostname_output("7.0.0.10.in-addr.arpa\tname = nas.lan.\n", addr),
            Some("nas.lan".to_string())
        );
        assert_eq!(parse_hostname_output("", addr), None);
    }

    #[test]
    fn parses_proc_arp() {
        let table = "IP address       HW type     Flags       HW address            Mask     Device\n\
                     192.168.1.1      0x1         0x2         AA:BB:CC:00:11:22     *        eth0\n\
                     192.168.1.9      0x1         0x0         00:00:00:00:00:00     *        eth0\n";
        let gw = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        let stale = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9));
        assert_eq!(parse_proc_arp(table, gw), Some("aa:bb:cc:00:11:22".to_string()));
        assert_eq!(parse_proc_arp(table, stale), None);
    }

    #[test]
    fn normalizes_mac_forms() {
        assert_eq!(normalize_mac("A-B-C-D-E-F"), Some("0a:0b:0c:0d:0e:0f".to_string()));
        assert_eq!(normalize_mac("zz:bb:cc:dd:ee:ff"), None);
        assert_eq!(
            find_mac("? (10.0.0.1) at 3c:22:fb:1:2:3 on en0"),
            Some("3c:22:fb:01:02:03".to_string())
        );
    }
}
