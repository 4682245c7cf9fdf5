use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Opaque scan job identifier.
pub type JobId = Uuid;

/// The scanning approach selected for a job.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ScanStrategy {
    #[default]
    PingSweep,
    PortScan,
    DeepScan,
    StealthScan,
    FingerprintScan,
}

impl ScanStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStrategy::PingSweep => "ping-sweep",
            ScanStrategy::PortScan => "port-scan",
            ScanStrategy::DeepScan => "deep-scan",
            ScanStrategy::StealthScan => "stealth-scan",
            ScanStrategy::FingerprintScan => "fingerprint-scan",
        }
    }
}

impl fmt::Display for ScanStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "ping-sweep" | "ping" => Ok(ScanStrategy::PingSweep),
            "port-scan" | "ports" => Ok(ScanStrategy::PortScan),
            "deep-scan" | "deep" => Ok(ScanStrategy::DeepScan),
            "stealth-scan" | "stealth" => Ok(ScanStrategy::StealthScan),
            "fingerprint-scan" | "fingerprint" => Ok(ScanStrategy::FingerprintScan),
            other => Err(format!("unknown scan strategy: {other}")),
        }
    }
}

/// Job lifecycle state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Created,
    Starting,
    Running,
    /// Cancellation accepted; waiting for in-flight work to drain.
    Stopping,
    Completed,
    Stopped,
    Error,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Stopped | ScanStatus::Error
        )
    }
}

/// Which component executes a job's probes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Pool,
    External,
}

/// Host discovery method requested from the external scanner.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMethod {
    #[default]
    Default,
    Icmp,
    Arp,
    TcpSyn,
    TcpAck,
    Udp,
    /// Skip discovery and treat every target as up.
    None,
}

impl FromStr for DiscoveryMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(DiscoveryMethod::Default),
            "icmp" => Ok(DiscoveryMethod::Icmp),
            "arp" => Ok(DiscoveryMethod::Arp),
            "tcp-syn" | "syn" => Ok(DiscoveryMethod::TcpSyn),
            "tcp-ack" | "ack" => Ok(DiscoveryMethod::TcpAck),
            "udp" => Ok(DiscoveryMethod::Udp),
            "none" => Ok(DiscoveryMethod::None),
            other => Err(format!("unknown discovery method: {other}")),
        }
    }
}

/// Port scan technique requested from the external scanner.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ScanTechnique {
    #[default]
    Connect,
    Syn,
    Ack,
    Udp,
    Fin,
    Null,
    Xmas,
}

impl FromStr for ScanTechnique {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "connect" => Ok(ScanTechnique::Connect),
            "syn" => Ok(ScanTechnique::Syn),
            "ack" => Ok(ScanTechnique::Ack),
            "udp" => Ok(ScanTechnique::Udp),
            "fin" => Ok(ScanTechnique::Fin),
            "null" => Ok(ScanTechnique::Null),
            "xmas" => Ok(ScanTechnique::Xmas),
            other => Err(format!("unknown scan technique: {other}")),
        }
    }
}

/// Per-scan options accepted by `start_scan`. Unset numeric fields fall back to
/// the engine configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ScanOptions {
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub concurrency: Option<usize>,
    /// Explicit port list, e.g. `22,80,8000-8010`.
    pub ports: Option<String>,
    /// Named port profile (`common`, `web`, `top-100`, `all`).
    pub port_profile: Option<String>,
    pub os_detection: bool,
    pub service_detection: bool,
    /// Script category for the external scanner, e.g. `default` or `vuln`.
    pub scripts: Option<String>,
    pub discovery: DiscoveryMethod,
    pub technique: ScanTechnique,
    /// Timing aggressiveness, 0 (paranoid) to 5 (insane).
    pub timing: Option<u8>,
    pub skip_hostnames: bool,
}

impl ScanOptions {
    /// True when any requested capability is beyond the built-in probe pool.
    pub fn needs_external(&self) -> bool {
        self.os_detection
            || self.service_detection
            || self.scripts.is_some()
            || self.discovery != DiscoveryMethod::Default
            || self.technique != ScanTechnique::Connect
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// One open port observed on a host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub port: u16,
    pub protocol: Protocol,
    pub service: Option<String>,
    pub banner: Option<String>,
}

impl PortInfo {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
            service: None,
            banner: None,
        }
    }
}

/// Result of probing a single address. Never mutated after construction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HostProbeResult {
    pub address: IpAddr,
    pub alive: bool,
    pub latency_ms: Option<u64>,
    pub ttl: Option<u8>,
    pub hostname: Option<String>,
    pub mac: Option<String>,
    pub vendor: Option<String>,
    pub os_hint: Option<String>,
    pub os_accuracy: Option<u8>,
    pub open_ports: Vec<PortInfo>,
    /// Minimal record surfaced from the external scanner's live output.
    pub interim: bool,
}

impl HostProbeResult {
    pub fn down(address: IpAddr) -> Self {
        Self {
            address,
            alive: false,
            latency_ms: None,
            ttl: None,
            hostname: None,
            mac: None,
            vendor: None,
            os_hint: None,
            os_accuracy: None,
            open_ports: Vec::new(),
            interim: false,
        }
    }

    pub fn up(address: IpAddr) -> Self {
        Self {
            alive: true,
            ..Self::down(address)
        }
    }
}

/// Canonical inventory entry for one device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub id: Uuid,
    pub address: IpAddr,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub os: Option<String>,
    pub open_ports: Vec<PortInfo>,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub last_job: Option<JobId>,
}

/// Point-in-time view of a scan job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanJob {
    pub id: JobId,
    pub target_spec: String,
    pub strategy: ScanStrategy,
    pub options: ScanOptions,
    pub status: ScanStatus,
    pub backend: Option<Backend>,
    pub resolved_count: usize,
    pub probed: u64,
    pub total: u64,
    pub devices_found: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub error: Option<String>,
}

impl ScanJob {
    pub fn new(target_spec: &str, strategy: ScanStrategy, options: ScanOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_spec: target_spec.to_string(),
            strategy,
            options,
            status: ScanStatus::Created,
            backend: None,
            resolved_count: 0,
            probed: 0,
            total: 0,
            devices_found: 0,
            created_at: OffsetDateTime::now_utc(),
            started_at: None,
            ended_at: None,
            error: None,
        }
    }
}
