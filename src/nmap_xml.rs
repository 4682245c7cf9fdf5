//! Structured report (`-oX`) model for the external scanner.
//!
//! Only the parts turned into [`HostProbeResult`]s are modelled; unknown
//! elements and attributes are ignored.

use std::net::IpAddr;

use serde::Deserialize;

use crate::error::{Result, ScanError};
use crate::probe::normalize_mac;
use crate::types::{HostProbeResult, PortInfo, Protocol};

#[derive(Debug, Deserialize)]
pub struct NmapRun {
    #[serde(rename = "host", default)]
    pub hosts: Vec<Host>,
    pub runstats: Option<RunStats>,
}

#[derive(Debug, Deserialize)]
pub struct Host {
    pub status: Status,
    #[serde(rename = "address", default)]
    pub addresses: Vec<Address>,
    pub hostnames: Option<Hostnames>,
    pub ports: Option<Ports>,
    pub os: Option<Os>,
    pub times: Option<Times>,
}

#[derive(Debug, Deserialize)]
pub struct Status {
    #[serde(rename = "@state")]
    pub state: String,
    #[serde(rename = "@reason_ttl")]
    pub reason_ttl: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct Address {
    #[serde(rename = "@addr")]
    pub addr: String,
    #[serde(rename = "@addrtype")]
    pub addr_type: String,
    #[serde(rename = "@vendor")]
    pub vendor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Hostnames {
    #[serde(rename = "hostname", default)]
    pub hostnames: Vec<Hostname>,
}

#[derive(Debug, Deserialize)]
pub struct Hostname {
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct Ports {
    #[serde(rename = "port", default)]
    pub ports: Vec<Port>,
}

#[derive(Debug, Deserialize)]
pub struct Port {
    #[serde(rename = "@protocol")]
    pub protocol: String,
    #[serde(rename = "@portid")]
    pub portid: u16,
    pub state: PortState,
    pub service: Option<Service>,
    #[serde(rename = "script", default)]
    pub scripts: Vec<Script>,
}

#[derive(Debug, Deserialize)]
pub struct PortState {
    #[serde(rename = "@state")]
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct Service {
    #[serde(rename = "@name")]
    pub name: Option<String>,
    #[serde(rename = "@product")]
    pub product: Option<String>,
    #[serde(rename = "@version")]
    pub version: Option<String>,
    #[serde(rename = "@extrainfo")]
    pub extrainfo: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Script {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@output")]
    pub output: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Os {
    #[serde(rename = "osmatch", default)]
    pub matches: Vec<OsMatch>,
}

#[derive(Debug, Deserialize)]
pub struct OsMatch {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@accuracy")]
    pub accuracy: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct Times {
    /// Smoothed round-trip time in microseconds.
    #[serde(rename = "@srtt")]
    pub srtt: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RunStats {
    pub finished: Option<Finished>,
}

#[derive(Debug, Deserialize)]
pub struct Finished {
    #[serde(rename = "@exit")]
    pub exit: Option<String>,
    #[serde(rename = "@errormsg")]
    pub errormsg: Option<String>,
}

/// Parse a report and convert it into one result per host with an address.
pub fn parse_report(xml: &str) -> Result<Vec<HostProbeResult>> {
    if xml.trim().is_empty() {
        return Err(ScanError::Adapter("scanner produced an empty report".into()));
    }
    let run: NmapRun = quick_xml::de::from_str(xml)
        .map_err(|e| ScanError::Adapter(format!("unreadable scanner report: {e}")))?;

    if let Some(finished) = run.runstats.as_ref().and_then(|s| s.finished.as_ref()) {
        if finished.exit.as_deref() == Some("error") {
            let msg = finished.errormsg.clone().unwrap_or_else(|| "unknown error".into());
            return Err(ScanError::Adapter(msg));
        }
    }

    Ok(run.hosts.iter().filter_map(Host::to_result).collect())
}

impl Host {
    fn to_result(&self) -> Option<HostProbeResult> {
        let address = self
            .addresses
            .iter()
            .filter(|a| a.addr_type == "ipv4" || a.addr_type == "ipv6")
            .find_map(|a| a.addr.parse::<IpAddr>().ok())?;

        let mut result = if self.status.state == "up" {
            HostProbeResult::up(address)
        } else {
            HostProbeResult::down(address)
        };

        if let Some(mac) = self.addresses.iter().find(|a| a.addr_type == "mac") {
            result.mac = normalize_mac(&mac.addr);
            result.vendor = mac.vendor.clone().filter(|v| !v.is_empty());
        }
        result.hostname = self
            .hostnames
            .as_ref()
            .and_then(|h| h.hostnames.first())
            .map(|h| h.name.clone());
        result.ttl = self
            .status
            .reason_ttl
            .filter(|ttl| *ttl > 0)
            .map(|ttl| ttl.min(255) as u8);
        result.latency_ms = self.times.as_ref().and_then(|t| t.srtt).map(|us| us / 1000);

        if let Some(best) = self
            .os
            .as_ref()
            .and_then(|os| os.matches.iter().max_by_key(|m| m.accuracy.unwrap_or(0)))
        {
            result.os_hint = Some(best.name.clone());
            result.os_accuracy = best.accuracy;
        }

        if let Some(ports) = &self.ports {
            result.open_ports = ports
                .ports
                .iter()
                .filter(|p| p.state.state == "open")
                .map(Port::to_info)
                .collect();
        }
        Some(result)
    }
}

impl Port {
    fn to_info(&self) -> PortInfo {
        let protocol = if self.protocol == "udp" {
            Protocol::Udp
        } else {
            Protocol::Tcp
        };
        let banner = self
            .scripts
            .iter()
            .find(|s| s.id == "banner")
            .and_then(|s| s.output.clone())
            .or_else(|| self.service.as_ref().and_then(Service::describe));
        PortInfo {
            port: self.portid,
            protocol,
            service: self.service.as_ref().and_then(|s| s.name.clone()),
            banner,
        }
    }
}

impl Service {
    /// `product version (extrainfo)` when any of them is known.
    fn describe(&self) -> Option<String> {
        let mut parts: Vec<String> = [&self.product, &self.version]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        if let Some(extra) = &self.extrainfo {
            parts.push(format!("({extra})"));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}
