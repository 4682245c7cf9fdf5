//! Delegation to an external `nmap` executable.
//!
//! The adapter turns scan options into an argument list, runs the scanner as
//! a subprocess with its structured report redirected to a temporary file, and
//! watches the human-readable output for discovered hosts and percent-done
//! markers. Those live signals are best effort; the structured report parsed
//! after a clean exit is authoritative.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Result, ScanError};
use crate::nmap_xml;
use crate::ports;
use crate::types::{
    DiscoveryMethod, HostProbeResult, PortInfo, Protocol, ScanOptions, ScanStrategy, ScanTechnique,
};

/// Upper bound on captured stderr.
const MAX_STDERR_BYTES: u64 = 64 * 1024;

/// Interim observations scraped from the scanner's console output.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterSignal {
    /// A host seen for the first time, with whatever the line carried.
    HostDiscovered(HostProbeResult),
    /// Overall completion, 0.0 to 100.0.
    Percent(f64),
}

/// How a scanner run ended.
#[derive(Debug)]
pub enum NmapOutcome {
    Finished(Vec<HostProbeResult>),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct NmapScanner {
    program: PathBuf,
    work_dir: PathBuf,
    grace_period: Duration,
}

impl NmapScanner {
    pub fn new(program: impl Into<PathBuf>, work_dir: impl Into<PathBuf>, grace_period: Duration) -> Self {
        Self {
            program: program.into(),
            work_dir: work_dir.into(),
            grace_period,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.nmap_path.clone(), config.work_dir(), config.grace_period())
    }

    /// Run the scanner over `targets`.
    ///
    /// Temporary files are removed on every path out of this function.
    pub async fn run(
        &self,
        targets: &[IpAddr],
        strategy: ScanStrategy,
        options: &ScanOptions,
        cancel: CancellationToken,
        signals: mpsc::Sender<AdapterSignal>,
    ) -> Result<NmapOutcome> {
        let program = which::which(&self.program).map_err(|e| {
            ScanError::Adapter(format!("{} not found: {e}", self.program.display()))
        })?;

        let ipv6 = ipv6_targets(targets)?;
        let target_list = temp_path(&self.work_dir, ".targets")?;
        let report = temp_path(&self.work_dir, ".xml")?;
        let list: String = targets.iter().map(|t| format!("{t}\n")).collect();
        tokio::fs::write(&target_list, list).await?;

        let args = build_args(strategy, options, ipv6, &report, &target_list);
        info!(program = %program.display(), args = %args.join(" "), "launching external scanner");

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScanError::Adapter(format!("failed to launch {}: {e}", program.display())))?;

        let stderr_task = tokio::spawn(read_capped(child.stderr.take()));
        let Some(stdout) = child.stdout.take() else {
            return Err(ScanError::Adapter("scanner stdout unavailable".into()));
        };
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.terminate(&mut child).await;
                    return Ok(NmapOutcome::Cancelled);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(signal) = parse_console_line(&line) {
                            let _ = signals.send(signal).await;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "stopped reading scanner output");
                        break;
                    }
                }
            }
        }

        let waited = tokio::select! {
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let Some(status) = waited else {
            self.terminate(&mut child).await;
            return Ok(NmapOutcome::Cancelled);
        };
        let status = status?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let detail = stderr.trim();
            return Err(ScanError::Adapter(if detail.is_empty() {
                format!("scanner exited with {status}")
            } else {
                format!("scanner exited with {status}: {detail}")
            }));
        }

        let xml = tokio::fs::read_to_string(&report)
            .await
            .map_err(|e| ScanError::Adapter(format!("scanner report unreadable: {e}")))?;
        let results = nmap_xml::parse_report(&xml)?;
        debug!(hosts = results.len(), "parsed scanner report");
        Ok(NmapOutcome::Finished(results))
    }

    /// Ask the scanner to exit, then kill it once the grace period runs out.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM not delivered");
            }
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(_) => debug!("scanner exited after stop request"),
            Err(_) => {
                warn!(
                    grace_ms = self.grace_period.as_millis() as u64,
                    "scanner ignored stop request, killing it"
                );
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill scanner");
                }
            }
        }
    }
}

fn temp_path(dir: &Path, suffix: &str) -> Result<tempfile::TempPath> {
    Ok(tempfile::Builder::new()
        .prefix("netscan-")
        .suffix(suffix)
        .tempfile_in(dir)?
        .into_temp_path())
}

async fn read_capped<R: AsyncRead + Unpin>(handle: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.take(MAX_STDERR_BYTES).read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Whether `targets` need the scanner's IPv6 mode.
///
/// One scanner run handles a single address family, so a mixed list is
/// rejected.
pub fn ipv6_targets(targets: &[IpAddr]) -> Result<bool> {
    let v6 = targets.iter().filter(|t| t.is_ipv6()).count();
    if v6 == 0 {
        Ok(false)
    } else if v6 == targets.len() {
        Ok(true)
    } else {
        Err(ScanError::Validation(
            "the external scanner cannot mix IPv4 and IPv6 targets in one job".into(),
        ))
    }
}

/// Build the scanner argument list.
pub fn build_args(
    strategy: ScanStrategy,
    options: &ScanOptions,
    ipv6: bool,
    report: &Path,
    target_list: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-v".into(), "--stats-every".into(), "2s".into()];
    if ipv6 {
        args.push("-6".into());
    }

    let default_timing = if strategy == ScanStrategy::StealthScan { 2 } else { 4 };
    args.push(format!("-T{}", options.timing.unwrap_or(default_timing).min(5)));

    match options.discovery {
        DiscoveryMethod::Default => {}
        DiscoveryMethod::Icmp => args.push("-PE".into()),
        DiscoveryMethod::Arp => args.push("-PR".into()),
        DiscoveryMethod::TcpSyn => args.push("-PS".into()),
        DiscoveryMethod::TcpAck => args.push("-PA".into()),
        DiscoveryMethod::Udp => args.push("-PU".into()),
        DiscoveryMethod::None => args.push("-Pn".into()),
    }

    let fingerprint = strategy == ScanStrategy::FingerprintScan;
    let os_detection = options.os_detection || fingerprint;
    let service_detection = options.service_detection || fingerprint;
    let host_only = strategy == ScanStrategy::PingSweep
        && options.ports.is_none()
        && options.port_profile.is_none()
        && options.technique == ScanTechnique::Connect
        && !os_detection
        && !service_detection
        && options.scripts.is_none();

    if host_only {
        args.push("-sn".into());
    } else {
        args.push(
            match options.technique {
                ScanTechnique::Connect if strategy == ScanStrategy::StealthScan => "-sS",
                ScanTechnique::Connect => "-sT",
                ScanTechnique::Syn => "-sS",
                ScanTechnique::Ack => "-sA",
                ScanTechnique::Udp => "-sU",
                ScanTechnique::Fin => "-sF",
                ScanTechnique::Null => "-sN",
                ScanTechnique::Xmas => "-sX",
            }
            .into(),
        );
        args.extend(port_selection(strategy, options));
        if os_detection {
            args.push("-O".into());
        }
        if service_detection {
            args.push("-sV".into());
        }
        if let Some(category) = options.scripts.as_deref().filter(|c| !c.is_empty()) {
            args.push("--script".into());
            args.push(category.to_string());
        }
    }

    args.push("-oX".into());
    args.push(report.display().to_string());
    args.push("-iL".into());
    args.push(target_list.display().to_string());
    args
}

fn port_selection(strategy: ScanStrategy, options: &ScanOptions) -> Vec<String> {
    if let Some(list) = options.ports.as_deref() {
        return vec!["-p".into(), list.replace(' ', "")];
    }
    match options.port_profile.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("all") => return vec!["-p-".into()],
        Some("top-100") | Some("top100") => return vec!["-F".into()],
        Some(profile) => {
            if let Some(list) = ports::profile_ports(profile) {
                let joined = list.iter().map(u16::to_string).collect::<Vec<_>>().join(",");
                return vec!["-p".into(), joined];
            }
        }
        None => {}
    }
    match strategy {
        ScanStrategy::FingerprintScan => vec!["-F".into()],
        ScanStrategy::DeepScan => vec!["--top-ports".into(), ports::TOP_100.len().to_string()],
        _ => Vec::new(),
    }
}

struct ConsolePatterns {
    open_port: Regex,
    report: Regex,
    percent: Regex,
}

fn patterns() -> &'static ConsolePatterns {
    static RE: OnceLock<ConsolePatterns> = OnceLock::new();
    RE.get_or_init(|| ConsolePatterns {
        open_port: Regex::new(r"^Discovered open port (\d+)/(tcp|udp) on (\S+)")
            .expect("valid open-port regex"),
        report: Regex::new(r"^Nmap scan report for (?:(\S+) \(([^)]+)\)|(\S+))\s*(\[host down\])?")
            .expect("valid report regex"),
        percent: Regex::new(r"About (\d+(?:\.\d+)?)% done").expect("valid percent regex"),
    })
}

/// Recognize a live-output line worth surfacing.
pub fn parse_console_line(line: &str) -> Option<AdapterSignal> {
    let re = patterns();
    let line = line.trim();

    if let Some(c) = re.open_port.captures(line) {
        let address: IpAddr = c[3].parse().ok()?;
        let mut host = HostProbeResult::up(address);
        host.interim = true;
        host.open_ports.push(PortInfo {
            port: c[1].parse().ok()?,
            protocol: if &c[2] == "udp" { Protocol::Udp } else { Protocol::Tcp },
            service: None,
            banner: None,
        });
        return Some(AdapterSignal::HostDiscovered(host));
    }

    if let Some(c) = re.report.captures(line) {
        if c.get(4).is_some() {
            return None;
        }
        let (hostname, addr) = match (c.get(1), c.get(2), c.get(3)) {
            (Some(name), Some(addr), _) => (Some(name.as_str().to_string()), addr.as_str()),
            (_, _, Some(addr)) => (None, addr.as_str()),
            _ => return None,
        };
        let address: IpAddr = addr.parse().ok()?;
        let mut host = HostProbeResult::up(address);
        host.interim = true;
        host.hostname = hostname;
        return Some(AdapterSignal::HostDiscovered(host));
    }

    re.percent
        .captures(line)
        .and_then(|c| c[1].parse::<f64>().ok())
        .map(|pct| AdapterSignal::Percent(pct.clamp(0.0, 100.0)))
}
