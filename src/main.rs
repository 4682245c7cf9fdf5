use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netscan::config::EngineConfig;
use netscan::events::ScanEvent;
use netscan::inventory::{Inventory, MemoryInventory};
use netscan::types::{
    DeviceRecord, DiscoveryMethod, ScanOptions, ScanStatus, ScanStrategy, ScanTechnique,
};
use netscan::{ports, server, ScanManager};

/// Discover hosts on a network, probe their ports and keep a device inventory.
#[derive(Debug, Clone, Parser)]
#[command(name = "netscan", version, long_about = None)]
struct Cli {
    /// Targets: addresses, ranges (10.0.0.1-50), CIDR blocks, or `lan`; comma separated.
    #[arg(long, default_value = "lan")]
    targets: String,

    /// ping-sweep, port-scan, deep-scan, stealth-scan or fingerprint-scan.
    #[arg(long, default_value = "ping-sweep")]
    strategy: ScanStrategy,

    /// Port list for the port pass, e.g. `22,80,8000-8010`.
    #[arg(long)]
    ports: Option<String>,

    /// Read the port list from a file (one entry per line, `#` comments).
    #[arg(long = "ports-file", conflicts_with = "ports")]
    ports_file: Option<PathBuf>,

    /// Named port profile: common, web, top-100 or all.
    #[arg(long = "port-profile")]
    port_profile: Option<String>,

    /// Max concurrent host probes.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Per-probe timeout in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Extra echo attempts per host.
    #[arg(long)]
    retries: Option<u32>,

    /// Request OS fingerprinting (uses the external scanner).
    #[arg(long = "os-detection", default_value_t = false)]
    os_detection: bool,

    /// Request service/version detection (uses the external scanner).
    #[arg(long = "service-detection", default_value_t = false)]
    service_detection: bool,

    /// Script category for the external scanner.
    #[arg(long)]
    scripts: Option<String>,

    /// Discovery method: default, icmp, arp, tcp-syn, tcp-ack, udp, none.
    #[arg(long, default_value = "default")]
    discovery: DiscoveryMethod,

    /// Scan technique: connect, syn, ack, udp, fin, null, xmas.
    #[arg(long, default_value = "connect")]
    technique: ScanTechnique,

    /// Timing aggressiveness for the external scanner (0-5).
    #[arg(long)]
    timing: Option<u8>,

    /// Skip reverse DNS lookups.
    #[arg(long = "no-hostnames", default_value_t = false)]
    no_hostnames: bool,

    /// Engine configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Inventory JSON file, loaded before and saved after the scan.
    #[arg(long)]
    inventory: Option<PathBuf>,

    /// Write the finished job and its devices as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve the JSON API on this address instead of running a single scan.
    #[arg(long)]
    serve: Option<String>,
}

impl Cli {
    fn scan_options(&self) -> Result<ScanOptions> {
        let ports = match self.ports_file.as_deref() {
            Some(path) => {
                let list = ports::load_ports_from_path(path)
                    .with_context(|| format!("loading ports from {}", path.display()))?;
                if list.is_empty() {
                    bail!("no ports listed in {}", path.display());
                }
                Some(list.iter().map(u16::to_string).collect::<Vec<_>>().join(","))
            }
            None => self.ports.clone(),
        };
        Ok(ScanOptions {
            timeout_ms: self.timeout_ms,
            retries: self.retries,
            concurrency: self.concurrency,
            ports,
            port_profile: self.port_profile.clone(),
            os_detection: self.os_detection,
            service_detection: self.service_detection,
            scripts: self.scripts.clone(),
            discovery: self.discovery,
            technique: self.technique,
            timing: self.timing,
            skip_hostnames: self.no_hostnames,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netscan=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let inventory = Arc::new(match cli.inventory.as_deref() {
        Some(path) => MemoryInventory::load_json(path)
            .with_context(|| format!("loading inventory {}", path.display()))?,
        None => MemoryInventory::new(),
    });
    let manager = ScanManager::with_system_prober(config, inventory.clone());

    if let Some(bind) = cli.serve.as_deref() {
        tokio::select! {
            res = server::spawn_server(bind, manager.clone()) => res?,
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
        }
        save_inventory(&cli, &inventory).await?;
        return Ok(());
    }

    let options = cli.scan_options()?;
    let mut events = manager.events().subscribe();
    let id = manager
        .start_scan(&cli.targets, cli.strategy, options)
        .await
        .context("scan rejected")?;

    let stopper = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping scan");
            stopper.stop_scan(id).await;
        }
    });

    loop {
        match events.recv().await {
            Ok(ScanEvent::DeviceFound { device, .. }) => {
                println!("  found {:<39} {}", device.address, device.hostname.as_deref().unwrap_or("-"));
            }
            Ok(event) if event.is_terminal() && event.job_id() == id => break,
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "event stream lagged"),
            Err(RecvError::Closed) => break,
        }
    }

    let job = manager
        .wait(id)
        .await
        .context("scan job disappeared from the registry")?;
    let devices: Vec<DeviceRecord> = inventory
        .all()
        .await?
        .into_iter()
        .filter(|d| d.last_job == Some(id))
        .collect();

    print_devices_table(&devices);
    println!(
        "\n{} {}: {} of {} probed, {} device(s) found",
        job.strategy, job.target_spec, job.probed, job.total, job.devices_found
    );

    if let Some(path) = cli.output.as_deref() {
        let file = std::fs::File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(file, &serde_json::json!({ "job": job, "devices": devices }))?;
        info!(path = %path.display(), "wrote results");
    }
    save_inventory(&cli, &inventory).await?;

    match job.status {
        ScanStatus::Error => bail!(job.error.unwrap_or_else(|| "scan failed".into())),
        ScanStatus::Stopped => {
            warn!("scan stopped before completion");
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn save_inventory(cli: &Cli, inventory: &MemoryInventory) -> Result<()> {
    if let Some(path) = cli.inventory.as_deref() {
        inventory
            .save_json(path)
            .await
            .with_context(|| format!("saving inventory {}", path.display()))?;
    }
    Ok(())
}

fn print_devices_table(devices: &[DeviceRecord]) {
    let addr_w = devices
        .iter()
        .map(|d| d.address.to_string().len())
        .max()
        .unwrap_or(0)
        .max("address".len());
    let host_w = devices
        .iter()
        .map(|d| d.hostname.as_deref().unwrap_or("-").chars().count().min(32))
        .max()
        .unwrap_or(0)
        .max("hostname".len());

    println!(
        "\n{:<addr_w$}  {:<17}  {:<host_w$}  {:<26}  ports",
        "address", "mac", "hostname", "os"
    );
    println!("{:-<addr_w$}  {:-<17}  {:-<host_w$}  {:-<26}  {:-<5}", "", "", "", "", "");
    for d in devices {
        let host = clip(d.hostname.as_deref().unwrap_or("-"), 32);
        let os = clip(d.os.as_deref().unwrap_or("-"), 26);
        let ports = d
            .open_ports
            .iter()
            .map(|p| p.port.to_string())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<addr_w$}  {:<17}  {:<host_w$}  {:<26}  {}",
            d.address.to_string(),
            d.mac.as_deref().unwrap_or("-"),
            host,
            os,
            ports
        );
    }
}

/// Shortens `s` to at most `max` characters.
fn clip(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
