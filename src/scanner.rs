use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{Result, ScanError};
use crate::ports;
use crate::probe::{os_hint_from_ttl, HostProber, PingReply};
use crate::types::{HostProbeResult, PortInfo, ScanOptions, ScanStrategy};
use crate::vendor;

/// Stealth never runs wider than this, whatever the configuration says.
pub const STEALTH_MAX_CONCURRENCY: usize = 5;

/// Parameters for one pool run.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolParams {
    pub timeout: Duration,
    pub retries: u32,
    pub concurrency: usize,
    /// Ports for the TCP pass over live hosts; empty skips the pass.
    pub ports: Vec<u16>,
    pub port_concurrency: usize,
    pub resolve_hostnames: bool,
    pub lookup_vendor: bool,
}

impl PoolParams {
    pub fn for_strategy(
        strategy: ScanStrategy,
        options: &ScanOptions,
        config: &EngineConfig,
    ) -> Result<Self> {
        let mut timeout = Duration::from_millis(options.timeout_ms.unwrap_or(config.default_timeout_ms));
        let mut concurrency = options.concurrency.unwrap_or(config.default_concurrency);
        if strategy == ScanStrategy::StealthScan {
            concurrency = concurrency
                .min(config.stealth_concurrency)
                .min(STEALTH_MAX_CONCURRENCY);
            timeout = timeout.max(Duration::from_millis(config.stealth_timeout_ms));
        }
        Ok(Self {
            timeout,
            retries: options.retries.unwrap_or(config.default_retries),
            concurrency: concurrency.max(1),
            ports: ports::ports_for(strategy, options)?,
            port_concurrency: config.port_concurrency.max(1),
            resolve_hostnames: !options.skip_hostnames,
            lookup_vendor: true,
        })
    }
}

/// Counters reported when a pool run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub dispatched: u64,
    pub alive: u64,
}

/// Bounded-concurrency probe executor.
///
/// Each dispatched address yields exactly one [`HostProbeResult`] on the
/// output channel, in completion order. A host that cannot be reached, or
/// whose enrichment fails, still yields a (down or partial) result.
#[derive(Clone)]
pub struct ProbePool {
    prober: Arc<dyn HostProber>,
}

impl ProbePool {
    pub fn new(prober: Arc<dyn HostProber>) -> Self {
        Self { prober }
    }

    /// Probe `targets`, streaming results into `tx`.
    ///
    /// Once `cancel` fires no further address is dispatched; probes already
    /// running are allowed to finish and still deliver their result.
    pub async fn run(
        &self,
        targets: Vec<IpAddr>,
        params: PoolParams,
        cancel: CancellationToken,
        tx: mpsc::Sender<HostProbeResult>,
    ) -> Result<PoolSummary> {
        self.prober.check().await?;

        let params = Arc::new(params);
        let sem = Arc::new(Semaphore::new(params.concurrency.clamp(1, 5_000)));
        let port_sem = Arc::new(Semaphore::new(params.port_concurrency));
        let mut set = JoinSet::new();
        let mut summary = PoolSummary::default();

        for ip in targets {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = sem.clone().acquire_owned() => {
                    permit.map_err(|e| ScanError::Pool(e.to_string()))?
                }
            };
            if cancel.is_cancelled() {
                break;
            }

            let prober = self.prober.clone();
            let params = params.clone();
            let port_sem = port_sem.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            summary.dispatched += 1;

            set.spawn(async move {
                let _permit = permit; // keep permit until the host is done
                let result = probe_host(prober, ip, &params, port_sem, &cancel).await;
                let alive = result.alive;
                if tx.send(result).await.is_err() {
                    debug!(%ip, "result receiver dropped");
                }
                alive
            });
        }

        while let Some(res) = set.join_next().await {
            match res {
                Ok(true) => summary.alive += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "probe task failed"),
            }
        }
        Ok(summary)
    }
}

async fn probe_host(
    prober: Arc<dyn HostProber>,
    ip: IpAddr,
    params: &PoolParams,
    port_sem: Arc<Semaphore>,
    cancel: &CancellationToken,
) -> HostProbeResult {
    let Some(reply) = ping_with_retries(prober.as_ref(), ip, params).await else {
        return HostProbeResult::down(ip);
    };

    let mut result = HostProbeResult::up(ip);
    result.latency_ms = reply.latency_ms;
    result.ttl = reply.ttl;
    result.os_hint = reply.ttl.map(|ttl| os_hint_from_ttl(ttl).to_string());

    if params.resolve_hostnames {
        match prober.hostname(ip, params.timeout).await {
            Ok(name) => result.hostname = name,
            Err(e) => debug!(%ip, error = %e, "reverse lookup failed"),
        }
    }
    match prober.hardware_address(ip, params.timeout).await {
        Ok(mac) => result.mac = mac,
        Err(e) => debug!(%ip, error = %e, "neighbor lookup failed"),
    }
    if params.lookup_vendor {
        result.vendor = result.mac.as_deref().and_then(vendor::lookup);
    }

    if !params.ports.is_empty() {
        result.open_ports = scan_ports(prober, ip, params, port_sem, cancel).await;
    }
    result
}

async fn ping_with_retries(
    prober: &dyn HostProber,
    ip: IpAddr,
    params: &PoolParams,
) -> Option<PingReply> {
    for attempt in 0..=params.retries {
        match prober.ping(ip, params.timeout).await {
            Ok(Some(reply)) => return Some(reply),
            Ok(None) => {}
            Err(e) => debug!(%ip, attempt, error = %e, "echo probe failed"),
        }
    }
    None
}

/// TCP connect pass. A port counts as open only when the connect succeeds.
async fn scan_ports(
    prober: Arc<dyn HostProber>,
    ip: IpAddr,
    params: &PoolParams,
    port_sem: Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Vec<PortInfo> {
    let mut set = JoinSet::new();
    for &port in &params.ports {
        if cancel.is_cancelled() {
            break;
        }
        let Ok(permit) = port_sem.clone().acquire_owned().await else {
            break;
        };
        let prober = prober.clone();
        let timeout = params.timeout;
        set.spawn(async move {
            let _permit = permit;
            prober.tcp_probe(SocketAddr::new(ip, port), timeout).await
        });
    }

    let mut open = Vec::new();
    while let Some(res) = set.join_next().await {
        if let Ok(Some(mut info)) = res {
            if info.service.is_none() {
                info.service = ports::service_name(info.port).map(str::to_string);
            }
            open.push(info);
        }
    }
    open.sort_by_key(|p| p.port);
    open
}
