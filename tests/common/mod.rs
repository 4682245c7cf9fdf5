#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use netscan::config::EngineConfig;
use netscan::events::ScanEvent;
use netscan::inventory::MemoryInventory;
use netscan::probe::{HostProber, PingReply};
use netscan::types::{JobId, PortInfo};
use netscan::{Result, ScanError, ScanManager};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    pub ttl: Option<u8>,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub open_ports: Vec<u16>,
    /// Reverse lookup and neighbor lookup both error out.
    pub broken_enrichment: bool,
}

/// Scripted prober: answers for the configured hosts and records what it was asked.
#[derive(Default)]
pub struct FakeProber {
    hosts: HashMap<IpAddr, FakeHost>,
    delay: Duration,
    fail_check: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    pings: AtomicUsize,
    tcp_probes: Mutex<Vec<SocketAddr>>,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, addr: &str, host: FakeHost) -> Self {
        self.hosts.insert(ip(addr), host);
        self
    }

    pub fn alive(self, addr: &str) -> Self {
        self.host(
            addr,
            FakeHost {
                ttl: Some(64),
                ..Default::default()
            },
        )
    }

    /// Every echo takes this long.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_check(mut self) -> Self {
        self.fail_check = true;
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn tcp_probes(&self) -> Vec<SocketAddr> {
        self.tcp_probes.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostProber for FakeProber {
    async fn check(&self) -> Result<()> {
        if self.fail_check {
            return Err(ScanError::Pool("ping utility not available".into()));
        }
        Ok(())
    }

    async fn ping(&self, addr: IpAddr, _timeout: Duration) -> Result<Option<PingReply>> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(self.hosts.get(&addr).map(|h| PingReply {
            latency_ms: Some(1),
            ttl: h.ttl,
        }))
    }

    async fn hostname(&self, addr: IpAddr, _timeout: Duration) -> Result<Option<String>> {
        match self.hosts.get(&addr) {
            Some(h) if h.broken_enrichment => Err(ScanError::Io(std::io::Error::other("resolver down"))),
            Some(h) => Ok(h.hostname.clone()),
            None => Ok(None),
        }
    }

    async fn hardware_address(&self, addr: IpAddr, _timeout: Duration) -> Result<Option<String>> {
        match self.hosts.get(&addr) {
            Some(h) if h.broken_enrichment => Err(ScanError::Io(std::io::Error::other("no neighbor table"))),
            Some(h) => Ok(h.mac.clone()),
            None => Ok(None),
        }
    }

    async fn tcp_probe(&self, addr: SocketAddr, _timeout: Duration) -> Option<PortInfo> {
        self.tcp_probes.lock().unwrap().push(addr);
        self.hosts
            .get(&addr.ip())
            .filter(|h| h.open_ports.contains(&addr.port()))
            .map(|_| PortInfo::tcp(addr.port()))
    }
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn manager(prober: Arc<FakeProber>) -> (ScanManager, Arc<MemoryInventory>) {
    manager_with(EngineConfig::default(), prober)
}

pub fn manager_with(config: EngineConfig, prober: Arc<FakeProber>) -> (ScanManager, Arc<MemoryInventory>) {
    let inventory = Arc::new(MemoryInventory::new());
    (ScanManager::new(config, inventory.clone(), prober), inventory)
}

/// Events for `id` up to and including its terminal event.
pub async fn events_until_terminal(
    rx: &mut broadcast::Receiver<ScanEvent>,
    id: JobId,
) -> Vec<ScanEvent> {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event bus open");
            if event.job_id() != id {
                continue;
            }
            let done = event.is_terminal();
            out.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("job reached a terminal event");
    out
}
