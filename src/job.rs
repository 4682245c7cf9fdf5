//! Scan job lifecycle.
//!
//! [`ScanManager`] owns the job registry, resolves targets, picks the backend
//! (built-in probe pool or external scanner), and drives each job through
//! `Created → Starting → Running → {Completed | Stopped | Error}` on a
//! dedicated task. Every host result flows through the reconciler and out to
//! the event bus in arrival order.
//!
//! Only one job runs at a time. Starting a valid job while another is active
//! stops the active one and waits for it to reach a terminal state first; a
//! rejected request leaves the active job alone.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{Result, ScanError};
use crate::events::{EventBus, ScanEvent};
use crate::inventory::Inventory;
use crate::nmap::{self, AdapterSignal, NmapOutcome, NmapScanner};
use crate::probe::{HostProber, SystemProber};
use crate::reconcile::Reconciler;
use crate::scanner::{PoolParams, ProbePool};
use crate::targets;
use crate::types::{Backend, HostProbeResult, JobId, ScanJob, ScanOptions, ScanStatus, ScanStrategy};

const RESULT_BUFFER: usize = 256;

struct JobEntry {
    job: ScanJob,
    cancel: CancellationToken,
    status_tx: Arc<watch::Sender<ScanStatus>>,
}

#[derive(Default)]
struct JobRegistry {
    jobs: HashMap<JobId, JobEntry>,
    /// Terminal jobs, oldest first.
    history: VecDeque<JobId>,
    active: Option<JobId>,
}

impl JobRegistry {
    fn insert(&mut self, job: ScanJob, cancel: CancellationToken) {
        let (status_tx, _) = watch::channel(job.status);
        self.jobs.insert(
            job.id,
            JobEntry {
                job,
                cancel,
                status_tx: Arc::new(status_tx),
            },
        );
    }

    fn retire(&mut self, id: JobId, limit: usize) {
        if self.active == Some(id) {
            self.active = None;
        }
        self.history.push_back(id);
        while self.history.len() > limit.max(1) {
            if let Some(old) = self.history.pop_front() {
                self.jobs.remove(&old);
            }
        }
    }
}

struct Inner {
    config: EngineConfig,
    events: EventBus,
    reconciler: Reconciler,
    pool: ProbePool,
    nmap: NmapScanner,
    registry: RwLock<JobRegistry>,
    start_lock: Mutex<()>,
}

/// Engine entry point shared by the CLI and the HTTP API.
#[derive(Clone)]
pub struct ScanManager {
    inner: Arc<Inner>,
}

impl ScanManager {
    pub fn new(
        config: EngineConfig,
        inventory: Arc<dyn Inventory>,
        prober: Arc<dyn HostProber>,
    ) -> Self {
        let nmap = NmapScanner::from_config(&config);
        Self {
            inner: Arc::new(Inner {
                events: EventBus::new(config.event_capacity),
                reconciler: Reconciler::new(inventory),
                pool: ProbePool::new(prober),
                nmap,
                registry: RwLock::new(JobRegistry::default()),
                start_lock: Mutex::new(()),
                config,
            }),
        }
    }

    pub fn with_system_prober(config: EngineConfig, inventory: Arc<dyn Inventory>) -> Self {
        Self::new(config, inventory, Arc::new(SystemProber))
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn inventory(&self) -> &Arc<dyn Inventory> {
        self.inner.reconciler.inventory()
    }

    /// Start a scan and return its id once the job is running in the background.
    ///
    /// Fails with [`ScanError::Validation`] when the target specification,
    /// the port selection, or the address family mix is unusable; the failed
    /// job is still recorded and a `scan_error` event is published for it.
    pub async fn start_scan(
        &self,
        target_spec: &str,
        strategy: ScanStrategy,
        options: ScanOptions,
    ) -> Result<JobId> {
        let inner = &self.inner;
        let _start = inner.start_lock.lock().await;

        let mut job = ScanJob::new(target_spec, strategy, options.clone());
        let id = job.id;

        let backend = if strategy == ScanStrategy::FingerprintScan || options.needs_external() {
            Backend::External
        } else {
            Backend::Pool
        };
        let prepared = targets::resolve(target_spec, inner.config.max_targets).and_then(|addrs| {
            let params = PoolParams::for_strategy(strategy, &options, &inner.config)?;
            if backend == Backend::External {
                nmap::ipv6_targets(&addrs)?;
            }
            Ok((addrs, params))
        });
        let (addrs, params) = match prepared {
            Ok(p) => p,
            Err(e) => {
                let message = e.to_string();
                warn!(job_id = %id, target = target_spec, error = %message, "scan rejected");
                job.status = ScanStatus::Error;
                job.error = Some(message.clone());
                job.ended_at = Some(OffsetDateTime::now_utc());
                {
                    let mut reg = inner.registry.write().await;
                    reg.insert(job, CancellationToken::new());
                    reg.retire(id, inner.config.history_limit);
                }
                inner.events.publish(ScanEvent::ScanError { job_id: id, message });
                return Err(e);
            }
        };

        let active = inner.registry.read().await.active;
        if let Some(active) = active {
            info!(job_id = %active, "preempting active scan");
            self.stop_scan(active).await;
            self.wait(active).await;
        }

        job.backend = Some(backend);
        job.resolved_count = addrs.len();
        job.total = addrs.len() as u64;
        job.status = ScanStatus::Starting;

        let cancel = CancellationToken::new();
        {
            let mut reg = inner.registry.write().await;
            reg.insert(job, cancel.clone());
            reg.active = Some(id);
        }

        info!(job_id = %id, %strategy, ?backend, targets = addrs.len(), "scan starting");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            drive(inner, id, addrs, strategy, options, params, backend, cancel).await;
        });
        Ok(id)
    }

    /// Request cancellation. Returns false for unknown or already finished jobs.
    pub async fn stop_scan(&self, id: JobId) -> bool {
        let mut reg = self.inner.registry.write().await;
        let Some(entry) = reg.jobs.get_mut(&id) else {
            return false;
        };
        if entry.job.status.is_terminal() {
            return false;
        }
        entry.cancel.cancel();
        if entry.job.status != ScanStatus::Stopping {
            info!(job_id = %id, "stop requested");
            entry.job.status = ScanStatus::Stopping;
            entry.status_tx.send_replace(ScanStatus::Stopping);
        }
        true
    }

    pub async fn get_job_status(&self, id: JobId) -> Option<ScanJob> {
        let reg = self.inner.registry.read().await;
        reg.jobs.get(&id).map(|e| e.job.clone())
    }

    /// All retained jobs, oldest first.
    pub async fn list_jobs(&self) -> Vec<ScanJob> {
        let reg = self.inner.registry.read().await;
        let mut jobs: Vec<ScanJob> = reg.jobs.values().map(|e| e.job.clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub async fn active_job(&self) -> Option<JobId> {
        self.inner.registry.read().await.active
    }

    /// Resolve once the job is terminal (or no longer retained).
    pub async fn wait(&self, id: JobId) -> Option<ScanJob> {
        let rx = {
            let reg = self.inner.registry.read().await;
            reg.jobs.get(&id).map(|e| e.status_tx.subscribe())
        };
        if let Some(mut rx) = rx {
            let _ = rx.wait_for(|s| s.is_terminal()).await;
        }
        self.get_job_status(id).await
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    inner: Arc<Inner>,
    id: JobId,
    addrs: Vec<IpAddr>,
    strategy: ScanStrategy,
    options: ScanOptions,
    params: PoolParams,
    backend: Backend,
    cancel: CancellationToken,
) {
    let Some(started) = mark_running(&inner, id).await else {
        return;
    };
    inner.events.publish(ScanEvent::ScanStarted { job: started });

    let mut run = JobRun::new(inner.clone(), id, addrs.len() as u64);
    let outcome = match backend {
        Backend::Pool => run.pool(addrs, params, cancel.clone()).await,
        Backend::External => run.external(addrs, strategy, &options, cancel.clone()).await,
    };

    finish(&inner, id, outcome).await;
}

async fn mark_running(inner: &Inner, id: JobId) -> Option<ScanJob> {
    let mut reg = inner.registry.write().await;
    let entry = reg.jobs.get_mut(&id)?;
    if entry.job.status == ScanStatus::Starting {
        entry.job.status = ScanStatus::Running;
        entry.status_tx.send_replace(ScanStatus::Running);
    }
    entry.job.started_at = Some(OffsetDateTime::now_utc());
    Some(entry.job.clone())
}

/// Record the terminal state. Stopped wins over the backend outcome whenever a
/// stop was accepted, which is checked under the same lock `stop_scan` takes.
async fn finish(inner: &Inner, id: JobId, outcome: Result<()>) {
    let (job, status_tx) = {
        let mut reg = inner.registry.write().await;
        let Some(entry) = reg.jobs.get_mut(&id) else {
            return;
        };
        let stop_requested =
            entry.cancel.is_cancelled() || entry.job.status == ScanStatus::Stopping;
        let status = match &outcome {
            _ if stop_requested => ScanStatus::Stopped,
            Ok(()) => ScanStatus::Completed,
            Err(_) => ScanStatus::Error,
        };
        match &outcome {
            Err(e) if stop_requested => {
                debug!(job_id = %id, error = %e, "backend error after stop request")
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "scan failed");
                entry.job.error = Some(e.to_string());
            }
            Ok(()) => {}
        }
        entry.job.status = status;
        entry.job.ended_at = Some(OffsetDateTime::now_utc());
        let snapshot = (entry.job.clone(), entry.status_tx.clone());
        reg.retire(id, inner.config.history_limit);
        snapshot
    };
    let status = job.status;

    info!(
        job_id = %id,
        ?status,
        probed = job.probed,
        total = job.total,
        devices = job.devices_found,
        "scan finished"
    );
    let event = match status {
        ScanStatus::Error => ScanEvent::ScanError {
            job_id: id,
            message: job.error.clone().unwrap_or_else(|| "scan failed".into()),
        },
        _ => ScanEvent::ScanCompleted { job },
    };
    inner.events.publish(event);
    status_tx.send_replace(status);
}

/// Per-job accounting while results arrive.
struct JobRun {
    inner: Arc<Inner>,
    id: JobId,
    total: u64,
    probed: u64,
    devices: HashSet<IpAddr>,
}

impl JobRun {
    fn new(inner: Arc<Inner>, id: JobId, total: u64) -> Self {
        Self {
            inner,
            id,
            total,
            probed: 0,
            devices: HashSet::new(),
        }
    }

    async fn pool(
        &mut self,
        addrs: Vec<IpAddr>,
        params: PoolParams,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(RESULT_BUFFER);
        let pool = self.inner.pool.clone();
        let task = tokio::spawn(async move { pool.run(addrs, params, cancel, tx).await });

        while let Some(result) = rx.recv().await {
            if result.alive {
                self.reconcile(&result).await;
            }
            self.advance(self.probed + 1).await;
        }

        let summary = task
            .await
            .map_err(|e| ScanError::Pool(format!("probe pool task failed: {e}")))??;
        debug!(job_id = %self.id, dispatched = summary.dispatched, alive = summary.alive, "pool drained");
        Ok(())
    }

    async fn external(
        &mut self,
        addrs: Vec<IpAddr>,
        strategy: ScanStrategy,
        options: &ScanOptions,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(RESULT_BUFFER);
        let nmap = self.inner.nmap.clone();
        let options = options.clone();
        let task = tokio::spawn(async move { nmap.run(&addrs, strategy, &options, cancel, tx).await });

        let mut surfaced = HashSet::new();
        while let Some(signal) = rx.recv().await {
            match signal {
                AdapterSignal::Percent(pct) => {
                    let probed = ((pct / 100.0) * self.total as f64).floor() as u64;
                    if probed > self.probed {
                        self.advance(probed).await;
                    }
                }
                AdapterSignal::HostDiscovered(mut host) => {
                    if surfaced.insert(host.address) {
                        // Port lines arrive one at a time; the final report carries the full set.
                        host.open_ports.clear();
                        self.reconcile(&host).await;
                    }
                }
            }
        }

        let outcome = task
            .await
            .map_err(|e| ScanError::Adapter(format!("scanner task failed: {e}")))??;
        if let NmapOutcome::Finished(results) = outcome {
            for result in results.iter().filter(|r| r.alive) {
                self.reconcile(result).await;
            }
            self.advance(self.total).await;
        }
        Ok(())
    }

    async fn reconcile(&mut self, result: &HostProbeResult) {
        let reconciler = &self.inner.reconciler;
        match reconciler
            .reconcile(result, Some(self.id), OffsetDateTime::now_utc())
            .await
        {
            Ok(done) => {
                self.devices.insert(result.address);
                let count = self.devices.len() as u64;
                self.update(|job| job.devices_found = count).await;
                self.inner.events.publish(ScanEvent::DeviceFound {
                    job_id: self.id,
                    device: done.record,
                });
            }
            Err(e) => warn!(job_id = %self.id, address = %result.address, error = %e, "reconciliation failed"),
        }
    }

    async fn advance(&mut self, probed: u64) {
        self.probed = probed.min(self.total);
        let probed = self.probed;
        self.update(|job| job.probed = probed).await;
        self.inner.events.publish(ScanEvent::Progress {
            job_id: self.id,
            probed,
            total: self.total,
        });
    }

    async fn update(&self, f: impl FnOnce(&mut ScanJob)) {
        let mut reg = self.inner.registry.write().await;
        if let Some(entry) = reg.jobs.get_mut(&self.id) {
            f(&mut entry.job);
        }
    }
}
