//! Matching fresh observations against the device inventory.
//!
//! Matching order is address first, then hardware address. When the address
//! match and the hardware-address match are different records, the two are
//! merged: the address-matched record stays, gaps in it are filled from the
//! other, and the other is removed from the inventory.
//!
//! Field policy on update:
//! * `last_seen` always takes the observation time;
//! * `first_seen` is set on creation and kept afterwards;
//! * descriptive fields take the newest observed value, but an absent value
//!   never erases a known one.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::inventory::Inventory;
use crate::types::{DeviceRecord, HostProbeResult, JobId};

/// What reconciling one observation did to the inventory.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub record: DeviceRecord,
    pub created: bool,
    /// Ids of records folded into `record` and removed.
    pub merged: Vec<Uuid>,
}

/// Applies observations to an [`Inventory`].
///
/// Reconciliations run one at a time, so two observations touching the same
/// address or hardware address can never interleave their read-merge-write.
pub struct Reconciler {
    inventory: Arc<dyn Inventory>,
    stage: Mutex<()>,
}

impl Reconciler {
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        Self {
            inventory,
            stage: Mutex::new(()),
        }
    }

    pub fn inventory(&self) -> &Arc<dyn Inventory> {
        &self.inventory
    }

    pub async fn reconcile(
        &self,
        observed: &HostProbeResult,
        job_id: Option<JobId>,
        seen_at: OffsetDateTime,
    ) -> Result<Reconciled> {
        let _stage = self.stage.lock().await;

        let by_addr = self.inventory.find_by_address(observed.address).await?;
        let by_mac = match observed.mac.as_deref() {
            Some(mac) => self.inventory.find_by_mac(mac).await?,
            None => None,
        };

        let (mut record, created, absorbed) = match (by_addr, by_mac) {
            (Some(primary), Some(other)) if primary.id != other.id => (primary, false, Some(other)),
            (Some(primary), _) => (primary, false, None),
            (None, Some(primary)) => (primary, false, None),
            (None, None) => (new_record(observed, seen_at), true, None),
        };

        let mut merged = Vec::new();
        if let Some(other) = absorbed {
            fill_missing(&mut record, &other);
            self.inventory.remove(other.id).await?;
            debug!(kept = %record.id, removed = %other.id, "merged duplicate device records");
            merged.push(other.id);
        }

        apply_observation(&mut record, observed, job_id, seen_at);
        self.inventory.upsert(record.clone()).await?;

        Ok(Reconciled {
            record,
            created,
            merged,
        })
    }
}

fn new_record(observed: &HostProbeResult, seen_at: OffsetDateTime) -> DeviceRecord {
    DeviceRecord {
        id: Uuid::new_v4(),
        address: observed.address,
        mac: None,
        hostname: None,
        vendor: None,
        os: None,
        open_ports: Vec::new(),
        first_seen: seen_at,
        last_seen: seen_at,
        last_job: None,
    }
}

/// Copy into `primary` whatever it lacks and `other` knows.
fn fill_missing(primary: &mut DeviceRecord, other: &DeviceRecord) {
    primary.mac = primary.mac.take().or_else(|| other.mac.clone());
    primary.hostname = primary.hostname.take().or_else(|| other.hostname.clone());
    primary.vendor = primary.vendor.take().or_else(|| other.vendor.clone());
    primary.os = primary.os.take().or_else(|| other.os.clone());
    if primary.open_ports.is_empty() {
        primary.open_ports = other.open_ports.clone();
    }
    primary.first_seen = primary.first_seen.min(other.first_seen);
}

fn apply_observation(
    record: &mut DeviceRecord,
    observed: &HostProbeResult,
    job_id: Option<JobId>,
    seen_at: OffsetDateTime,
) {
    record.address = observed.address;
    if let Some(mac) = &observed.mac {
        record.mac = Some(mac.clone());
    }
    if let Some(hostname) = &observed.hostname {
        record.hostname = Some(hostname.clone());
    }
    if let Some(vendor) = &observed.vendor {
        record.vendor = Some(vendor.clone());
    }
    if let Some(os) = &observed.os_hint {
        record.os = Some(os.clone());
    }
    if !observed.open_ports.is_empty() {
        record.open_ports = observed.open_ports.clone();
    }
    record.last_seen = seen_at;
    if job_id.is_some() {
        record.last_job = job_id;
    }
}
