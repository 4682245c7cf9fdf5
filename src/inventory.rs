use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, ScanError};
use crate::types::DeviceRecord;

/// The device store the reconciler reads matches from and writes results to.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn find_by_address(&self, addr: IpAddr) -> Result<Option<DeviceRecord>>;

    /// First record carrying this hardware address (canonical lowercase form).
    async fn find_by_mac(&self, mac: &str) -> Result<Option<DeviceRecord>>;

    async fn upsert(&self, record: DeviceRecord) -> Result<()>;

    async fn remove(&self, id: Uuid) -> Result<()>;

    async fn all(&self) -> Result<Vec<DeviceRecord>>;
}

/// Process-local inventory, optionally seeded from and saved to a JSON file.
#[derive(Debug, Default)]
pub struct MemoryInventory {
    records: RwLock<HashMap<Uuid, DeviceRecord>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.id, r)).collect()),
        }
    }

    /// Load a JSON array of records. A missing file yields an empty inventory.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let file = std::fs::File::open(path)?;
        let records: Vec<DeviceRecord> = serde_json::from_reader(file)
            .map_err(|e| ScanError::Inventory(format!("{}: {e}", path.display())))?;
        Ok(Self::with_records(records))
    }

    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let records = self.all().await?;
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(file, &records).map_err(|e| ScanError::Inventory(e.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl Inventory for MemoryInventory {
    async fn find_by_address(&self, addr: IpAddr) -> Result<Option<DeviceRecord>> {
        let records = self.records.read().await;
        Ok(records.values().find(|r| r.address == addr).cloned())
    }

    async fn find_by_mac(&self, mac: &str) -> Result<Option<DeviceRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.mac.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(mac)))
            .min_by_key(|r| r.first_seen)
            .cloned())
    }

    async fn upsert(&self, record: DeviceRecord) -> Result<()> {
        self.records.write().await.insert(record.id, record);
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.records.write().await.remove(&id);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<DeviceRecord>> {
        let mut out: Vec<DeviceRecord> = self.records.read().await.values().cloned().collect();
        out.sort_by_key(|r| r.address);
        Ok(out)
    }
}
