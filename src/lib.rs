//! Network discovery engine: target resolution, a bounded probe pool,
//! delegation to an external scanner, and device inventory reconciliation
//! under a cancellable job model.
pub mod config;
pub mod error;
pub mod events;
pub mod inventory;
pub mod job;
pub mod netdetect;
pub mod nmap;
pub mod nmap_xml;
pub mod ports;
pub mod probe;
pub mod reconcile;
pub mod scanner;
pub mod server;
pub mod targets;
pub mod types;
pub mod vendor;

pub use error::{Result, ScanError};
pub use job::ScanManager;
