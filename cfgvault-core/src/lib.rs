/*!
# cfgvault core engine

Read-only configuration capture for network devices, with immutable on-disk
storage of every capture.

- Compiled-in vendor table: one hardcoded command per device family
- SSH and Telnet management sessions, closed on every exit path
- Inline capture for most families, FTP relay capture for devices that can
  only push their configuration
- Bounded retry (one retry by default); store failures never retried
- Append-only artifact store with metadata and checksum records
- Write-only FTP ingestion listener and coordinator

## Architecture

Ports and adapters, as elsewhere in the workspace:
- [`VendorAdapter`] captures one device family
- [`ArtifactStore`] persists captures; [`LocalArtifactStore`] is the filesystem adapter
- [`DeviceDirectory`] supplies devices; [`AuditSink`] receives audit events
- [`BackupCollector`] orchestrates them

## Usage

```rust,no_run
use std::sync::Arc;
use cfgvault_core::device::PlaintextCipher;
use cfgvault_core::{
    BackupCollector, CollectorConfig, Connectors, JsonInventory, ListenerHandle, RelayMailbox,
    TracingAuditSink,
};

# async fn run() -> Result<(), Box<dyn std::error::Error>> {
let config = CollectorConfig::from_env()?;
let collector = BackupCollector::from_config(
    &config,
    Connectors::native(),
    Arc::new(ListenerHandle::new()),
    RelayMailbox::new(),
    Arc::new(TracingAuditSink),
)?;

let directory = JsonInventory::load("devices.json", &PlaintextCipher)?;
let summary = collector.collect_all(&directory, "cron").await;
println!("{} of {} devices captured", summary.succeeded, summary.total);
# Ok(())
# }
```
*/

pub mod adapter;
pub mod audit;
pub mod collector;
pub mod config;
pub mod device;
pub mod error;
pub mod ingest;
pub mod metadata;
pub mod observability;
pub mod session;
pub mod storage;
pub mod vendor;

#[cfg(test)]
mod error_tests;

pub use adapter::{AdapterRegistry, Capture, InlineAdapter, RelayAdapter, VendorAdapter};
pub use audit::{AuditEvent, AuditSink, DeviceStatus, MemoryAuditSink, TracingAuditSink};
pub use collector::{BackupCollector, CaptureAttempt, CollectAllSummary, CollectionResult};
pub use config::{CollectorConfig, RelayConfig, RelayConsumer};
pub use device::{DeviceDescriptor, DeviceDirectory, DeviceId, JsonInventory, StaticDirectory};
pub use error::{AttemptError, CaptureError, ConfigError, ErrorCategory, Result, StoreError};
pub use ingest::{
    FtpIngestionServer, IngestionCoordinator, IngestionProbe, ListenerHandle, RelayMailbox,
    TcpProbe,
};
pub use metadata::ArtifactMetadata;
pub use observability::init_observability;
pub use session::Connectors;
pub use storage::{ArtifactStore, LocalArtifactStore, StoredArtifact};
pub use vendor::{Transport, Vendor, VendorProfile};

#[cfg(feature = "metrics")]
pub use observability::CollectorMetrics;
