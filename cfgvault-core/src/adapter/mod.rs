/*!
Vendor adapters.

An adapter knows how one device family hands back its configuration. Inline
families print it on the management session; the relay family uploads it to
the ingestion root after being triggered.

Adapters are looked up in an [`AdapterRegistry`] keyed by [`Vendor`].
*/

pub mod inline;
pub mod relay;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{CollectorConfig, RelayConfig};
use crate::device::DeviceDescriptor;
use crate::error::CaptureError;
use crate::ingest::{IngestionProbe, RelayMailbox};
use crate::session::Connectors;
use crate::storage::StoredArtifact;
use crate::vendor::Vendor;

pub use inline::InlineAdapter;
pub use relay::{RelayAdapter, RelayState, RelayTrigger};

/// How captured bytes reached the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    /// Read from the management session
    Session,
    /// Picked up from the relay inbox by the adapter
    RelayInbox,
}

/// Successful adapter result
#[derive(Debug, Clone, PartialEq)]
pub enum Capture {
    /// Raw bytes still to be stored
    Content {
        bytes: Vec<u8>,
        checksum: String,
        duration: Duration,
        source: CaptureSource,
    },
    /// Already stored by the ingestion coordinator
    Ingested(StoredArtifact),
}

/// Timeouts applied to management sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
        }
    }
}

/// Capture capability bound to one device family
#[async_trait]
pub trait VendorAdapter: Send + Sync {
    fn vendor(&self) -> Vendor;

    /// Capture the device's configuration once. Retrying is the caller's job.
    async fn backup(&self, device: &DeviceDescriptor) -> Result<Capture, CaptureError>;
}

/// What the relay adapter needs beyond session settings
#[derive(Clone)]
pub struct RelayContext {
    pub config: RelayConfig,
    pub probe: Arc<dyn IngestionProbe>,
    pub mailbox: Arc<RelayMailbox>,
}

impl fmt::Debug for RelayContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayContext")
            .field("ingestion_root", &self.config.ingestion_root)
            .field("consumer", &self.config.consumer)
            .finish_non_exhaustive()
    }
}

/// Vendor to adapter lookup
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<Vendor, Arc<dyn VendorAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inline adapters for every inline vendor plus the relay adapter for
    /// every relay vendor
    pub fn standard(settings: SessionSettings, connectors: Connectors, relay: RelayContext) -> Self {
        let mut registry = Self::new();
        for vendor in Vendor::all() {
            if vendor.is_relay() {
                registry.register(Arc::new(RelayAdapter::new(
                    vendor,
                    settings,
                    connectors.clone(),
                    relay.clone(),
                )));
            } else {
                registry.register(Arc::new(InlineAdapter::new(
                    vendor,
                    settings,
                    connectors.clone(),
                )));
            }
        }
        registry
    }

    /// Add or replace the adapter for its vendor
    pub fn register(&mut self, adapter: Arc<dyn VendorAdapter>) {
        self.adapters.insert(adapter.vendor(), adapter);
    }

    pub fn get(&self, vendor: Vendor) -> Option<Arc<dyn VendorAdapter>> {
        self.adapters.get(&vendor).cloned()
    }

    /// Registered vendors in table order
    pub fn vendors(&self) -> Vec<Vendor> {
        Vendor::all().filter(|v| self.adapters.contains_key(v)).collect()
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("vendors", &self.vendors())
            .finish()
    }
}

/// Map a failed blocking session task to a capture error
pub(crate) fn join_error(err: tokio::task::JoinError) -> CaptureError {
    if err.is_panic() {
        CaptureError::capture("session task panicked")
    } else {
        CaptureError::capture(format!("session task did not complete: {err}"))
    }
}
