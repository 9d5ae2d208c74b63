/*!
Backup collector.

Orchestrates one collection per device: pick the vendor adapter, run capture
attempts under the retry policy, hand the bytes to the artifact store and
report a structured result. Store failures end the collection at once since
the device side already did its job.
*/

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use cfgvault_retry::{run_bounded, RetryPolicy};

use crate::adapter::{AdapterRegistry, Capture, RelayContext, SessionSettings, VendorAdapter};
use crate::audit::{AuditEvent, AuditSink, DeviceStatus};
use crate::config::CollectorConfig;
use crate::device::{DeviceDescriptor, DeviceDirectory, DeviceId};
use crate::error::{AttemptError, CaptureError, ConfigError, ErrorCategory, StoreError};
use crate::ingest::{IngestionProbe, RelayMailbox};
use crate::session::Connectors;
use crate::storage::{ArtifactDraft, ArtifactRef, ArtifactStore, LocalArtifactStore, StoredArtifact};

/// How a single attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
}

/// One capture try, kept only inside its [`CollectionResult`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureAttempt {
    pub attempt_id: Uuid,
    /// Zero-based attempt number
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub checksum: Option<String>,
    /// Stored size in bytes, on success
    pub bytes: Option<usize>,
    pub error: Option<AttemptError>,
}

/// Outcome of `collect` for one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionResult {
    pub device_id: DeviceId,
    pub device_name: String,
    pub success: bool,
    pub artifact: Option<ArtifactRef>,
    pub error: Option<AttemptError>,
    pub retries_used: u32,
    pub attempts: Vec<CaptureAttempt>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub triggered_by: String,
}

impl CollectionResult {
    fn refused(
        device: &DeviceDescriptor,
        error: AttemptError,
        started_at: DateTime<Utc>,
        triggered_by: &str,
    ) -> Self {
        Self {
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            success: false,
            artifact: None,
            error: Some(error),
            retries_used: 0,
            attempts: Vec::new(),
            started_at,
            finished_at: Utc::now(),
            triggered_by: triggered_by.to_string(),
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Totals for `collect_all`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectAllSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<CollectionResult>,
}

/// Removes the device from the in-flight set on drop
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<DeviceId>>,
    device: DeviceId,
}

impl<'a> InFlightGuard<'a> {
    fn claim(set: &'a Mutex<HashSet<DeviceId>>, device: &DeviceId) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.clone());
        inserted.then(|| Self {
            set,
            device: device.clone(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.device);
    }
}

/// Runs collections against the registered vendor adapters
pub struct BackupCollector {
    registry: AdapterRegistry,
    store: Arc<dyn ArtifactStore>,
    audit: Arc<dyn AuditSink>,
    policy: RetryPolicy,
    workers: usize,
    permits: Semaphore,
    in_flight: Mutex<HashSet<DeviceId>>,
}

impl BackupCollector {
    /// Create a collector
    ///
    /// # Arguments
    /// * `registry` - adapters by vendor; vendors missing here are unsupported
    /// * `store` - where successful captures are written
    /// * `audit` - receives start, attempt and completion events
    /// * `policy` - retry cap and delay between attempts
    /// * `workers` - concurrent collections allowed (at least one)
    pub fn new(
        registry: AdapterRegistry,
        store: Arc<dyn ArtifactStore>,
        audit: Arc<dyn AuditSink>,
        policy: RetryPolicy,
        workers: usize,
    ) -> Self {
        let workers = workers.max(1);
        Self {
            registry,
            store,
            audit,
            policy,
            workers,
            permits: Semaphore::new(workers),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Wire a collector from configuration with the standard adapters
    ///
    /// # Errors
    /// * `ConfigError::Validation` - invalid retry settings or unusable storage root
    pub fn from_config(
        config: &CollectorConfig,
        connectors: Connectors,
        probe: Arc<dyn IngestionProbe>,
        mailbox: Arc<RelayMailbox>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = LocalArtifactStore::open(&config.storage_root)
            .map_err(|e| ConfigError::validation(e.to_string()))?;
        let registry = AdapterRegistry::standard(
            SessionSettings::from_config(config),
            connectors,
            RelayContext {
                config: config.relay.clone(),
                probe,
                mailbox,
            },
        );
        Ok(Self::new(
            registry,
            Arc::new(store),
            audit,
            config.retry_policy()?,
            config.workers,
        ))
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    fn resolve(&self, device: &DeviceDescriptor) -> Result<Arc<dyn VendorAdapter>, CaptureError> {
        let profile = device.vendor.profile();
        if !profile.permits(device.transport) {
            return Err(CaptureError::unsupported(format!(
                "{} does not support {}",
                device.vendor, device.transport
            )));
        }
        self.registry.get(device.vendor).ok_or_else(|| {
            CaptureError::unsupported(format!("no adapter registered for {}", device.vendor))
        })
    }

    /// Collect one device's configuration
    ///
    /// Never fails: every outcome, including refusals, is reported in the
    /// returned [`CollectionResult`].
    ///
    /// # Arguments
    /// * `device` - the device to capture
    /// * `triggered_by` - who or what asked for the collection, for the audit trail
    #[instrument(skip(self, device), fields(device = %device.id, vendor = %device.vendor))]
    pub async fn collect(&self, device: &DeviceDescriptor, triggered_by: &str) -> CollectionResult {
        let started_at = Utc::now();

        let Some(_in_flight) = InFlightGuard::claim(&self.in_flight, &device.id) else {
            warn!("Collection already in progress for this device");
            return CollectionResult::refused(
                device,
                AttemptError::new(ErrorCategory::Busy, "a collection is already in progress"),
                started_at,
                triggered_by,
            );
        };

        self.audit.record(&AuditEvent::BackupStarted {
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            vendor: device.vendor,
            triggered_by: triggered_by.to_string(),
        });

        let adapter = match self.resolve(device) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(error = %e, "Collection refused");
                let result = CollectionResult::refused(
                    device,
                    AttemptError::from(&e),
                    started_at,
                    triggered_by,
                );
                self.complete(&result, Some(&e));
                return result;
            }
        };

        let Ok(_permit) = self.permits.acquire().await else {
            let e = CaptureError::capture("collector is shutting down");
            let result =
                CollectionResult::refused(device, AttemptError::from(&e), started_at, triggered_by);
            self.complete(&result, Some(&e));
            return result;
        };

        let attempts = Mutex::new(Vec::new());
        let outcome = run_bounded("collect", &self.policy, |number| {
            self.attempt(adapter.as_ref(), device, number, &attempts).boxed()
        })
        .await;

        let retries_used = outcome.retries_used();
        let attempts = attempts.into_inner().unwrap_or_else(PoisonError::into_inner);
        let (artifact, error) = match &outcome.result {
            Ok(artifact) => (Some(ArtifactRef::from(artifact)), None),
            Err(e) => (None, Some(AttemptError::from(e))),
        };

        let result = CollectionResult {
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            success: artifact.is_some(),
            artifact,
            error,
            retries_used,
            attempts,
            started_at,
            finished_at: Utc::now(),
            triggered_by: triggered_by.to_string(),
        };

        match &outcome.result {
            Ok(stored) => info!(path = %stored.path, retries_used, "Collection succeeded"),
            Err(e) => warn!(error = %e, retries_used, "Collection failed"),
        }
        self.complete(&result, outcome.result.as_ref().err());
        #[cfg(feature = "metrics")]
        crate::observability::with_metrics(|m| {
            m.record_outcome(result.success, retries_used);
            if let Some(artifact) = &result.artifact {
                m.record_artifact(artifact.size);
            }
        });

        result
    }

    fn complete(&self, result: &CollectionResult, error: Option<&CaptureError>) {
        self.audit.record(&AuditEvent::BackupCompleted {
            device_id: result.device_id.clone(),
            status: DeviceStatus::from_error(error),
            artifact_path: result.artifact.as_ref().map(|a| a.path.clone()),
            retries_used: result.retries_used,
            error: result.error.clone(),
            triggered_by: result.triggered_by.clone(),
        });
    }

    /// One independent try: fresh adapter call, then store
    async fn attempt(
        &self,
        adapter: &dyn VendorAdapter,
        device: &DeviceDescriptor,
        number: u32,
        log: &Mutex<Vec<CaptureAttempt>>,
    ) -> Result<StoredArtifact, CaptureError> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let result = match adapter.backup(device).await {
            Ok(Capture::Content {
                bytes,
                checksum,
                duration,
                ..
            }) => self.store_capture(device, bytes, &checksum, duration).await,
            Ok(Capture::Ingested(artifact)) => Ok(artifact),
            Err(e) => Err(e),
        };

        let elapsed = clock.elapsed();
        let error = result.as_ref().err().map(AttemptError::from);
        let outcome = match &result {
            Ok(_) => AttemptOutcome::Success,
            Err(e) if e.is_timeout() => AttemptOutcome::Timeout,
            Err(_) => AttemptOutcome::Failure,
        };
        log.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CaptureAttempt {
                attempt_id: Uuid::new_v4(),
                number,
                started_at,
                finished_at: Utc::now(),
                outcome,
                checksum: result.as_ref().ok().map(|a| a.checksum.clone()),
                bytes: result.as_ref().ok().map(|a| a.size as usize),
                error: error.clone(),
            });

        self.audit.record(&AuditEvent::AttemptFinished {
            device_id: device.id.clone(),
            attempt: number,
            success: result.is_ok(),
            duration_seconds: elapsed.as_secs_f64(),
            error,
        });
        #[cfg(feature = "metrics")]
        crate::observability::with_metrics(|m| m.record_attempt(elapsed));

        result
    }

    async fn store_capture(
        &self,
        device: &DeviceDescriptor,
        bytes: Vec<u8>,
        checksum: &str,
        duration: std::time::Duration,
    ) -> Result<StoredArtifact, CaptureError> {
        let draft = ArtifactDraft {
            vendor: device.vendor,
            device_id: device.id.clone(),
            device_address: device.address.clone(),
            transport: device.transport,
            captured_at: Utc::now(),
            content: bytes,
            execution_time: duration,
        };
        let store = Arc::clone(&self.store);
        let artifact = tokio::task::spawn_blocking(move || store.save(&draft))
            .await
            .map_err(|e| StoreError::validation(format!("store task failed: {e}")))??;

        if artifact.checksum != checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: checksum.to_string(),
                actual: artifact.checksum,
            }
            .into());
        }
        Ok(artifact)
    }

    /// Collect every active device in `directory`
    ///
    /// Up to `workers` devices run at once; results are ordered by device id.
    #[instrument(skip(self, directory))]
    pub async fn collect_all(
        &self,
        directory: &dyn DeviceDirectory,
        triggered_by: &str,
    ) -> CollectAllSummary {
        let devices = directory.list_active();
        info!(devices = devices.len(), workers = self.workers, "Collecting all active devices");

        let mut results: Vec<CollectionResult> = stream::iter(devices.iter())
            .map(|device| self.collect(device, triggered_by))
            .buffer_unordered(self.workers)
            .collect()
            .await;
        results.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        let succeeded = results.iter().filter(|r| r.success).count();
        let summary = CollectAllSummary {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
        };
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Collection run finished"
        );
        summary
    }
}
