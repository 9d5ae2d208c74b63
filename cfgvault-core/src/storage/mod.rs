/*!
Artifact storage.

This module defines the storage abstraction (port) and the local filesystem
implementation (adapter). Artifacts are append-only: the port has no update or
delete operation.
*/

pub mod local;

use crate::device::DeviceId;
use crate::metadata::ArtifactMetadata;
use crate::vendor::{Transport, Vendor};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub use local::LocalArtifactStore;

/// A capture ready to be written
#[derive(Debug, Clone)]
pub struct ArtifactDraft {
    pub vendor: Vendor,
    pub device_id: DeviceId,
    pub device_address: String,
    pub transport: Transport,
    pub captured_at: DateTime<Utc>,
    pub content: Vec<u8>,
    pub execution_time: Duration,
}

/// A capture that has been written; never modified afterwards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub vendor: Vendor,
    pub device_id: DeviceId,
    pub captured_at: DateTime<Utc>,
    pub command: String,
    pub execution_time_seconds: f64,
    pub checksum: String,
    pub size: u64,
    pub extension: String,
    /// Content file path, relative to the store root
    pub path: String,
    pub metadata_path: String,
    pub checksum_path: String,
}

/// Short reference to a stored artifact, as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: String,
    pub checksum: String,
    pub size: u64,
}

impl From<&StoredArtifact> for ArtifactRef {
    fn from(artifact: &StoredArtifact) -> Self {
        Self {
            path: artifact.path.clone(),
            checksum: artifact.checksum.clone(),
            size: artifact.size,
        }
    }
}

/// Optional narrowing for [`ArtifactStore::list`]
#[derive(Debug, Clone, Default)]
pub struct ArtifactFilter {
    pub vendor: Option<Vendor>,
    pub device_id: Option<DeviceId>,
}

/// One listed artifact: its metadata and where its content lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub path: String,
    pub metadata: ArtifactMetadata,
}

/// Totals across the whole store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_artifacts: u64,
    pub total_bytes: u64,
    pub artifacts_by_vendor: BTreeMap<String, u64>,
}

/// Storage abstraction for immutable capture artifacts
///
/// Implementations must refuse to write a second artifact for the same
/// vendor, device and second, and must never overwrite stored bytes.
pub trait ArtifactStore: Send + Sync {
    /// Write a new artifact
    ///
    /// # Errors
    /// * `StoreError::ImmutabilityViolation` - an artifact already exists for this slot
    fn save(&self, draft: &ArtifactDraft) -> Result<StoredArtifact>;

    /// Read stored content by its relative path
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Read the metadata document belonging to a content path
    fn read_metadata(&self, path: &str) -> Result<ArtifactMetadata>;

    /// Recompute the content hash and compare it with the checksum record
    ///
    /// # Errors
    /// * `StoreError::IntegrityCheckFailed` - content no longer matches
    /// * `StoreError::NotFound` - content or checksum record missing
    fn check(&self, path: &str) -> Result<()>;

    /// True when the stored content still matches its checksum record
    fn verify(&self, path: &str) -> bool {
        self.check(path).is_ok()
    }

    /// List artifacts, newest first
    fn list(&self, filter: &ArtifactFilter) -> Result<Vec<ArtifactSummary>>;

    fn stats(&self) -> Result<StoreStats>;
}
