/*!
Artifact metadata document and checksum record.
*/

use crate::device::DeviceId;
use crate::error::{Result, StoreError};
use crate::vendor::{Transport, Vendor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current metadata format version for compatibility tracking
pub const METADATA_FORMAT_VERSION: u8 = 1;

/// Generator tag written into every metadata document
pub const GENERATOR: &str = concat!("cfgvault/", env!("CARGO_PKG_VERSION"));

pub const METADATA_FILENAME: &str = "metadata.json";
pub const CHECKSUM_FILENAME: &str = "checksum.sha256";

/// Capture status recorded in the metadata document
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    Success,
}

/// Metadata stored next to every captured configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArtifactMetadata {
    pub vendor: Vendor,

    pub device_id: DeviceId,

    /// Management address the capture was taken from
    pub device_ip: String,

    pub connection_type: Transport,

    /// The compiled vendor command (never the relay trigger with its credentials)
    pub backup_command: String,

    /// ISO 8601 capture timestamp, second resolution
    pub timestamp: DateTime<Utc>,

    pub execution_time_seconds: f64,

    pub status: ArtifactStatus,

    /// SHA-256 of the content file, lowercase hex
    pub checksum_sha256: String,

    pub file_name: String,

    pub file_size_bytes: u64,

    /// Format version for compatibility (current: 1)
    pub format_version: u8,

    pub generator: String,
}

impl ArtifactMetadata {
    /// Compute SHA-256 hash of the provided data
    ///
    /// # Returns
    /// Hexadecimal string representation of the SHA-256 hash
    pub fn compute_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    /// Verify content against the recorded hash
    pub fn verify_integrity(&self, content: &[u8]) -> Result<()> {
        let computed_hash = Self::compute_hash(content);
        if computed_hash == self.checksum_sha256 {
            Ok(())
        } else {
            Err(StoreError::IntegrityCheckFailed {
                expected: self.checksum_sha256.clone(),
                actual: computed_hash,
            })
        }
    }

    /// Validate that all required fields are properly set
    pub fn validate(&self) -> Result<()> {
        if self.backup_command.is_empty() {
            return Err(StoreError::validation("backup_command cannot be empty"));
        }
        if !is_sha256_hex(&self.checksum_sha256) {
            return Err(StoreError::validation(
                "checksum_sha256 must be 64 lowercase hex characters",
            ));
        }
        if self.file_name.is_empty() || self.file_name.contains('/') {
            return Err(StoreError::validation("file_name must be a bare filename"));
        }
        if !self.execution_time_seconds.is_finite() || self.execution_time_seconds < 0.0 {
            return Err(StoreError::validation(
                "execution_time_seconds must be a non-negative number",
            ));
        }
        Ok(())
    }

    /// Check if this metadata is compatible with the current format version
    pub fn is_compatible(&self) -> bool {
        self.format_version <= METADATA_FORMAT_VERSION
    }
}

/// The `<hex-hash>  <filename>` line stored as `checksum.sha256`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumRecord {
    pub hash: String,
    pub file_name: String,
}

impl ChecksumRecord {
    pub fn new<H: Into<String>, F: Into<String>>(hash: H, file_name: F) -> Self {
        Self {
            hash: hash.into(),
            file_name: file_name.into(),
        }
    }

    pub fn to_line(&self) -> String {
        format!("{}  {}\n", self.hash, self.file_name)
    }

    /// Parse the first line of a checksum file.
    pub fn parse(raw: &str) -> Result<Self> {
        let line = raw.lines().next().unwrap_or_default();
        let (hash, file_name) = line
            .split_once("  ")
            .ok_or_else(|| StoreError::validation("checksum record is missing a filename"))?;

        if !is_sha256_hex(hash) {
            return Err(StoreError::validation(format!(
                "checksum record has a malformed hash: {hash}"
            )));
        }
        let file_name = file_name.trim_end();
        if file_name.is_empty() {
            return Err(StoreError::validation("checksum record filename is empty"));
        }

        Ok(Self::new(hash, file_name))
    }
}

fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
