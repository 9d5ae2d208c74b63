/*!
Local filesystem artifact store.

Layout: `{root}/{vendor}/{device}/{YYYYMMDD_HHMMSS}/` holding `config{ext}`,
`metadata.json` and `checksum.sha256`.
*/

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, info, warn};

use super::{ArtifactDraft, ArtifactFilter, ArtifactStore, ArtifactSummary, StoreStats, StoredArtifact};
use crate::metadata::{
    ArtifactMetadata, ArtifactStatus, ChecksumRecord, CHECKSUM_FILENAME, GENERATOR,
    METADATA_FILENAME, METADATA_FORMAT_VERSION,
};
use crate::{Result, StoreError};

/// Directory name format for the capture timestamp
pub const TIMESTAMP_DIR_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Local filesystem artifact store
///
/// # Example
/// ```rust,no_run
/// use cfgvault_core::storage::{ArtifactStore, LocalArtifactStore};
///
/// let store = LocalArtifactStore::open("/var/lib/cfgvault/storage")?;
/// assert!(store.verify("cisco/r1/20240501_020000/config.txt"));
/// # Ok::<(), cfgvault_core::StoreError>(())
/// ```
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    base_dir: PathBuf,
}

impl LocalArtifactStore {
    /// Open a store rooted at `base_dir`, creating the root if needed
    pub fn open<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).map_err(|e| {
            StoreError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create store root {}: {e}", base_dir.display()),
            ))
        })?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Absolute path of a stored relative path
    pub fn absolute_path(&self, path: &str) -> Result<PathBuf> {
        self.resolve_path(path)
    }

    /// Resolve a relative artifact path, refusing anything that leaves the root
    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if path.is_empty() {
            return Err(StoreError::invalid_path("empty path"));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(StoreError::invalid_path(path.to_string())),
            }
        }
        Ok(self.base_dir.join(relative))
    }

    fn artifact_dir(&self, draft: &ArtifactDraft, captured_at: DateTime<Utc>) -> PathBuf {
        self.base_dir
            .join(draft.vendor.tag())
            .join(draft.device_id.as_str())
            .join(captured_at.format(TIMESTAMP_DIR_FORMAT).to_string())
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.base_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    fn write_new(path: &Path, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    }

    fn mark_read_only(path: &Path) -> Result<()> {
        let mut permissions = fs::metadata(path)?.permissions();
        permissions.set_readonly(true);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }

    fn write_artifact(
        &self,
        dir: &Path,
        draft: &ArtifactDraft,
        captured_at: DateTime<Utc>,
    ) -> Result<StoredArtifact> {
        let profile = draft.vendor.profile();
        let file_name = profile.artifact_filename();
        let checksum = ArtifactMetadata::compute_hash(&draft.content);

        let metadata = ArtifactMetadata {
            vendor: draft.vendor,
            device_id: draft.device_id.clone(),
            device_ip: draft.device_address.clone(),
            connection_type: draft.transport,
            backup_command: profile.command.to_string(),
            timestamp: captured_at,
            execution_time_seconds: draft.execution_time.as_secs_f64(),
            status: ArtifactStatus::Success,
            checksum_sha256: checksum.clone(),
            file_name: file_name.clone(),
            file_size_bytes: draft.content.len() as u64,
            format_version: METADATA_FORMAT_VERSION,
            generator: GENERATOR.to_string(),
        };
        metadata.validate()?;

        let content_path = dir.join(&file_name);
        let metadata_path = dir.join(METADATA_FILENAME);
        let checksum_path = dir.join(CHECKSUM_FILENAME);

        Self::write_new(&content_path, &draft.content)?;
        Self::write_new(&metadata_path, &serde_json::to_vec_pretty(&metadata)?)?;
        Self::write_new(
            &checksum_path,
            ChecksumRecord::new(checksum.as_str(), file_name.as_str())
                .to_line()
                .as_bytes(),
        )?;

        for path in [&content_path, &metadata_path, &checksum_path] {
            Self::mark_read_only(path)?;
        }

        Ok(StoredArtifact {
            vendor: draft.vendor,
            device_id: draft.device_id.clone(),
            captured_at,
            command: metadata.backup_command,
            execution_time_seconds: metadata.execution_time_seconds,
            checksum,
            size: metadata.file_size_bytes,
            extension: profile.extension.to_string(),
            path: self.relative(&content_path),
            metadata_path: self.relative(&metadata_path),
            checksum_path: self.relative(&checksum_path),
        })
    }

    fn load_summary(&self, metadata_file: &Path) -> Result<ArtifactSummary> {
        let raw = fs::read(metadata_file)?;
        let metadata: ArtifactMetadata = serde_json::from_slice(&raw)?;
        let dir = metadata_file
            .parent()
            .ok_or_else(|| StoreError::invalid_path(metadata_file.display().to_string()))?;
        Ok(ArtifactSummary {
            path: self.relative(&dir.join(&metadata.file_name)),
            metadata,
        })
    }

    /// Collect every `metadata.json` exactly `depth` directory levels below `dir`.
    fn collect_metadata_files(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) -> Result<()> {
        if depth == 0 {
            let candidate = dir.join(METADATA_FILENAME);
            if candidate.is_file() {
                out.push(candidate);
            }
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                Self::collect_metadata_files(&entry.path(), depth - 1, out)?;
            }
        }
        Ok(())
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn save(&self, draft: &ArtifactDraft) -> Result<StoredArtifact> {
        let captured_at = draft.captured_at.trunc_subsecs(0);
        let dir = self.artifact_dir(draft, captured_at);

        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent)?;
        }

        // Exclusive create is the only collision guard.
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(
                    path = %self.relative(&dir),
                    "Refusing to overwrite existing artifact directory"
                );
                return Err(StoreError::ImmutabilityViolation {
                    path: self.relative(&dir),
                });
            }
            Err(e) => return Err(e.into()),
        }

        match self.write_artifact(&dir, draft, captured_at) {
            Ok(artifact) => {
                info!(
                    vendor = %artifact.vendor,
                    device = %artifact.device_id,
                    path = %artifact.path,
                    bytes = artifact.size,
                    "Artifact stored"
                );
                Ok(artifact)
            }
            Err(e) => {
                // The directory was created by this call and never completed.
                if let Err(cleanup) = fs::remove_dir_all(&dir) {
                    warn!(
                        path = %dir.display(),
                        error = %cleanup,
                        "Failed to remove incomplete artifact directory"
                    );
                }
                Err(e)
            }
        }
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.resolve_path(path)?;
        if !full_path.is_file() {
            return Err(StoreError::not_found(path));
        }
        Ok(fs::read(&full_path)?)
    }

    fn read_metadata(&self, path: &str) -> Result<ArtifactMetadata> {
        let full_path = self.resolve_path(path)?;
        let metadata_path = full_path
            .parent()
            .map(|dir| dir.join(METADATA_FILENAME))
            .ok_or_else(|| StoreError::invalid_path(path.to_string()))?;

        if !metadata_path.is_file() {
            return Err(StoreError::not_found(path));
        }

        let metadata: ArtifactMetadata = serde_json::from_slice(&fs::read(&metadata_path)?)?;
        if !metadata.is_compatible() {
            return Err(StoreError::validation(format!(
                "Incompatible metadata format version: {} (current: {})",
                metadata.format_version, METADATA_FORMAT_VERSION
            )));
        }
        Ok(metadata)
    }

    fn check(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        let checksum_path = full_path
            .parent()
            .map(|dir| dir.join(CHECKSUM_FILENAME))
            .ok_or_else(|| StoreError::invalid_path(path.to_string()))?;

        if !full_path.is_file() || !checksum_path.is_file() {
            return Err(StoreError::not_found(path));
        }

        let record = ChecksumRecord::parse(&fs::read_to_string(&checksum_path)?)?;
        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if record.file_name != file_name {
            return Err(StoreError::validation(format!(
                "checksum record names {} but {} was requested",
                record.file_name, file_name
            )));
        }

        let actual = ArtifactMetadata::compute_hash(&fs::read(&full_path)?);
        debug!(path, expected = %record.hash, actual = %actual, "Verifying artifact");
        if actual != record.hash {
            return Err(StoreError::IntegrityCheckFailed {
                expected: record.hash,
                actual,
            });
        }
        Ok(())
    }

    fn list(&self, filter: &ArtifactFilter) -> Result<Vec<ArtifactSummary>> {
        let (start, depth) = match (&filter.vendor, &filter.device_id) {
            (Some(vendor), Some(device)) => {
                (self.base_dir.join(vendor.tag()).join(device.as_str()), 1)
            }
            (Some(vendor), None) => (self.base_dir.join(vendor.tag()), 2),
            (None, _) => (self.base_dir.clone(), 3),
        };

        if !start.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        Self::collect_metadata_files(&start, depth, &mut files)?;

        let mut artifacts: Vec<ArtifactSummary> = files
            .iter()
            .filter_map(|file| match self.load_summary(file) {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "Skipping unreadable metadata");
                    None
                }
            })
            .filter(|summary| {
                filter
                    .device_id
                    .as_ref()
                    .map_or(true, |id| &summary.metadata.device_id == id)
            })
            .collect();

        artifacts.sort_by(|a, b| b.metadata.timestamp.cmp(&a.metadata.timestamp));
        Ok(artifacts)
    }

    fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        let mut files = Vec::new();
        Self::collect_metadata_files(&self.base_dir, 3, &mut files)?;

        for file in files {
            let summary = match self.load_summary(&file) {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "Skipping unreadable metadata");
                    continue;
                }
            };
            stats.total_artifacts += 1;
            *stats
                .artifacts_by_vendor
                .entry(summary.metadata.vendor.tag().to_string())
                .or_insert(0) += 1;

            if let Some(dir) = file.parent() {
                for entry in fs::read_dir(dir)? {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        stats.total_bytes += entry.metadata()?.len();
                    }
                }
            }
        }

        Ok(stats)
    }
}
