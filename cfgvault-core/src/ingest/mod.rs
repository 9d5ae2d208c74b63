/*!
Ingestion of configuration files pushed by relay devices.

Uploads land under `{ingestion_root}/{vendor}/{device}/`. Depending on
[`RelayConsumer`], either the relay adapter picks the file up itself or the
[`IngestionCoordinator`] stores it and notifies the waiting adapter through the
[`RelayMailbox`]. Exactly one of the two consumes any given upload.
*/

pub mod ftp;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::config::RelayConsumer;
use crate::device::{DeviceDirectory, DeviceId};
use crate::error::{AttemptError, CaptureError, ErrorCategory, StoreError};
use crate::storage::{ArtifactDraft, ArtifactStore, StoredArtifact};
use crate::vendor::{Vendor, RELAY_FILENAME};

pub use ftp::FtpIngestionServer;

/// What a waiting relay adapter receives from the coordinator
pub type RelayDelivery = Result<StoredArtifact, AttemptError>;

/// Per-device hand-off point between the coordinator and relay adapters
#[derive(Debug, Default)]
pub struct RelayMailbox {
    next_token: AtomicU64,
    waiting: Mutex<HashMap<DeviceId, (u64, oneshot::Sender<RelayDelivery>)>>,
}

impl RelayMailbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register interest in the next upload for `device`.
    ///
    /// A newer subscription replaces an older one; the older receiver then
    /// sees its channel closed.
    pub fn subscribe(self: &Arc<Self>, device: &DeviceId) -> RelaySubscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.lock().insert(device.clone(), (token, sender));
        RelaySubscription {
            mailbox: Arc::clone(self),
            device: device.clone(),
            token,
            receiver,
        }
    }

    /// Hand a result to the subscriber for `device`; false if nobody waits
    pub fn deliver(&self, device: &DeviceId, delivery: RelayDelivery) -> bool {
        match self.lock().remove(device) {
            Some((_, sender)) => sender.send(delivery).is_ok(),
            None => false,
        }
    }

    pub fn is_waiting(&self, device: &DeviceId) -> bool {
        self.lock().contains_key(device)
    }

    fn cancel(&self, device: &DeviceId, token: u64) {
        let mut waiting = self.lock();
        if waiting.get(device).map(|(t, _)| *t) == Some(token) {
            waiting.remove(device);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceId, (u64, oneshot::Sender<RelayDelivery>)>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A pending wait for one device's upload; unregisters itself when dropped
#[derive(Debug)]
pub struct RelaySubscription {
    mailbox: Arc<RelayMailbox>,
    device: DeviceId,
    token: u64,
    receiver: oneshot::Receiver<RelayDelivery>,
}

impl RelaySubscription {
    /// Wait up to `budget` for the coordinator's delivery
    pub async fn wait(mut self, budget: Duration) -> Result<RelayDelivery, CaptureError> {
        match tokio::time::timeout(budget, &mut self.receiver).await {
            Ok(Ok(delivery)) => Ok(delivery),
            Ok(Err(_)) => Err(CaptureError::capture(
                "relay subscription was replaced or the coordinator went away",
            )),
            Err(_) => Err(CaptureError::RelayTimeout { waited: budget }),
        }
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.mailbox.cancel(&self.device, self.token);
    }
}

/// Tells the relay adapter whether uploads can currently be received
#[async_trait]
pub trait IngestionProbe: Send + Sync {
    async fn is_running(&self) -> bool;
}

/// Running flag shared with an in-process listener
#[derive(Debug, Clone, Default)]
pub struct ListenerHandle {
    running: Arc<AtomicBool>,
}

impl ListenerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IngestionProbe for ListenerHandle {
    async fn is_running(&self) -> bool {
        self.running()
    }
}

/// Probe for an out-of-process listener: can a TCP connection be opened?
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new<S: Into<String>>(address: S, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    /// Probe the FTP port on the local host
    pub fn local(port: u16) -> Self {
        Self::new(format!("127.0.0.1:{port}"), Duration::from_secs(5))
    }
}

#[async_trait]
impl IngestionProbe for TcpProbe {
    async fn is_running(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&self.address)).await,
            Ok(Ok(_))
        )
    }
}

/// What the coordinator did with an upload
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Stored; `delivered` tells whether an adapter was waiting for it
    Stored {
        artifact: StoredArtifact,
        delivered: bool,
    },
    /// Left in place for the polling relay adapter
    LeftForAdapter,
    Rejected { reason: String },
}

/// Reacts to files completed by the ingestion listener
pub struct IngestionCoordinator {
    root: PathBuf,
    consumer: RelayConsumer,
    store: Arc<dyn ArtifactStore>,
    directory: Arc<dyn DeviceDirectory>,
    mailbox: Arc<RelayMailbox>,
    audit: Arc<dyn AuditSink>,
}

impl IngestionCoordinator {
    pub fn new(
        root: impl Into<PathBuf>,
        consumer: RelayConsumer,
        store: Arc<dyn ArtifactStore>,
        directory: Arc<dyn DeviceDirectory>,
        mailbox: Arc<RelayMailbox>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            root: root.into(),
            consumer,
            store,
            directory,
            mailbox,
            audit,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mailbox(&self) -> &Arc<RelayMailbox> {
        &self.mailbox
    }

    /// Map an absolute upload path to `(vendor, device)`
    fn classify(&self, path: &Path) -> Result<(Vendor, DeviceId), String> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| "outside the ingestion root".to_string())?;

        let parts: Vec<&str> = relative
            .components()
            .map(|c| match c {
                Component::Normal(part) => part.to_str().ok_or_else(|| "non UTF-8 path".to_string()),
                _ => Err("unexpected path component".to_string()),
            })
            .collect::<Result<_, _>>()?;

        let [vendor, device, file_name] = parts.as_slice() else {
            return Err("expected {vendor}/{device}/{file}".to_string());
        };
        if !file_name.eq_ignore_ascii_case(RELAY_FILENAME) {
            return Err(format!("unexpected filename {file_name}"));
        }
        let vendor: Vendor = vendor.parse().map_err(|e: CaptureError| e.to_string())?;
        if !vendor.is_relay() {
            return Err(format!("vendor {vendor} does not upload configurations"));
        }
        let device = DeviceId::new(*device).map_err(|e| e.to_string())?;
        Ok((vendor, device))
    }

    fn reject(&self, path: &Path, reason: String) -> IngestOutcome {
        warn!(path = %path.display(), reason = %reason, "Upload rejected");
        self.audit.record(&AuditEvent::IngestRejected {
            path: path.display().to_string(),
            reason: reason.clone(),
        });
        IngestOutcome::Rejected { reason }
    }

    /// Handle a completed upload
    ///
    /// # Errors
    /// Read and store failures are returned (and delivered to a waiting
    /// adapter); the uploaded file is then left in place.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn on_file_received(&self, path: &Path) -> Result<IngestOutcome, StoreError> {
        let (vendor, device_id) = match self.classify(path) {
            Ok(found) => found,
            Err(reason) => return Ok(self.reject(path, reason)),
        };

        if self.consumer == RelayConsumer::AdapterPoll {
            debug!(device = %device_id, "Upload left for the polling adapter");
            return Ok(IngestOutcome::LeftForAdapter);
        }

        let Some(device) = self.directory.get(&device_id) else {
            return Ok(self.reject(path, format!("unknown device {device_id}")));
        };
        if device.vendor != vendor {
            return Ok(self.reject(
                path,
                format!("device {device_id} is {}, not {vendor}", device.vendor),
            ));
        }

        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(device = %device_id, error = %e, "Failed to read upload");
                self.mailbox.deliver(
                    &device_id,
                    Err(AttemptError::new(
                        ErrorCategory::Store,
                        format!("failed to read upload: {e}"),
                    )),
                );
                return Err(StoreError::Io(e));
            }
        };
        if content.is_empty() {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(error = %e, "Failed to remove empty upload");
            }
            return Ok(self.reject(path, "empty upload".to_string()));
        }

        let draft = ArtifactDraft {
            vendor,
            device_id: device_id.clone(),
            device_address: device.address.clone(),
            transport: device.transport,
            captured_at: Utc::now(),
            content,
            execution_time: Duration::ZERO,
        };
        let store = Arc::clone(&self.store);
        let saved = tokio::task::spawn_blocking(move || store.save(&draft))
            .await
            .map_err(|e| StoreError::validation(format!("store task failed: {e}")))
            .and_then(|result| result);

        let artifact = match saved {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(device = %device_id, error = %e, "Failed to store upload");
                self.mailbox.deliver(
                    &device_id,
                    Err(AttemptError::new(ErrorCategory::Store, e.to_string())),
                );
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(error = %e, "Failed to remove consumed upload");
        }

        let delivered = self.mailbox.deliver(&device_id, Ok(artifact.clone()));
        info!(
            device = %device_id,
            path = %artifact.path,
            delivered,
            "Relay upload stored"
        );
        self.audit.record(&AuditEvent::RelayIngested {
            device_id,
            vendor,
            artifact_path: artifact.path.clone(),
            delivered,
        });
        #[cfg(feature = "metrics")]
        crate::observability::with_metrics(|m| {
            m.record_ingested();
            m.record_artifact(artifact.size);
        });

        Ok(IngestOutcome::Stored {
            artifact,
            delivered,
        })
    }

    /// Discard an upload that did not complete
    pub async fn on_incomplete_file_received(&self, path: &Path) {
        if path.strip_prefix(&self.root).is_err() {
            warn!(path = %path.display(), "Ignoring incomplete upload outside the ingestion root");
            return;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!(path = %path.display(), "Removed incomplete upload"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove incomplete upload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::device::{Credentials, DeviceDescriptor, StaticDirectory};
    use crate::storage::LocalArtifactStore;
    use crate::vendor::Transport;
    use tempfile::TempDir;

    fn device(id: &str, vendor: Vendor) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId::new(id).unwrap(),
            name: id.to_uppercase(),
            address: "192.0.2.50".to_string(),
            port: None,
            transport: Transport::Telnet,
            vendor,
            credentials: Credentials {
                username: "u".to_string(),
                password: "p".to_string(),
                enable_secret: None,
            },
            active: true,
        }
    }

    struct Fixture {
        _dirs: (TempDir, TempDir),
        inbox_root: PathBuf,
        store: Arc<LocalArtifactStore>,
        audit: Arc<MemoryAuditSink>,
        coordinator: IngestionCoordinator,
    }

    fn fixture(consumer: RelayConsumer) -> Fixture {
        let inbox = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        let store = Arc::new(LocalArtifactStore::open(storage.path()).unwrap());
        let audit = Arc::new(MemoryAuditSink::new());
        let directory = Arc::new(StaticDirectory::new([
            device("olt1", Vendor::Zte),
            device("r1", Vendor::Cisco),
        ]));
        let coordinator = IngestionCoordinator::new(
            inbox.path(),
            consumer,
            store.clone(),
            directory,
            RelayMailbox::new(),
            audit.clone(),
        );
        Fixture {
            inbox_root: inbox.path().to_path_buf(),
            _dirs: (inbox, storage),
            store,
            audit,
            coordinator,
        }
    }

    fn upload(root: &Path, vendor: &str, device: &str, name: &str, content: &[u8]) -> PathBuf {
        let dir = root.join(vendor).join(device);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_mailbox_delivery_and_timeout() {
        let mailbox = RelayMailbox::new();
        let id = DeviceId::new("olt1").unwrap();

        assert!(!mailbox.deliver(&id, Err(AttemptError::new(ErrorCategory::Store, "x"))));

        let subscription = mailbox.subscribe(&id);
        assert!(mailbox.is_waiting(&id));
        let err = subscription.wait(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, CaptureError::RelayTimeout { .. }));
        assert!(!mailbox.is_waiting(&id));
    }

    #[tokio::test]
    async fn test_newer_subscription_replaces_older() {
        let mailbox = RelayMailbox::new();
        let id = DeviceId::new("olt1").unwrap();

        let first = mailbox.subscribe(&id);
        let second = mailbox.subscribe(&id);
        drop(first);
        assert!(mailbox.is_waiting(&id));
        drop(second);
        assert!(!mailbox.is_waiting(&id));
    }

    #[tokio::test]
    async fn test_coordinator_stores_and_delivers() {
        let f = fixture(RelayConsumer::Coordinator);
        let id = DeviceId::new("olt1").unwrap();
        let subscription = f.coordinator.mailbox().subscribe(&id);

        let path = upload(&f.inbox_root, "zte", "olt1", "startrun.dat", b"\x00\x01zte config");
        let outcome = f.coordinator.on_file_received(&path).await.unwrap();

        let IngestOutcome::Stored { artifact, delivered } = outcome else {
            panic!("expected stored outcome");
        };
        assert!(delivered);
        assert!(!path.exists());
        assert!(artifact.path.starts_with("zte/olt1/"));
        assert!(artifact.path.ends_with("config.dat"));
        assert_eq!(f.store.read(&artifact.path).unwrap(), b"\x00\x01zte config".to_vec());

        let delivery = subscription.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(delivery.unwrap(), artifact);
        assert_eq!(f.audit.kinds(), vec!["relay_ingested"]);
    }

    #[tokio::test]
    async fn test_unreadable_upload_is_delivered_as_store_error() {
        let f = fixture(RelayConsumer::Coordinator);
        let id = DeviceId::new("olt1").unwrap();
        let subscription = f.coordinator.mailbox().subscribe(&id);

        let path = f.inbox_root.join("zte").join("olt1").join("startrun.dat");
        let err = f.coordinator.on_file_received(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));

        let delivered = subscription.wait(Duration::from_secs(1)).await.unwrap();
        let failure = delivered.unwrap_err();
        assert_eq!(failure.category, ErrorCategory::Store);
        assert!(failure.message.contains("failed to read upload"));
        assert_eq!(f.store.stats().unwrap().total_artifacts, 0);
    }

    #[tokio::test]
    async fn test_coordinator_without_subscriber() {
        let f = fixture(RelayConsumer::Coordinator);
        let path = upload(&f.inbox_root, "zte", "olt1", "STARTRUN.DAT", b"cfg");

        let outcome = f.coordinator.on_file_received(&path).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Stored { delivered: false, .. }));
    }

    #[tokio::test]
    async fn test_adapter_poll_mode_leaves_file() {
        let f = fixture(RelayConsumer::AdapterPoll);
        let path = upload(&f.inbox_root, "zte", "olt1", "startrun.dat", b"cfg");

        let outcome = f.coordinator.on_file_received(&path).await.unwrap();
        assert_eq!(outcome, IngestOutcome::LeftForAdapter);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_rejections() {
        let f = fixture(RelayConsumer::Coordinator);

        let wrong_name = upload(&f.inbox_root, "zte", "olt1", "other.bin", b"x");
        let inline_vendor = upload(&f.inbox_root, "cisco", "r1", "startrun.dat", b"x");
        let unknown = upload(&f.inbox_root, "zte", "ghost", "startrun.dat", b"x");
        let mismatched = upload(&f.inbox_root, "zte", "r1", "startrun.dat", b"x");
        let empty = upload(&f.inbox_root, "zte", "olt1", "startrun.dat", b"");

        for path in [&wrong_name, &inline_vendor, &unknown, &mismatched, &empty] {
            let outcome = f.coordinator.on_file_received(path).await.unwrap();
            assert!(
                matches!(outcome, IngestOutcome::Rejected { .. }),
                "{} should be rejected",
                path.display()
            );
        }
        assert!(!empty.exists());
        assert_eq!(f.audit.kinds().len(), 5);
        assert_eq!(f.store.stats().unwrap().total_artifacts, 0);
    }

    #[tokio::test]
    async fn test_incomplete_upload_is_removed() {
        let f = fixture(RelayConsumer::Coordinator);
        let path = upload(&f.inbox_root, "zte", "olt1", "startrun.dat", b"half");

        f.coordinator.on_incomplete_file_received(&path).await;
        assert!(!path.exists());
        // Second call on a missing file is quiet.
        f.coordinator.on_incomplete_file_received(&path).await;
    }

    #[tokio::test]
    async fn test_listener_handle_probe() {
        let handle = ListenerHandle::new();
        assert!(!handle.is_running().await);
        handle.set_running(true);
        assert!(handle.clone().is_running().await);
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(TcpProbe::local(port).is_running().await);
        drop(listener);
        assert!(!TcpProbe::new(format!("127.0.0.1:{port}"), Duration::from_millis(500))
            .is_running()
            .await);
    }
}
