//! Adapter for the device family that uploads its configuration over FTP
//!
//! The device is told where to upload, the session is closed, and only then
//! is the inbox watched. No device session is held while waiting.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use super::{join_error, Capture, CaptureSource, RelayContext, SessionSettings, VendorAdapter};
use crate::config::RelayConsumer;
use crate::device::{DeviceDescriptor, DeviceId};
use crate::error::{CaptureError, ErrorCategory, StoreError};
use crate::metadata::ArtifactMetadata;
use crate::session::{ConnectTarget, Connectors, SessionGuard};
use crate::vendor::{Vendor, RELAY_FILENAME};

/// Progress of one relay capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    InboxCleared,
    Connected,
    CommandIssued,
    Disconnected,
    Polling,
    Received,
    TimedOut,
    Done,
}

/// The export command sent to a relay device
///
/// The base command comes from the vendor table; only the upload target is
/// appended. `Display` hides the password.
#[derive(Clone, PartialEq, Eq)]
pub struct RelayTrigger {
    base: &'static str,
    server: String,
    path: String,
    user: String,
    password: String,
}

impl RelayTrigger {
    pub fn new(vendor: Vendor, device_id: &DeviceId, server: &str, user: &str, password: &str) -> Self {
        Self {
            base: vendor.profile().command,
            server: server.to_string(),
            path: format!("{}/{}/", vendor.tag(), device_id),
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    /// The line actually sent to the device
    pub fn command_line(&self) -> String {
        self.render(&self.password)
    }

    fn render(&self, password: &str) -> String {
        format!(
            "{} ipaddress {} path {} user {} password {}",
            self.base, self.server, self.path, self.user, password
        )
    }
}

impl fmt::Display for RelayTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render("********"))
    }
}

impl fmt::Debug for RelayTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayTrigger({self})")
    }
}

#[derive(Debug, Clone)]
pub struct RelayAdapter {
    vendor: Vendor,
    settings: SessionSettings,
    connectors: Connectors,
    relay: RelayContext,
}

impl RelayAdapter {
    pub fn new(
        vendor: Vendor,
        settings: SessionSettings,
        connectors: Connectors,
        relay: RelayContext,
    ) -> Self {
        Self {
            vendor,
            settings,
            connectors,
            relay,
        }
    }

    fn inbox(&self, device: &DeviceDescriptor) -> PathBuf {
        self.relay.config.inbox(self.vendor.tag(), device.id.as_str())
    }

    /// Run the capture and report every state it passed through
    pub(crate) async fn run(
        &self,
        device: &DeviceDescriptor,
    ) -> (Result<Capture, CaptureError>, Vec<RelayState>) {
        let mut states = vec![RelayState::Idle];
        let result = self.drive(device, &mut states).await;
        if states.last() == Some(&RelayState::Polling) {
            match &result {
                Ok(_) => states.push(RelayState::Received),
                Err(CaptureError::RelayTimeout { .. }) => states.push(RelayState::TimedOut),
                Err(_) => {}
            }
        }
        states.push(RelayState::Done);
        (result, states)
    }

    async fn drive(
        &self,
        device: &DeviceDescriptor,
        states: &mut Vec<RelayState>,
    ) -> Result<Capture, CaptureError> {
        let profile = self.vendor.profile();
        if !profile.permits(device.transport) {
            return Err(CaptureError::unsupported(format!(
                "{} does not support {}",
                self.vendor, device.transport
            )));
        }

        let config = &self.relay.config;
        if !self.relay.probe.is_running().await {
            return Err(CaptureError::precondition(
                "FTP ingestion listener is not running",
            ));
        }
        if config.ftp_password.is_empty() {
            return Err(CaptureError::precondition("FTP password is not configured"));
        }
        let Some(server) = config.resolve_server_address(&device.address) else {
            return Err(CaptureError::precondition(format!(
                "no local address routes to {}; set the server address",
                device.address
            )));
        };

        let inbox = self.inbox(device);
        let target_file = inbox.join(RELAY_FILENAME);
        clear_inbox(&inbox, &target_file).await?;
        states.push(RelayState::InboxCleared);

        let subscription = (config.consumer == RelayConsumer::Coordinator)
            .then(|| self.relay.mailbox.subscribe(&device.id));

        let trigger = RelayTrigger::new(
            self.vendor,
            &device.id,
            &server,
            &config.ftp_user,
            &config.ftp_password,
        );
        info!(trigger = %trigger, "Triggering relay upload");

        let started = Instant::now();
        let connector = self.connectors.for_transport(device.transport);
        let target = ConnectTarget::for_device(
            device,
            self.settings.connect_timeout,
            self.settings.command_timeout,
        );
        let grace = config.trigger_grace;
        let (session_result, session_states) =
            tokio::task::spawn_blocking(move || {
                let mut reached = Vec::new();
                let result = (|| -> Result<(), CaptureError> {
                    let mut session = SessionGuard::new(connector.connect(&target)?);
                    reached.push(RelayState::Connected);
                    let output = session.trigger(&trigger.command_line(), grace)?;
                    reached.push(RelayState::CommandIssued);
                    debug!(output_bytes = output.len(), "Trigger acknowledged");
                    session.finish();
                    reached.push(RelayState::Disconnected);
                    Ok(())
                })();
                (result, reached)
            })
            .await
            .map_err(join_error)?;
        states.extend(session_states);
        session_result?;

        states.push(RelayState::Polling);
        let budget = config.poll_budget;
        match subscription {
            Some(subscription) => match subscription.wait(budget).await? {
                Ok(artifact) => Ok(Capture::Ingested(artifact)),
                Err(failure) if failure.category == ErrorCategory::Store => {
                    Err(CaptureError::Store(StoreError::validation(failure.message)))
                }
                Err(failure) => Err(CaptureError::capture(failure.message)),
            },
            None => {
                let bytes = self.poll_inbox(&target_file).await?;
                let checksum = ArtifactMetadata::compute_hash(&bytes);
                Ok(Capture::Content {
                    bytes,
                    checksum,
                    duration: started.elapsed(),
                    source: CaptureSource::RelayInbox,
                })
            }
        }
    }

    /// Watch for the upload until the budget runs out, then consume it
    async fn poll_inbox(&self, file: &Path) -> Result<Vec<u8>, CaptureError> {
        let config = &self.relay.config;
        let started = Instant::now();

        loop {
            if tokio::fs::metadata(file).await.is_ok_and(|m| m.is_file()) {
                sleep(config.settle_interval).await;
                let size = tokio::fs::metadata(file).await.map(|m| m.len()).unwrap_or(0);
                if size > 0 {
                    let bytes = tokio::fs::read(file).await.map_err(|e| {
                        CaptureError::capture(format!("failed to read relay upload: {e}"))
                    })?;
                    if let Err(e) = tokio::fs::remove_file(file).await {
                        warn!(path = %file.display(), error = %e, "Failed to consume relay upload");
                    }
                    info!(bytes = bytes.len(), "Relay upload received");
                    return Ok(bytes);
                }
                debug!("Relay upload still empty after settling");
            }

            let elapsed = started.elapsed();
            if elapsed >= config.poll_budget {
                return Err(CaptureError::RelayTimeout {
                    waited: config.poll_budget,
                });
            }
            sleep(config.poll_interval.min(config.poll_budget - elapsed)).await;
        }
    }
}

async fn clear_inbox(inbox: &Path, target_file: &Path) -> Result<(), CaptureError> {
    tokio::fs::create_dir_all(inbox).await.map_err(|e| {
        CaptureError::precondition(format!("cannot create inbox {}: {e}", inbox.display()))
    })?;
    match tokio::fs::remove_file(target_file).await {
        Ok(()) => {
            debug!(path = %target_file.display(), "Removed stale relay upload");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CaptureError::precondition(format!(
            "cannot clear stale upload {}: {e}",
            target_file.display()
        ))),
    }
}

#[async_trait]
impl VendorAdapter for RelayAdapter {
    fn vendor(&self) -> Vendor {
        self.vendor
    }

    #[instrument(skip(self, device), fields(device = %device.id, vendor = %self.vendor))]
    async fn backup(&self, device: &DeviceDescriptor) -> Result<Capture, CaptureError> {
        let (result, states) = self.run(device).await;
        debug!(?states, "Relay capture finished");
        result
    }
}
