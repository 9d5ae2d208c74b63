//! Adapter for device families that print their configuration on the session

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{join_error, Capture, CaptureSource, SessionSettings, VendorAdapter};
use crate::device::DeviceDescriptor;
use crate::error::CaptureError;
use crate::metadata::ArtifactMetadata;
use crate::session::{ConnectTarget, Connectors, SessionGuard};
use crate::vendor::Vendor;

/// Connect, optionally elevate, run the vendor's one command, hash, close
#[derive(Debug, Clone)]
pub struct InlineAdapter {
    vendor: Vendor,
    settings: SessionSettings,
    connectors: Connectors,
}

impl InlineAdapter {
    pub fn new(vendor: Vendor, settings: SessionSettings, connectors: Connectors) -> Self {
        Self {
            vendor,
            settings,
            connectors,
        }
    }
}

#[async_trait]
impl VendorAdapter for InlineAdapter {
    fn vendor(&self) -> Vendor {
        self.vendor
    }

    #[instrument(skip(self, device), fields(device = %device.id, vendor = %self.vendor))]
    async fn backup(&self, device: &DeviceDescriptor) -> Result<Capture, CaptureError> {
        let profile = self.vendor.profile();
        if !profile.permits(device.transport) {
            return Err(CaptureError::unsupported(format!(
                "{} does not support {}",
                self.vendor, device.transport
            )));
        }

        let connector = self.connectors.for_transport(device.transport);
        let target = ConnectTarget::for_device(
            device,
            self.settings.connect_timeout,
            self.settings.command_timeout,
        );
        let secret = device
            .credentials
            .enable_secret
            .clone()
            .filter(|s| profile.privileged && !s.is_empty());
        let command = profile.command;
        let command_timeout = self.settings.command_timeout;

        let started = Instant::now();
        let output = tokio::task::spawn_blocking(move || -> Result<String, CaptureError> {
            let mut session = SessionGuard::new(connector.connect(&target)?);
            debug!(endpoint = %target.endpoint(), "Session opened");
            if let Some(secret) = secret {
                session.elevate(&secret)?;
            }
            let output = session.run(command, command_timeout)?;
            session.finish();
            Ok(output)
        })
        .await
        .map_err(join_error)??;
        let duration = started.elapsed();

        if output.trim().is_empty() {
            return Err(CaptureError::capture(format!(
                "{command:?} returned no output"
            )));
        }

        let bytes = output.into_bytes();
        let checksum = ArtifactMetadata::compute_hash(&bytes);
        info!(
            bytes = bytes.len(),
            seconds = duration.as_secs_f64(),
            "Configuration captured"
        );

        Ok(Capture::Content {
            bytes,
            checksum,
            duration,
            source: CaptureSource::Session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::fakes::{FakeConnector, Script};
    use crate::device::{Credentials, DeviceId};
    use crate::error::{ConnectFailure, ErrorCategory};
    use crate::vendor::Transport;
    use std::sync::Arc;

    fn device(vendor: Vendor, transport: Transport, enable: Option<&str>) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId::new("sw1").unwrap(),
            name: "Switch 1".to_string(),
            address: "192.0.2.1".to_string(),
            port: None,
            transport,
            vendor,
            credentials: Credentials {
                username: "backup".to_string(),
                password: "pw".to_string(),
                enable_secret: enable.map(str::to_string),
            },
            active: true,
        }
    }

    fn adapter(vendor: Vendor, connector: Arc<FakeConnector>) -> InlineAdapter {
        InlineAdapter::new(
            vendor,
            SessionSettings::default(),
            Connectors::new(connector.clone(), connector),
        )
    }

    #[tokio::test]
    async fn test_capture_hashes_raw_output() {
        let connector = FakeConnector::new([Script::Output("hostname sw1\n".to_string())]);
        let capture = adapter(Vendor::Huawei, connector.clone())
            .backup(&device(Vendor::Huawei, Transport::Ssh, None))
            .await
            .unwrap();

        let Capture::Content { bytes, checksum, source, .. } = capture else {
            panic!("inline capture must carry content");
        };
        assert_eq!(bytes, b"hostname sw1\n".to_vec());
        assert_eq!(checksum, ArtifactMetadata::compute_hash(b"hostname sw1\n"));
        assert_eq!(source, CaptureSource::Session);
        assert_eq!(
            connector.journal.entries(),
            vec![
                "connect:192.0.2.1:22".to_string(),
                "run:display current-configuration".to_string(),
                "close".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_cisco_elevates_only_with_secret() {
        let connector = FakeConnector::new([Script::Output("version 15\n".to_string())]);
        let cisco = adapter(Vendor::Cisco, connector.clone());

        cisco
            .backup(&device(Vendor::Cisco, Transport::Telnet, Some("en")))
            .await
            .unwrap();
        cisco
            .backup(&device(Vendor::Cisco, Transport::Telnet, None))
            .await
            .unwrap();
        assert_eq!(connector.journal.count("elevate:"), 1);
        assert_eq!(connector.journal.entries()[1], "elevate:en");

        // Huawei never elevates, even when a secret is stored.
        let huawei_connector = FakeConnector::new([Script::Output("sysname x\n".to_string())]);
        adapter(Vendor::Huawei, huawei_connector.clone())
            .backup(&device(Vendor::Huawei, Transport::Ssh, Some("en")))
            .await
            .unwrap();
        assert_eq!(huawei_connector.journal.count("elevate:"), 0);
    }

    #[tokio::test]
    async fn test_session_closed_when_command_fails() {
        let connector = FakeConnector::new([Script::RunFails("timed out".to_string())]);
        let err = adapter(Vendor::Juniper, connector.clone())
            .backup(&device(Vendor::Juniper, Transport::Ssh, None))
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Capture);
        assert_eq!(connector.journal.count("close"), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let connector = FakeConnector::new([Script::Refuse(ConnectFailure::Authentication)]);
        let err = adapter(Vendor::MikroTik, connector)
            .backup(&device(Vendor::MikroTik, Transport::Ssh, None))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Connect);
    }

    #[tokio::test]
    async fn test_empty_output_is_a_capture_error() {
        let connector = FakeConnector::new([Script::Output("  \n".to_string())]);
        let err = adapter(Vendor::Generic, connector)
            .backup(&device(Vendor::Generic, Transport::Ssh, None))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Capture);
    }

    #[tokio::test]
    async fn test_unpermitted_transport() {
        let connector = FakeConnector::new([Script::Output("x".to_string())]);
        let err = adapter(Vendor::Juniper, connector.clone())
            .backup(&device(Vendor::Juniper, Transport::Telnet, None))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Unsupported);
        assert!(connector.journal.entries().is_empty());
    }
}
