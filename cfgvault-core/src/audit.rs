/*!
Audit trail of collection activity.

Events are handed to an [`AuditSink`]. The default sink writes them as
structured `tracing` records on the `cfgvault::audit` target so they can be
routed to their own log file by the subscriber.
*/

use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tracing::info;

use crate::device::DeviceId;
use crate::error::{AttemptError, CaptureError};
use crate::vendor::Vendor;

/// Tracing target for audit records
pub const AUDIT_TARGET: &str = "cfgvault::audit";

/// Device status reported at the end of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Success,
    Failed,
    Timeout,
}

impl DeviceStatus {
    /// Status for a finished collection given its final error, if any
    pub fn from_error(error: Option<&CaptureError>) -> Self {
        match error {
            None => DeviceStatus::Success,
            Some(e) if e.is_timeout() => DeviceStatus::Timeout,
            Some(_) => DeviceStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    BackupStarted {
        device_id: DeviceId,
        device_name: String,
        vendor: Vendor,
        triggered_by: String,
    },
    AttemptFinished {
        device_id: DeviceId,
        attempt: u32,
        success: bool,
        duration_seconds: f64,
        error: Option<AttemptError>,
    },
    BackupCompleted {
        device_id: DeviceId,
        status: DeviceStatus,
        artifact_path: Option<String>,
        retries_used: u32,
        error: Option<AttemptError>,
        triggered_by: String,
    },
    RelayIngested {
        device_id: DeviceId,
        vendor: Vendor,
        artifact_path: String,
        delivered: bool,
    },
    IngestRejected {
        path: String,
        reason: String,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::BackupStarted { .. } => "backup_started",
            AuditEvent::AttemptFinished { .. } => "attempt_finished",
            AuditEvent::BackupCompleted { .. } => "backup_completed",
            AuditEvent::RelayIngested { .. } => "relay_ingested",
            AuditEvent::IngestRejected { .. } => "ingest_rejected",
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Writes audit events as `tracing` records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        let details = serde_json::to_string(event).unwrap_or_default();
        info!(target: AUDIT_TARGET, event = event.kind(), %details, "audit");
    }
}

/// Keeps events in memory, for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(AuditEvent::kind).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
