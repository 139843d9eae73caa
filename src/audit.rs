//! Sampled audit events for key lifecycle operations.
//!
//! Auditing is best-effort telemetry: a sink failure is logged and swallowed,
//! never failing or blocking the cryptographic operation that triggered it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    MaterialCreated,
    MaterialRotated,
    MaterialRetired,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub tenant_id: Uuid,
    pub elastic_key_id: Uuid,
    pub material_key_id: Uuid,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        action: AuditAction,
        tenant_id: Uuid,
        elastic_key_id: Uuid,
        material_key_id: Uuid,
    ) -> Self {
        Self {
            action,
            tenant_id,
            elastic_key_id,
            material_key_id,
            at: Utc::now(),
        }
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Sink that writes events to the structured log.
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let payload = serde_json::to_string(event)?;
        tracing::info!(target: "sealbase::audit", %payload, "audit event");
        Ok(())
    }
}

/// Sink that collects events in memory, for tests and local inspection.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Per-event sampling decision, independent across calls. An RNG failure
/// counts as not-sampled; telemetry never takes down the caller.
fn should_sample(rate: u8) -> bool {
    if rate == 0 {
        return false;
    }
    if rate >= 100 {
        return true;
    }
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_err() {
        tracing::warn!("audit sampling rng failure, skipping event");
        return false;
    }
    (u32::from_be_bytes(buf) % 100) < u32::from(rate)
}

/// Emit one event through the configured sink, subject to sampling.
pub(crate) fn emit(sink: &dyn AuditSink, config: &EngineConfig, event: AuditEvent) {
    if !config.audit_enabled || !should_sample(config.audit_sample_rate) {
        return;
    }
    if let Err(err) = sink.record(&event) {
        tracing::warn!(error = %err, action = ?event.action, "audit sink failure, event dropped");
    }
}
