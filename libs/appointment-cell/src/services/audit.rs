// libs/appointment-cell/src/services/audit.rs
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use shared_database::supabase::SupabaseClient;

use crate::models::AppointmentId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub actor_id: Uuid,
    pub action: String,
    pub entity_id: AppointmentId,
    pub metadata: Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(actor_id: Uuid, action: impl Into<String>, entity_id: AppointmentId, metadata: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            actor_id,
            action: action.into(),
            entity_id,
            metadata,
            recorded_at: Utc::now(),
        }
    }
}

/// Where scheduling audit events go. Failures are reported, never retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// Deliver an event after a committed write; a failing sink only logs.
pub async fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    let event_id = event.event_id;
    let action = event.action.clone();
    if let Err(e) = sink.record(event).await {
        warn!(
            event_id = %event_id,
            action = %action,
            "Audit delivery failed, continuing: {}", e
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    #[instrument(skip(self, event))]
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
        info!(
            event_id = %event.event_id,
            actor_id = %event.actor_id,
            entity_id = event.entity_id,
            action = %event.action,
            metadata = %event.metadata,
            "AUDIT: {}", event.action
        );
        Ok(())
    }
}

/// Writes events to the `audit_log` table.
pub struct SupabaseAuditSink {
    supabase: Arc<SupabaseClient>,
    auth_token: String,
}

impl SupabaseAuditSink {
    pub fn new(supabase: Arc<SupabaseClient>, auth_token: impl Into<String>) -> Self {
        Self {
            supabase,
            auth_token: auth_token.into(),
        }
    }
}

#[async_trait]
impl AuditSink for SupabaseAuditSink {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
        let body = json!({
            "id": event.event_id,
            "actor_id": event.actor_id,
            "action": event.action,
            "entity_type": "appointment",
            "entity_id": event.entity_id,
            "metadata": event.metadata,
            "recorded_at": event.recorded_at,
        });

        self.supabase
            .execute(Method::POST, "/rest/v1/audit_log", Some(&self.auth_token), Some(body))
            .await
    }
}

/// Keeps events in memory; handy for inspecting what a flow emitted.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn actions(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.action).collect()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("audit recorder poisoned"))?
            .push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_swallows_sink_failures() {
        let mut sink = MockAuditSink::new();
        sink.expect_record()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("audit backend down")));

        emit(&sink, AuditEvent::new(Uuid::new_v4(), "appointment.created", 1, Value::Null)).await;
    }

    #[tokio::test]
    async fn recording_sink_keeps_events_in_order() {
        let sink = RecordingAuditSink::new();
        let actor = Uuid::new_v4();
        emit(&sink, AuditEvent::new(actor, "appointment.created", 1, json!({}))).await;
        emit(&sink, AuditEvent::new(actor, "appointment.confirm", 1, json!({}))).await;

        assert_eq!(sink.actions(), vec!["appointment.created", "appointment.confirm"]);
        assert!(sink.events().iter().all(|e| e.actor_id == actor));
    }
}
