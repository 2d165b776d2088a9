// libs/appointment-cell/src/store/supabase.rs
//
// PostgREST-backed scheduling store. Reads are plain table queries; a commit
// ships the staged batch to the `commit_schedule_batch` function, where the
// exclusion constraints on `appointments` reject any double booking.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc, Weekday};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, warn};
use uuid::Uuid;

use shared_database::supabase::{SupabaseApiError, SupabaseClient};

use crate::models::{
    AgendaBlock, Appointment, AppointmentId, AppointmentSearchQuery, AppointmentStatus,
    ConsentKind, ConsentRecord, NewAppointment, Page, PatientFacts, Specialty, WorkingWindow,
};
use crate::services::calendar::Interval;

use super::{
    AppointmentStore, CommitOutcome, ConsentDirectory, LockScope, SchedulingTx, StoreError,
};

/// SQLSTATE raised by an exclusion-constraint violation.
const EXCLUSION_VIOLATION: &str = "23P01";
/// SQLSTATE raised when a serializable transaction cannot be ordered.
const SERIALIZATION_FAILURE: &str = "40001";
/// Custom SQLSTATE raised by `commit_schedule_batch` for a stale version.
const STALE_VERSION: &str = "PT409";
/// Custom SQLSTATE raised by `commit_schedule_batch` for a missing row.
const MISSING_ROW: &str = "PT404";

const COMMIT_FUNCTION: &str = "commit_schedule_batch";

pub struct SupabaseSchedulingStore {
    supabase: Arc<SupabaseClient>,
    auth_token: String,
}

impl SupabaseSchedulingStore {
    pub fn new(supabase: Arc<SupabaseClient>, auth_token: impl Into<String>) -> Self {
        Self {
            supabase,
            auth_token: auth_token.into(),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, StoreError> {
        self.supabase
            .request(Method::GET, path, Some(&self.auth_token), None)
            .await
            .map_err(map_api_error)
    }
}

fn encode_ts(ts: DateTime<Utc>) -> String {
    urlencoding::encode(&ts.to_rfc3339()).into_owned()
}

fn slot_holding_filter() -> String {
    let statuses: Vec<String> = AppointmentStatus::SLOT_HOLDING
        .iter()
        .map(|s| s.to_string())
        .collect();
    format!("status=in.({})", statuses.join(","))
}

/// Resource filter: rows on the professional, or on the room when one is given.
fn resource_filter(professional_id: Uuid, room_id: Option<Uuid>) -> String {
    match room_id {
        Some(room) => format!("or=(professional_id.eq.{},room_id.eq.{})", professional_id, room),
        None => format!("professional_id=eq.{}", professional_id),
    }
}

/// ISO weekday number, Monday = 1.
fn weekday_number(weekday: Weekday) -> u32 {
    weekday.number_from_monday()
}

pub(crate) fn map_api_error(err: anyhow::Error) -> StoreError {
    match err.downcast_ref::<SupabaseApiError>() {
        Some(api) if api.has_code(EXCLUSION_VIOLATION) => StoreError::SlotTaken(api.message.clone()),
        Some(api) if api.has_code(SERIALIZATION_FAILURE) || api.has_code(STALE_VERSION) => {
            StoreError::VersionMismatch {
                id: parse_appointment_id(&api.message).unwrap_or_default(),
                expected: 0,
                actual: None,
            }
        }
        Some(api) if api.has_code(MISSING_ROW) => {
            StoreError::NotFound(parse_appointment_id(&api.message).unwrap_or_default())
        }
        Some(api) if api.is_auth_error() => {
            error!("Supabase rejected the scheduling store credentials: {}", api.message);
            StoreError::Backend(api.to_string())
        }
        _ => {
            error!("Supabase scheduling request failed: {}", err);
            StoreError::Backend(err.to_string())
        }
    }
}

/// Messages from `commit_schedule_batch` look like `appointment 42: ...`.
fn parse_appointment_id(message: &str) -> Option<AppointmentId> {
    message
        .strip_prefix("appointment ")?
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()
}

#[derive(Debug, Deserialize)]
struct WorkingHoursRow {
    start_time: NaiveTime,
    end_time: NaiveTime,
}

#[derive(Debug, Deserialize)]
struct SpecialtyRow {
    specialty: Specialty,
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: Value,
}

#[derive(Debug, Serialize)]
struct StagedUpdate {
    appointment: Appointment,
    expected_version: i64,
}

#[derive(Debug, Deserialize)]
struct BatchResult {
    #[serde(default)]
    inserted: Vec<Appointment>,
    #[serde(default)]
    updated: Vec<Appointment>,
}

struct SupabaseTx {
    supabase: Arc<SupabaseClient>,
    auth_token: String,
    inserts: Vec<NewAppointment>,
    updates: Vec<StagedUpdate>,
}

#[async_trait]
impl SchedulingTx for SupabaseTx {
    async fn find_overlapping(
        &self,
        professional_id: Uuid,
        room_id: Option<Uuid>,
        interval: &Interval,
        exclude_id: Option<AppointmentId>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let mut query_parts = vec![
            resource_filter(professional_id, room_id),
            slot_holding_filter(),
            format!("start_time=lt.{}", encode_ts(interval.end())),
            format!("end_time=gt.{}", encode_ts(interval.start())),
        ];
        if let Some(id) = exclude_id {
            query_parts.push(format!("id=neq.{}", id));
        }

        let path = format!("/rest/v1/appointments?{}&order=start_time.asc", query_parts.join("&"));
        self.supabase
            .request(Method::GET, &path, Some(&self.auth_token), None)
            .await
            .map_err(map_api_error)
    }

    async fn find_blocks(
        &self,
        professional_id: Uuid,
        room_id: Option<Uuid>,
        interval: &Interval,
    ) -> Result<Vec<AgendaBlock>, StoreError> {
        let path = format!(
            "/rest/v1/agenda_blocks?{}&start_time=lt.{}&end_time=gt.{}&order=start_time.asc",
            resource_filter(professional_id, room_id),
            encode_ts(interval.end()),
            encode_ts(interval.start()),
        );
        self.supabase
            .request(Method::GET, &path, Some(&self.auth_token), None)
            .await
            .map_err(map_api_error)
    }

    fn stage_insert(&mut self, appointment: NewAppointment) {
        self.inserts.push(appointment);
    }

    fn stage_update(&mut self, appointment: Appointment, expected_version: i64) {
        self.updates.push(StagedUpdate {
            appointment,
            expected_version,
        });
    }

    async fn commit(self: Box<Self>) -> Result<CommitOutcome, StoreError> {
        if self.inserts.is_empty() && self.updates.is_empty() {
            return Ok(CommitOutcome::default());
        }

        debug!(
            "Committing schedule batch: {} insert(s), {} update(s)",
            self.inserts.len(),
            self.updates.len()
        );

        let args = json!({
            "inserts": self.inserts,
            "updates": self.updates,
        });

        let result: BatchResult = self
            .supabase
            .rpc(COMMIT_FUNCTION, Some(&self.auth_token), args)
            .await
            .map_err(|e| {
                let mapped = map_api_error(e);
                if matches!(mapped, StoreError::SlotTaken(_) | StoreError::VersionMismatch { .. }) {
                    warn!("Schedule batch rejected by storage: {}", mapped);
                }
                mapped
            })?;

        Ok(CommitOutcome {
            inserted: result.inserted,
            updated: result.updated,
        })
    }
}

#[async_trait]
impl AppointmentStore for SupabaseSchedulingStore {
    async fn begin(&self, _scope: LockScope) -> Result<Box<dyn SchedulingTx>, StoreError> {
        // Serialization happens inside the commit function.
        Ok(Box::new(SupabaseTx {
            supabase: self.supabase.clone(),
            auth_token: self.auth_token.clone(),
            inserts: Vec::new(),
            updates: Vec::new(),
        }))
    }

    async fn find_by_id(&self, id: AppointmentId) -> Result<Option<Appointment>, StoreError> {
        let path = format!("/rest/v1/appointments?id=eq.{}", id);
        let rows: Vec<Appointment> = self.get(&path).await?;
        Ok(rows.into_iter().next())
    }

    async fn find_rescheduled_from(&self, id: AppointmentId) -> Result<Vec<AppointmentId>, StoreError> {
        let path = format!(
            "/rest/v1/appointments?rescheduled_from_id=eq.{}&select=id&order=id.asc",
            id
        );
        let rows: Vec<IdRow> = self.get(&path).await?;
        Ok(rows.into_iter().filter_map(|row| row.id.as_i64()).collect())
    }

    async fn search(&self, query: &AppointmentSearchQuery) -> Result<Page<Appointment>, StoreError> {
        let mut query_parts = Vec::new();

        if let Some(patient_id) = query.patient_id {
            query_parts.push(format!("patient_id=eq.{}", patient_id));
        }
        if let Some(professional_id) = query.professional_id {
            query_parts.push(format!("professional_id=eq.{}", professional_id));
        }
        if let Some(room_id) = query.room_id {
            query_parts.push(format!("room_id=eq.{}", room_id));
        }
        if !query.statuses.is_empty() {
            let statuses: Vec<String> = query.statuses.iter().map(|s| s.to_string()).collect();
            query_parts.push(format!("status=in.({})", statuses.join(",")));
        }
        if let Some(appointment_type) = query.appointment_type {
            query_parts.push(format!("appointment_type=eq.{}", appointment_type));
        }
        if let Some(from) = query.from {
            query_parts.push(format!("start_time=gte.{}", encode_ts(from)));
        }
        if let Some(to) = query.to {
            query_parts.push(format!("start_time=lt.{}", encode_ts(to)));
        }

        query_parts.push("order=start_time.asc,id.asc".to_string());
        query_parts.push(format!("limit={}", query.limit));
        query_parts.push(format!("offset={}", query.offset));

        let path = format!("/rest/v1/appointments?{}", query_parts.join("&"));
        let (items, total): (Vec<Appointment>, Option<u64>) = self
            .supabase
            .request_with_count(&path, Some(&self.auth_token))
            .await
            .map_err(map_api_error)?;

        let total = total.unwrap_or(query.offset as u64 + items.len() as u64);
        Ok(Page {
            items,
            total,
            limit: query.limit,
            offset: query.offset,
        })
    }

    async fn find_working_hours(
        &self,
        professional_id: Uuid,
        weekday: Weekday,
    ) -> Result<Vec<WorkingWindow>, StoreError> {
        let path = format!(
            "/rest/v1/professional_working_hours?professional_id=eq.{}&weekday=eq.{}&order=start_time.asc",
            professional_id,
            weekday_number(weekday)
        );
        let rows: Vec<WorkingHoursRow> = self.get(&path).await?;
        Ok(rows
            .into_iter()
            .map(|row| WorkingWindow::new(row.start_time, row.end_time))
            .collect())
    }

    async fn find_specialties(&self, professional_id: Uuid) -> Result<HashSet<Specialty>, StoreError> {
        let path = format!(
            "/rest/v1/professional_specialties?professional_id=eq.{}&select=specialty",
            professional_id
        );
        let rows: Vec<SpecialtyRow> = self.get(&path).await?;
        Ok(rows.into_iter().map(|row| row.specialty).collect())
    }

    async fn professional_exists(&self, professional_id: Uuid) -> Result<bool, StoreError> {
        let path = format!("/rest/v1/professionals?id=eq.{}&select=id", professional_id);
        let rows: Vec<IdRow> = self.get(&path).await?;
        Ok(!rows.is_empty())
    }

    async fn room_exists(&self, room_id: Uuid) -> Result<bool, StoreError> {
        let path = format!("/rest/v1/rooms?id=eq.{}&select=id", room_id);
        let rows: Vec<IdRow> = self.get(&path).await?;
        Ok(!rows.is_empty())
    }
}

#[async_trait]
impl ConsentDirectory for SupabaseSchedulingStore {
    async fn find_patient(&self, patient_id: Uuid) -> Result<Option<PatientFacts>, StoreError> {
        let path = format!("/rest/v1/patients?id=eq.{}&select=id,birth_date", patient_id);
        let rows: Vec<PatientFacts> = self.get(&path).await?;
        Ok(rows.into_iter().next())
    }

    async fn find_active_consent(
        &self,
        patient_id: Uuid,
        appointment_id: AppointmentId,
        kind: ConsentKind,
    ) -> Result<Option<ConsentRecord>, StoreError> {
        let path = format!(
            "/rest/v1/consent_records?patient_id=eq.{}&appointment_id=eq.{}&kind=eq.{}&revoked_at=is.null&order=valid_until.desc.nullsfirst&limit=1",
            patient_id, appointment_id, kind
        );
        let rows: Vec<ConsentRecord> = self.get(&path).await?;
        Ok(rows.into_iter().next())
    }
}
