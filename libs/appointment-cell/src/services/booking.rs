// libs/appointment-cell/src/services/booking.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::AppointmentError;
use crate::models::{
    Actor, Appointment, AppointmentDetail, AppointmentId, AppointmentSearchQuery,
    ConflictCheckRequest, ConflictCheckResponse, ConflictSet, CreateAppointmentRequest,
    NewAppointment, Page, RescheduleOutcome, RescheduleRequest, Role, TransitionRequest,
};
use crate::services::audit::{emit, AuditEvent, AuditSink};
use crate::services::availability::AvailabilityEvaluator;
use crate::services::calendar::{Clock, Interval, SystemClock};
use crate::services::conflict::{ConflictDetectionService, ConflictQuery};
use crate::services::consent::{ConsentGate, ConsentQuery};
use crate::services::lifecycle::{AppointmentLifecycleService, Guard};
use crate::services::rbac;
use crate::settings::SchedulingSettings;
use crate::store::{AppointmentStore, ConsentDirectory, LockScope, StoreError};

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_TEXT_LENGTH: usize = 2_000;

/// The scheduling operations exposed to callers. Every write runs as one
/// store transaction; audit events go out only after it commits.
pub struct SchedulingService {
    store: Arc<dyn AppointmentStore>,
    consents: Arc<dyn ConsentDirectory>,
    availability: AvailabilityEvaluator,
    conflict_service: ConflictDetectionService,
    consent_gate: ConsentGate,
    lifecycle_service: AppointmentLifecycleService,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    settings: SchedulingSettings,
}

impl SchedulingService {
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        consents: Arc<dyn ConsentDirectory>,
        audit: Arc<dyn AuditSink>,
        settings: SchedulingSettings,
    ) -> Self {
        Self {
            availability: AvailabilityEvaluator::new(Arc::clone(&store), settings.calendar),
            conflict_service: ConflictDetectionService::new(),
            consent_gate: ConsentGate::new(
                Arc::clone(&consents),
                settings.calendar,
                settings.age_of_majority,
            ),
            lifecycle_service: AppointmentLifecycleService::new(),
            store,
            consents,
            audit,
            clock: Arc::new(SystemClock),
            settings,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &SchedulingSettings {
        &self.settings
    }

    // ==========================================================================
    // CREATE
    // ==========================================================================

    #[instrument(skip(self, request), fields(professional_id = %request.professional_id, patient_id = %request.patient_id))]
    pub async fn create_appointment(
        &self,
        actor: &Actor,
        request: CreateAppointmentRequest,
    ) -> Result<Appointment, AppointmentError> {
        info!("Creating appointment for patient {} with professional {}",
              request.patient_id, request.professional_id);

        // Step 1: permission and shape
        if !rbac::can_book(actor.role) {
            return Err(AppointmentError::unauthorized(actor.role, "create"));
        }
        let interval = resolve_interval(
            request.start_time,
            request.end_time,
            request.estimated_duration_minutes,
        )?;
        validate_text("reason", request.reason.as_deref())?;
        validate_text("notes", request.notes.as_deref())?;
        if request.planned_procedures.iter().any(|p| p.code.trim().is_empty()) {
            return Err(AppointmentError::Validation(
                "planned procedure code must not be empty".to_string(),
            ));
        }

        // Step 2: referenced parties
        self.verify_parties(request.patient_id, request.professional_id, request.room_id)
            .await?;

        // Step 3: working hours and specialty
        self.require_available(request.professional_id, &interval, request.appointment_type)
            .await?;

        // Step 4: conflict check and insert under one transaction
        let query = ConflictQuery {
            interval,
            professional_id: request.professional_id,
            room_id: request.room_id,
            exclude_id: None,
        };
        let new_appointment = NewAppointment {
            patient_id: request.patient_id,
            professional_id: request.professional_id,
            room_id: request.room_id,
            start_time: interval.start(),
            end_time: interval.end(),
            estimated_duration_minutes: interval.duration_minutes() as i32,
            appointment_type: request.appointment_type,
            reason: request.reason,
            notes: request.notes,
            planned_procedures: request.planned_procedures,
            created_by_id: actor.user_id,
            rescheduled_from_id: None,
            created_at: self.clock.now(),
        };

        let mut tx = self
            .store
            .begin(LockScope::for_slot(query.professional_id, query.room_id))
            .await?;
        let conflicts = self.conflict_service.find_conflicts(tx.as_ref(), &query).await?;
        if !conflicts.is_empty() {
            return Err(AppointmentError::Overlap { conflicts });
        }
        tx.stage_insert(new_appointment);
        let outcome = self.commit_or_explain(tx.commit().await, &query).await?;

        let appointment = outcome
            .inserted
            .into_iter()
            .next()
            .ok_or_else(|| internal("store returned no inserted appointment"))?;

        // Step 5: audit
        info!("Appointment {} created for professional {} at {}",
              appointment.id, appointment.professional_id, interval);
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                actor.user_id,
                "appointment.created",
                appointment.id,
                json!({
                    "role": actor.role,
                    "professional_id": appointment.professional_id,
                    "room_id": appointment.room_id,
                    "start_time": appointment.start_time,
                    "end_time": appointment.end_time,
                }),
            ),
        )
        .await;

        Ok(appointment)
    }

    // ==========================================================================
    // TRANSITION
    // ==========================================================================

    #[instrument(skip(self, request), fields(action = %request.action))]
    pub async fn transition_appointment(
        &self,
        id: AppointmentId,
        actor: &Actor,
        request: TransitionRequest,
    ) -> Result<Appointment, AppointmentError> {
        let current = self.load(id).await?;

        // Terminal, role, edge
        let transition = self
            .lifecycle_service
            .authorize(&current, actor, request.action)?;

        // Consent at the instant of start
        if transition.guards.contains(&Guard::ConsentGate) {
            let decision = self
                .consent_gate
                .evaluate(ConsentQuery::from(&current))
                .await?;
            if decision.blocks_start {
                return Err(AppointmentError::ConsentRequired { decision });
            }
        }

        // Caller's view must still be current
        self.lifecycle_service
            .check_version(&current, request.expected_version)?;

        let now = self.clock.now();
        let updated = self
            .lifecycle_service
            .apply(&current, transition, actor, request.note, now);

        let mut tx = self.store.begin(LockScope::none()).await?;
        tx.stage_update(updated, current.version);
        let outcome = tx.commit().await.map_err(|e| self.version_error(e, &current))?;

        let appointment = outcome
            .updated
            .into_iter()
            .next()
            .ok_or_else(|| internal("store returned no updated appointment"))?;

        info!("Appointment {} moved {} -> {} by {}",
              appointment.id, current.status, appointment.status, actor.role);
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                actor.user_id,
                format!("appointment.{}", request.action),
                appointment.id,
                json!({
                    "role": actor.role,
                    "from": current.status,
                    "to": appointment.status,
                    "version": appointment.version,
                }),
            ),
        )
        .await;

        Ok(appointment)
    }

    // ==========================================================================
    // RESCHEDULE
    // ==========================================================================

    #[instrument(skip(self, request))]
    pub async fn reschedule_appointment(
        &self,
        id: AppointmentId,
        actor: &Actor,
        request: RescheduleRequest,
    ) -> Result<RescheduleOutcome, AppointmentError> {
        if !rbac::can_book(actor.role) {
            return Err(AppointmentError::unauthorized(actor.role, "reschedule"));
        }
        let interval = resolve_interval(
            request.new_start_time,
            request.new_end_time,
            request.new_duration_minutes,
        )?;

        let source = self.load(id).await?;
        let now = self.clock.now();
        let cancelled = self
            .lifecycle_service
            .cancel_for_reschedule(&source, actor, now)?;
        self.lifecycle_service
            .check_version(&source, request.expected_version)?;

        // Same parties, new slot, full create-path checks
        self.require_available(source.professional_id, &interval, source.appointment_type)
            .await?;

        let query = ConflictQuery {
            interval,
            professional_id: source.professional_id,
            room_id: source.room_id,
            exclude_id: Some(source.id),
        };
        let replacement = NewAppointment {
            patient_id: source.patient_id,
            professional_id: source.professional_id,
            room_id: source.room_id,
            start_time: interval.start(),
            end_time: interval.end(),
            estimated_duration_minutes: interval.duration_minutes() as i32,
            appointment_type: source.appointment_type,
            reason: source.reason.clone(),
            notes: source.notes.clone(),
            planned_procedures: source.planned_procedures.clone(),
            created_by_id: actor.user_id,
            rescheduled_from_id: Some(source.id),
            created_at: now,
        };

        let mut tx = self
            .store
            .begin(LockScope::for_slot(source.professional_id, source.room_id))
            .await?;
        let conflicts = self.conflict_service.find_conflicts(tx.as_ref(), &query).await?;
        if !conflicts.is_empty() {
            warn!("Reschedule of appointment {} rejected, source left untouched", source.id);
            return Err(AppointmentError::Overlap { conflicts });
        }
        tx.stage_update(cancelled, source.version);
        tx.stage_insert(replacement);

        let outcome = match tx.commit().await {
            Err(StoreError::VersionMismatch { .. }) => {
                return Err(self.version_error_for(&source).await);
            }
            other => self.commit_or_explain(other, &query).await?,
        };

        let cancelled = outcome
            .updated
            .into_iter()
            .next()
            .ok_or_else(|| internal("store returned no cancelled source"))?;
        let created = outcome
            .inserted
            .into_iter()
            .next()
            .ok_or_else(|| internal("store returned no rescheduled appointment"))?;

        info!("Appointment {} rescheduled into {} at {}", cancelled.id, created.id, interval);
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                actor.user_id,
                "appointment.rescheduled",
                cancelled.id,
                json!({
                    "role": actor.role,
                    "rescheduled_into": created.id,
                    "start_time": created.start_time,
                    "end_time": created.end_time,
                }),
            ),
        )
        .await;
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                actor.user_id,
                "appointment.created",
                created.id,
                json!({ "role": actor.role, "rescheduled_from_id": cancelled.id }),
            ),
        )
        .await;

        Ok(RescheduleOutcome { cancelled, created })
    }

    // ==========================================================================
    // READS
    // ==========================================================================

    pub async fn search_appointments(
        &self,
        mut query: AppointmentSearchQuery,
        timeout: Option<Duration>,
    ) -> Result<Page<Appointment>, AppointmentError> {
        if query.limit == 0 {
            query.limit = DEFAULT_PAGE_SIZE.min(self.settings.max_page_size);
        }
        if query.limit > self.settings.max_page_size {
            return Err(AppointmentError::Validation(format!(
                "limit must not exceed {}",
                self.settings.max_page_size
            )));
        }
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if to <= from {
                return Err(AppointmentError::Validation(
                    "search window end must be after its start".to_string(),
                ));
            }
        }

        let timeout = timeout
            .map(|t| t.min(self.settings.search_timeout))
            .unwrap_or(self.settings.search_timeout);
        debug!("Searching appointments {:?} with timeout {:?}", query, timeout);

        match tokio::time::timeout(timeout, self.store.search(&query)).await {
            Ok(page) => Ok(page?),
            Err(_) => {
                warn!("Appointment search timed out after {:?}", timeout);
                Err(AppointmentError::SearchTimeout(timeout.as_millis() as u64))
            }
        }
    }

    pub async fn get_appointment(
        &self,
        id: AppointmentId,
        actor: &Actor,
    ) -> Result<AppointmentDetail, AppointmentError> {
        if actor.role == Role::Unrecognized {
            return Err(AppointmentError::unauthorized(actor.role, "view"));
        }

        let appointment = self.load(id).await?;
        let consent = self
            .consent_gate
            .evaluate(ConsentQuery::from(&appointment))
            .await?;
        let allowed_actions = rbac::allowed_actions(actor.role, appointment.status);
        let rescheduled_into = self.store.find_rescheduled_from(id).await?;

        Ok(AppointmentDetail {
            appointment,
            consent,
            allowed_actions,
            rescheduled_into,
        })
    }

    /// Availability and conflicts for a candidate slot, without writing.
    pub async fn check_conflicts(
        &self,
        actor: &Actor,
        request: ConflictCheckRequest,
    ) -> Result<ConflictCheckResponse, AppointmentError> {
        if actor.role == Role::Unrecognized {
            return Err(AppointmentError::unauthorized(actor.role, "check conflicts"));
        }
        let interval = resolve_interval(
            request.start_time,
            request.end_time,
            request.estimated_duration_minutes,
        )?;

        let availability = self
            .availability
            .evaluate(request.professional_id, &interval, request.appointment_type)
            .await?;

        let query = ConflictQuery {
            interval,
            professional_id: request.professional_id,
            room_id: request.room_id,
            exclude_id: request.exclude_appointment_id,
        };
        let tx = self.store.begin(LockScope::none()).await?;
        let conflicts = self.conflict_service.find_conflicts(tx.as_ref(), &query).await?;
        drop(tx);

        let has_conflict = !conflicts.is_empty();
        Ok(ConflictCheckResponse {
            is_bookable: availability.allowed && !has_conflict,
            availability,
            conflicts,
            has_conflict,
        })
    }

    // ==========================================================================
    // HELPERS
    // ==========================================================================

    async fn load(&self, id: AppointmentId) -> Result<Appointment, AppointmentError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppointmentError::not_found("Appointment", id))
    }

    async fn verify_parties(
        &self,
        patient_id: Uuid,
        professional_id: Uuid,
        room_id: Option<Uuid>,
    ) -> Result<(), AppointmentError> {
        if self.consents.find_patient(patient_id).await?.is_none() {
            return Err(AppointmentError::not_found("Patient", patient_id));
        }
        if !self.store.professional_exists(professional_id).await? {
            return Err(AppointmentError::not_found("Professional", professional_id));
        }
        if let Some(room) = room_id {
            if !self.store.room_exists(room).await? {
                return Err(AppointmentError::not_found("Room", room));
            }
        }
        Ok(())
    }

    async fn require_available(
        &self,
        professional_id: Uuid,
        interval: &Interval,
        appointment_type: crate::models::AppointmentType,
    ) -> Result<(), AppointmentError> {
        let decision = self
            .availability
            .evaluate(professional_id, interval, appointment_type)
            .await?;
        if decision.allowed {
            Ok(())
        } else {
            warn!("Professional {} unavailable at {}: {:?}", professional_id, interval, decision.reasons);
            Err(AppointmentError::Unavailable { reasons: decision.reasons })
        }
    }

    /// A storage-level slot rejection means a concurrent writer won; report
    /// who holds the slot now.
    async fn commit_or_explain(
        &self,
        result: Result<crate::store::CommitOutcome, StoreError>,
        query: &ConflictQuery,
    ) -> Result<crate::store::CommitOutcome, AppointmentError> {
        match result {
            Ok(outcome) => Ok(outcome),
            Err(StoreError::SlotTaken(detail)) => {
                warn!("Storage rejected booking for professional {}: {}", query.professional_id, detail);
                let conflicts = match self.store.begin(LockScope::none()).await {
                    Ok(tx) => self
                        .conflict_service
                        .find_conflicts(tx.as_ref(), query)
                        .await
                        .unwrap_or_default(),
                    Err(_) => ConflictSet::default(),
                };
                Err(AppointmentError::Overlap { conflicts })
            }
            Err(other) => Err(other.into()),
        }
    }

    fn version_error(&self, err: StoreError, current: &Appointment) -> AppointmentError {
        match err {
            StoreError::VersionMismatch { actual, .. } => AppointmentError::ConcurrentModification {
                expected: Some(current.version),
                actual,
            },
            other => other.into(),
        }
    }

    async fn version_error_for(&self, source: &Appointment) -> AppointmentError {
        let actual = match self.store.find_by_id(source.id).await {
            Ok(found) => found.map(|a| a.version),
            Err(e) => {
                error!("Failed to re-read appointment {}: {}", source.id, e);
                None
            }
        };
        AppointmentError::ConcurrentModification {
            expected: Some(source.version),
            actual,
        }
    }
}

/// Accept an explicit end, a duration, or both when they agree.
pub fn resolve_interval(
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    duration_minutes: Option<i32>,
) -> Result<Interval, AppointmentError> {
    let invalid = |e: crate::services::calendar::IntervalError| AppointmentError::Validation(e.to_string());

    match (end, duration_minutes) {
        (None, None) => Err(AppointmentError::Validation(
            "either an end time or a duration is required".to_string(),
        )),
        (Some(end), None) => Interval::new(start, end).map_err(invalid),
        (None, Some(minutes)) => Interval::from_duration(start, minutes as i64).map_err(invalid),
        (Some(end), Some(minutes)) => {
            let interval = Interval::new(start, end).map_err(invalid)?;
            if end - start != chrono::Duration::minutes(minutes as i64) {
                return Err(AppointmentError::Validation(format!(
                    "duration of {} minutes does not match end time {}",
                    minutes,
                    end.to_rfc3339()
                )));
            }
            Ok(interval)
        }
    }
}

fn validate_text(field: &str, value: Option<&str>) -> Result<(), AppointmentError> {
    match value {
        Some(text) if text.chars().count() > MAX_TEXT_LENGTH => Err(AppointmentError::Validation(
            format!("{} must be at most {} characters", field, MAX_TEXT_LENGTH),
        )),
        _ => Ok(()),
    }
}

fn internal(message: &str) -> AppointmentError {
    error!("{}", message);
    AppointmentError::Internal(message.to_string())
}
