// libs/appointment-cell/src/handlers.rs
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use shared_models::auth::User;

use crate::error::AppointmentError;
use crate::extract::{AppointmentPath, JsonBody, QueryParams};
use crate::models::{
    Actor, AppointmentSearchQuery, AppointmentStatus, AppointmentType,
    ConflictCheckRequest, CreateAppointmentRequest, RescheduleRequest, Role, TransitionRequest,
};
use crate::services::booking::SchedulingService;

#[derive(Clone)]
pub struct AppointmentState {
    pub scheduling: Arc<SchedulingService>,
}

// ==============================================================================
// QUERY PARAMETER STRUCTS
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub patient_id: Option<Uuid>,
    pub professional_id: Option<Uuid>,
    pub room_id: Option<Uuid>,
    /// Comma-separated, e.g. `scheduled,confirmed`.
    pub status: Option<String>,
    pub appointment_type: Option<AppointmentType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl SearchParams {
    fn into_query(self) -> Result<(AppointmentSearchQuery, Option<Duration>), AppointmentError> {
        let statuses = match self.status.as_deref() {
            Some(raw) => raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.parse::<AppointmentStatus>().map_err(AppointmentError::Validation))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let query = AppointmentSearchQuery {
            patient_id: self.patient_id,
            professional_id: self.professional_id,
            room_id: self.room_id,
            statuses,
            appointment_type: self.appointment_type,
            from: self.from,
            to: self.to,
            limit: self.limit.unwrap_or(0),
            offset: self.offset.unwrap_or(0),
        };
        Ok((query, self.timeout_ms.map(Duration::from_millis)))
    }
}

fn actor_from(user: &User) -> Result<Actor, AppointmentError> {
    let role = Role::from_claim(user.role.as_deref());
    let user_id = Uuid::parse_str(&user.id)
        .map_err(|_| AppointmentError::unauthorized(role, "act without a valid user id"))?;
    Ok(Actor::new(user_id, role))
}

// ==============================================================================
// HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn create_appointment(
    State(state): State<AppointmentState>,
    Extension(user): Extension<User>,
    JsonBody(request): JsonBody<CreateAppointmentRequest>,
) -> Result<(StatusCode, Json<Value>), AppointmentError> {
    let actor = actor_from(&user)?;
    let appointment = state.scheduling.create_appointment(&actor, request).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "appointment": appointment,
            "message": "Appointment created successfully"
        })),
    ))
}

#[axum::debug_handler]
pub async fn get_appointment(
    State(state): State<AppointmentState>,
    AppointmentPath(appointment_id): AppointmentPath,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppointmentError> {
    let actor = actor_from(&user)?;
    let detail = state.scheduling.get_appointment(appointment_id, &actor).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": detail.appointment,
        "consent": detail.consent,
        "allowed_actions": detail.allowed_actions,
        "rescheduled_into": detail.rescheduled_into,
    })))
}

#[axum::debug_handler]
pub async fn transition_appointment(
    State(state): State<AppointmentState>,
    AppointmentPath(appointment_id): AppointmentPath,
    Extension(user): Extension<User>,
    JsonBody(request): JsonBody<TransitionRequest>,
) -> Result<Json<Value>, AppointmentError> {
    let actor = actor_from(&user)?;
    let action = request.action;
    let appointment = state
        .scheduling
        .transition_appointment(appointment_id, &actor, request)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": format!("Action {} applied", action)
    })))
}

#[axum::debug_handler]
pub async fn reschedule_appointment(
    State(state): State<AppointmentState>,
    AppointmentPath(appointment_id): AppointmentPath,
    Extension(user): Extension<User>,
    JsonBody(request): JsonBody<RescheduleRequest>,
) -> Result<Json<Value>, AppointmentError> {
    let actor = actor_from(&user)?;
    let outcome = state
        .scheduling
        .reschedule_appointment(appointment_id, &actor, request)
        .await?;

    Ok(Json(json!({
        "success": true,
        "cancelled": outcome.cancelled,
        "created": outcome.created,
        "message": "Appointment rescheduled successfully"
    })))
}

#[axum::debug_handler]
pub async fn search_appointments(
    State(state): State<AppointmentState>,
    QueryParams(params): QueryParams<SearchParams>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppointmentError> {
    let actor = actor_from(&user)?;
    if actor.role == Role::Unrecognized {
        return Err(AppointmentError::unauthorized(actor.role, "search"));
    }

    let (query, timeout) = params.into_query()?;
    let page = state.scheduling.search_appointments(query, timeout).await?;

    Ok(Json(json!({
        "success": true,
        "appointments": page.items,
        "total": page.total,
        "limit": page.limit,
        "offset": page.offset,
    })))
}

#[axum::debug_handler]
pub async fn check_conflicts(
    State(state): State<AppointmentState>,
    Extension(user): Extension<User>,
    JsonBody(request): JsonBody<ConflictCheckRequest>,
) -> Result<Json<Value>, AppointmentError> {
    let actor = actor_from(&user)?;
    let response = state.scheduling.check_conflicts(&actor, request).await?;

    Ok(Json(json!({
        "success": true,
        "availability": response.availability,
        "conflicts": response.conflicts,
        "has_conflict": response.has_conflict,
        "is_bookable": response.is_bookable,
    })))
}
