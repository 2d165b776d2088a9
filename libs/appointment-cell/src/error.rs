// libs/appointment-cell/src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::error;

use crate::models::{AppointmentStatus, AvailabilityReason, ConflictSet, ConsentDecision, Role};
use crate::store::StoreError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AppointmentError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Professional not available: {}", describe_reasons(.reasons))]
    Unavailable { reasons: Vec<AvailabilityReason> },

    #[error("Appointment overlaps {} existing booking(s)", .conflicts.len())]
    Overlap { conflicts: ConflictSet },

    #[error("Action {action} is not allowed from status {status}")]
    TransitionNotAllowed { action: String, status: AppointmentStatus },

    #[error("Appointment is in terminal status {0}")]
    StateTerminal(AppointmentStatus),

    #[error("Consultation cannot start: {}", consent_message(.decision))]
    ConsentRequired { decision: ConsentDecision },

    #[error("Appointment was modified concurrently (expected version {expected:?}, found {actual:?})")]
    ConcurrentModification { expected: Option<i64>, actual: Option<i64> },

    #[error("Role {role} is not permitted to {action}")]
    Unauthorized { role: Role, action: String },

    #[error("Search timed out after {0} ms")]
    SearchTimeout(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe_reasons(reasons: &[AvailabilityReason]) -> String {
    reasons.iter().map(|r| r.code()).collect::<Vec<_>>().join(", ")
}

fn consent_message(decision: &ConsentDecision) -> &str {
    decision.blocking_message.as_deref().unwrap_or("consent required")
}

impl AppointmentError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        AppointmentError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn unauthorized(role: Role, action: impl ToString) -> Self {
        AppointmentError::Unauthorized {
            role,
            action: action.to_string(),
        }
    }

    pub fn transition_not_allowed(action: impl ToString, status: AppointmentStatus) -> Self {
        AppointmentError::TransitionNotAllowed {
            action: action.to_string(),
            status,
        }
    }

    /// Stable code string for UI layers.
    pub fn code(&self) -> &'static str {
        match self {
            AppointmentError::Validation(_) => "VALIDATION_ERROR",
            AppointmentError::NotFound { .. } => "NOT_FOUND",
            AppointmentError::Unavailable { reasons } => reasons
                .first()
                .map(AvailabilityReason::code)
                .unwrap_or("OUTSIDE_WORKING_HOURS"),
            AppointmentError::Overlap { .. } => "OVERLAP",
            AppointmentError::TransitionNotAllowed { .. } => "TRANSITION_NOT_ALLOWED",
            AppointmentError::StateTerminal(_) => "STATE_TERMINAL",
            AppointmentError::ConsentRequired { decision } => {
                if decision.minor_unsatisfied() || !decision.surgery_unsatisfied() {
                    "CONSENT_REQUIRED_FOR_MINOR"
                } else {
                    "CONSENT_REQUIRED_FOR_SURGERY"
                }
            }
            AppointmentError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            AppointmentError::Unauthorized { .. } => "UNAUTHORIZED",
            AppointmentError::SearchTimeout(_) => "SEARCH_TIMEOUT",
            AppointmentError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppointmentError::Validation(_) => StatusCode::BAD_REQUEST,
            AppointmentError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppointmentError::Unavailable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppointmentError::Overlap { .. }
            | AppointmentError::TransitionNotAllowed { .. }
            | AppointmentError::StateTerminal(_)
            | AppointmentError::ConcurrentModification { .. } => StatusCode::CONFLICT,
            AppointmentError::ConsentRequired { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppointmentError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            AppointmentError::SearchTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppointmentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Structured context for the caller: conflicts, reasons or the consent decision.
    pub fn details(&self) -> Value {
        match self {
            AppointmentError::Unavailable { reasons } => json!({ "reasons": reasons }),
            AppointmentError::Overlap { conflicts } => json!({ "conflicts": conflicts }),
            AppointmentError::TransitionNotAllowed { action, status } => {
                json!({ "action": action, "status": status })
            }
            AppointmentError::StateTerminal(status) => json!({ "status": status }),
            AppointmentError::ConsentRequired { decision } => json!({ "consent": decision }),
            AppointmentError::ConcurrentModification { expected, actual } => {
                json!({ "expected_version": expected, "current_version": actual, "retryable": true })
            }
            AppointmentError::Unauthorized { role, action } => {
                json!({ "role": role, "action": action })
            }
            AppointmentError::NotFound { entity, id } => json!({ "entity": entity, "id": id }),
            AppointmentError::SearchTimeout(ms) => json!({ "timeout_ms": ms }),
            AppointmentError::Validation(_) | AppointmentError::Internal(_) => Value::Null,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AppointmentError::ConcurrentModification { .. })
    }
}

impl From<StoreError> for AppointmentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SlotTaken(_) => AppointmentError::Overlap {
                conflicts: ConflictSet::default(),
            },
            StoreError::VersionMismatch { expected, actual, .. } => {
                AppointmentError::ConcurrentModification {
                    expected: Some(expected),
                    actual,
                }
            }
            StoreError::NotFound(id) => AppointmentError::not_found("Appointment", id),
            StoreError::Backend(message) => {
                error!("Scheduling store failure: {}", message);
                AppointmentError::Internal(message)
            }
        }
    }
}

impl IntoResponse for AppointmentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            AppointmentError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let body = Json(json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": message,
                "details": self.details(),
            }
        }));

        (status, body).into_response()
    }
}
