// libs/appointment-cell/src/services/consent.rs
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{
    Appointment, AppointmentId, ConsentDecision, ConsentKind, ConsentRecord, MinorConsentCheck,
    PlannedProcedure, SurgicalConsentCheck, surgical_procedures,
};
use crate::services::calendar::ClinicCalendar;
use crate::store::{ConsentDirectory, StoreError};

/// The facts the gate needs about one encounter.
#[derive(Debug, Clone, Copy)]
pub struct ConsentQuery<'a> {
    pub patient_id: Uuid,
    pub appointment_id: AppointmentId,
    pub start_time: DateTime<Utc>,
    pub planned_procedures: &'a [PlannedProcedure],
}

impl<'a> From<&'a Appointment> for ConsentQuery<'a> {
    fn from(appointment: &'a Appointment) -> Self {
        Self {
            patient_id: appointment.patient_id,
            appointment_id: appointment.id,
            start_time: appointment.start_time,
            planned_procedures: &appointment.planned_procedures,
        }
    }
}

pub struct ConsentGate {
    directory: Arc<dyn ConsentDirectory>,
    calendar: ClinicCalendar,
    age_of_majority: u32,
}

impl ConsentGate {
    pub fn new(directory: Arc<dyn ConsentDirectory>, calendar: ClinicCalendar, age_of_majority: u32) -> Self {
        Self {
            directory,
            calendar,
            age_of_majority,
        }
    }

    /// Evaluate both consent requirements for one appointment. Side-effect free.
    pub async fn evaluate(&self, query: ConsentQuery<'_>) -> Result<ConsentDecision, StoreError> {
        let birth_date = self
            .directory
            .find_patient(query.patient_id)
            .await?
            .and_then(|patient| patient.birth_date);

        let is_minor = birth_date.map(|birth| {
            is_minor_at(
                birth,
                query.start_time,
                &self.calendar,
                self.age_of_majority,
            )
        });

        // Unknown birth date is treated as a minor.
        let minor_required = is_minor.unwrap_or(true);
        let minor_record = if minor_required {
            self.directory
                .find_active_consent(query.patient_id, query.appointment_id, ConsentKind::MinorAttention)
                .await?
        } else {
            None
        };

        let surgery_required = surgical_procedures(query.planned_procedures).next().is_some();
        let surgical_record = if surgery_required {
            self.directory
                .find_active_consent(query.patient_id, query.appointment_id, ConsentKind::Surgical)
                .await?
        } else {
            None
        };

        let decision = compose(
            query,
            is_minor,
            minor_record.as_ref(),
            surgery_required,
            surgical_record.as_ref(),
        );

        if decision.blocks_start {
            warn!(
                "Consent gate blocks appointment {} for patient {}: {}",
                query.appointment_id,
                query.patient_id,
                decision.blocking_message.as_deref().unwrap_or_default()
            );
        } else {
            debug!("Consent gate satisfied for appointment {}", query.appointment_id);
        }

        Ok(decision)
    }
}

/// Whole years between `birth_date` and the local date of `at`, compared to `age_of_majority`.
pub fn is_minor_at(
    birth_date: NaiveDate,
    at: DateTime<Utc>,
    calendar: &ClinicCalendar,
    age_of_majority: u32,
) -> bool {
    let on = calendar.local_date(at);
    age_on(birth_date, on) < age_of_majority as i32
}

fn age_on(birth_date: NaiveDate, on: NaiveDate) -> i32 {
    let mut age = on.year() - birth_date.year();
    if (on.month(), on.day()) < (birth_date.month(), birth_date.day()) {
        age -= 1;
    }
    age
}

fn record_applies(record: Option<&ConsentRecord>, query: &ConsentQuery<'_>) -> bool {
    record.is_some_and(|r| {
        r.patient_id == query.patient_id
            && r.appointment_id == Some(query.appointment_id)
            && r.covers(query.start_time)
    })
}

fn compose(
    query: ConsentQuery<'_>,
    is_minor: Option<bool>,
    minor_record: Option<&ConsentRecord>,
    surgery_required: bool,
    surgical_record: Option<&ConsentRecord>,
) -> ConsentDecision {
    let minor_required = is_minor.unwrap_or(true);
    let minor_satisfied = !minor_required || record_applies(minor_record, &query);
    let surgery_satisfied = !surgery_required || record_applies(surgical_record, &query);

    let mut reasons = Vec::new();
    if !minor_satisfied {
        reasons.push(match is_minor {
            None => "patient birth date is unknown and no minor-attention consent covers this appointment"
                .to_string(),
            Some(_) => "patient is a minor and no valid minor-attention consent is signed for this appointment"
                .to_string(),
        });
    }
    if !surgery_satisfied {
        let codes: Vec<&str> = surgical_procedures(query.planned_procedures)
            .map(|p| p.code.as_str())
            .collect();
        reasons.push(format!(
            "planned procedure(s) {} require a signed surgical consent for this appointment",
            codes.join(", ")
        ));
    }

    let blocks_start = !reasons.is_empty();
    ConsentDecision {
        minor: MinorConsentCheck {
            is_minor,
            required: minor_required,
            satisfied: minor_satisfied,
        },
        surgery: SurgicalConsentCheck {
            required: surgery_required,
            satisfied: surgery_satisfied,
        },
        blocks_start,
        blocking_message: if blocks_start {
            Some(reasons.join("; "))
        } else {
            None
        },
    }
}
