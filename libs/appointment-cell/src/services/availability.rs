// libs/appointment-cell/src/services/availability.rs
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, NaiveTime};
use tracing::debug;
use uuid::Uuid;

use crate::models::{AppointmentType, AvailabilityDecision, AvailabilityReason, Specialty, WorkingWindow};
use crate::services::calendar::{full_day, since_midnight, ClinicCalendar, Interval, LocalDaySpan};
use crate::store::{AppointmentStore, StoreError};

pub struct AvailabilityEvaluator {
    store: Arc<dyn AppointmentStore>,
    calendar: ClinicCalendar,
}

impl AvailabilityEvaluator {
    pub fn new(store: Arc<dyn AppointmentStore>, calendar: ClinicCalendar) -> Self {
        Self { store, calendar }
    }

    /// Check working hours and specialty fit for one professional and interval.
    pub async fn evaluate(
        &self,
        professional_id: Uuid,
        interval: &Interval,
        appointment_type: AppointmentType,
    ) -> Result<AvailabilityDecision, StoreError> {
        let span = self.calendar.day_span(interval);
        let windows = self
            .store
            .find_working_hours(professional_id, span.weekday)
            .await?;

        let required = appointment_type.required_specialties();
        let specialties = match required {
            Some(_) => self.store.find_specialties(professional_id).await?,
            None => HashSet::new(),
        };

        let decision = decide(&span, &windows, &specialties, required);
        debug!(
            "Availability for professional {} at {} ({:?}): allowed={} reasons={:?}",
            professional_id, interval, span.weekday, decision.allowed, decision.reasons
        );
        Ok(decision)
    }
}

/// Pure availability decision. The time check and the specialty check are
/// both evaluated; the time reason, if any, comes first.
pub fn decide(
    span: &LocalDaySpan,
    windows: &[WorkingWindow],
    specialties: &HashSet<Specialty>,
    required: Option<&[Specialty]>,
) -> AvailabilityDecision {
    let mut reasons = Vec::new();

    if let Some(reason) = check_working_time(span, windows) {
        reasons.push(reason);
    }
    if let Some(reason) = check_specialty(specialties, required) {
        reasons.push(reason);
    }

    AvailabilityDecision::from_reasons(reasons)
}

fn check_working_time(span: &LocalDaySpan, windows: &[WorkingWindow]) -> Option<AvailabilityReason> {
    if windows.is_empty() {
        return Some(AvailabilityReason::NoWorkingDay);
    }
    if !span.within_single_day {
        return Some(AvailabilityReason::OutsideWorkingHours);
    }

    let contained = windows.iter().any(|window| {
        since_midnight(window.start) <= span.start && span.end <= window_close(window)
    });

    if contained {
        None
    } else {
        Some(AvailabilityReason::OutsideWorkingHours)
    }
}

fn check_specialty(
    specialties: &HashSet<Specialty>,
    required: Option<&[Specialty]>,
) -> Option<AvailabilityReason> {
    let required = required?;
    if specialties.is_empty() {
        return Some(AvailabilityReason::ProfessionalHasNoSpecialties);
    }
    if required.iter().any(|s| specialties.contains(s)) {
        None
    } else {
        Some(AvailabilityReason::IncompatibleSpecialty)
    }
}

/// A window closing at exactly 00:00:00 runs to the end of the day.
fn window_close(window: &WorkingWindow) -> Duration {
    if window.end == NaiveTime::MIN {
        full_day()
    } else {
        since_midnight(window.end)
    }
}
