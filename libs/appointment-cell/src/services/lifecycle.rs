// libs/appointment-cell/src/services/lifecycle.rs
//
// The appointment state machine as a single table of
// (from, action) -> (to, guards, effect) rows.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::AppointmentError;
use crate::models::{Action, Actor, Appointment, AppointmentStatus};
use crate::services::rbac;

use AppointmentStatus::*;

/// Extra checks a transition needs beyond role and edge existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    ConsentGate,
}

/// What a transition writes besides the new status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    StampCheckedIn,
    StampStarted,
    StampCompleted,
    /// Sets `cancelled_at`, `cancelled_by_id`, `cancel_reason`; frees the slot.
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: AppointmentStatus,
    pub action: Action,
    pub to: AppointmentStatus,
    pub guards: &'static [Guard],
    pub effect: Effect,
}

const NO_GUARDS: &[Guard] = &[];
const START_GUARDS: &[Guard] = &[Guard::ConsentGate];

const fn edge(from: AppointmentStatus, action: Action, to: AppointmentStatus, effect: Effect) -> Transition {
    Transition { from, action, to, guards: NO_GUARDS, effect }
}

const fn guarded_start(from: AppointmentStatus) -> Transition {
    Transition {
        from,
        action: Action::Start,
        to: InProgress,
        guards: START_GUARDS,
        effect: Effect::StampStarted,
    }
}

pub const TRANSITIONS: &[Transition] = &[
    edge(Scheduled, Action::Confirm, Confirmed, Effect::None),
    edge(Scheduled, Action::CheckIn, CheckedIn, Effect::StampCheckedIn),
    guarded_start(Scheduled),
    edge(Scheduled, Action::Cancel, Cancelled, Effect::Release),
    edge(Scheduled, Action::NoShow, NoShow, Effect::Release),
    edge(Confirmed, Action::CheckIn, CheckedIn, Effect::StampCheckedIn),
    guarded_start(Confirmed),
    edge(Confirmed, Action::Cancel, Cancelled, Effect::Release),
    edge(Confirmed, Action::NoShow, NoShow, Effect::Release),
    guarded_start(CheckedIn),
    edge(CheckedIn, Action::Cancel, Cancelled, Effect::Release),
    edge(InProgress, Action::Complete, Completed, Effect::StampCompleted),
    edge(InProgress, Action::Cancel, Cancelled, Effect::Release),
];

/// States from which an appointment may be moved to a new slot.
const RESCHEDULABLE: [AppointmentStatus; 3] = [Scheduled, Confirmed, CheckedIn];

pub const RESCHEDULE_REASON: &str = "rescheduled";
const NO_SHOW_REASON: &str = "no-show";
const CANCEL_REASON: &str = "cancelled";

pub fn edges(state: AppointmentStatus) -> impl Iterator<Item = Action> {
    TRANSITIONS
        .iter()
        .filter(move |t| t.from == state)
        .map(|t| t.action)
}

pub fn find_transition(state: AppointmentStatus, action: Action) -> Option<&'static Transition> {
    TRANSITIONS
        .iter()
        .find(|t| t.from == state && t.action == action)
}

pub struct AppointmentLifecycleService;

impl AppointmentLifecycleService {
    pub fn new() -> Self {
        Self
    }

    /// Terminal state, role permission and edge existence, in that order.
    pub fn authorize(
        &self,
        appointment: &Appointment,
        actor: &Actor,
        action: Action,
    ) -> Result<&'static Transition, AppointmentError> {
        debug!(
            "Validating {} on appointment {} ({}) by {}",
            action, appointment.id, appointment.status, actor.role
        );

        if appointment.status.is_terminal() {
            warn!(
                "Rejected {} on appointment {}: status {} is terminal",
                action, appointment.id, appointment.status
            );
            return Err(AppointmentError::StateTerminal(appointment.status));
        }

        if !rbac::role_permits(actor.role, action) {
            warn!("Role {} may not {} appointment {}", actor.role, action, appointment.id);
            return Err(AppointmentError::unauthorized(actor.role, action));
        }

        find_transition(appointment.status, action).ok_or_else(|| {
            warn!(
                "Invalid transition attempted: {} from {} on appointment {}",
                action, appointment.status, appointment.id
            );
            AppointmentError::transition_not_allowed(action, appointment.status)
        })
    }

    /// Reject when the caller's last-known version is stale.
    pub fn check_version(
        &self,
        appointment: &Appointment,
        expected_version: Option<i64>,
    ) -> Result<(), AppointmentError> {
        match expected_version {
            Some(expected) if expected != appointment.version => {
                warn!(
                    "Stale version for appointment {}: expected {}, current {}",
                    appointment.id, expected, appointment.version
                );
                Err(AppointmentError::ConcurrentModification {
                    expected: Some(expected),
                    actual: Some(appointment.version),
                })
            }
            _ => Ok(()),
        }
    }

    /// The appointment as it looks after `transition`. Does not bump `version`;
    /// the store does that on commit.
    pub fn apply(
        &self,
        appointment: &Appointment,
        transition: &Transition,
        actor: &Actor,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Appointment {
        let mut next = appointment.clone();
        next.status = transition.to;
        next.updated_at = now;

        match transition.effect {
            Effect::None => append_note(&mut next, note),
            Effect::StampCheckedIn => {
                next.checked_in_at = Some(now);
                append_note(&mut next, note);
            }
            Effect::StampStarted => {
                next.started_at = Some(not_before(now, next.checked_in_at));
                append_note(&mut next, note);
            }
            Effect::StampCompleted => {
                let floor = next.started_at.or(next.checked_in_at);
                next.completed_at = Some(not_before(now, floor));
                append_note(&mut next, note);
            }
            Effect::Release => {
                let default_reason = match transition.action {
                    Action::NoShow => NO_SHOW_REASON,
                    _ => CANCEL_REASON,
                };
                next.cancelled_at = Some(now);
                next.cancelled_by_id = Some(actor.user_id);
                next.cancel_reason = Some(note.unwrap_or_else(|| default_reason.to_string()));
            }
        }

        next
    }

    /// Checks and produces the cancelled source of a reschedule.
    pub fn cancel_for_reschedule(
        &self,
        appointment: &Appointment,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Appointment, AppointmentError> {
        if appointment.status.is_terminal() {
            return Err(AppointmentError::StateTerminal(appointment.status));
        }
        if !RESCHEDULABLE.contains(&appointment.status) {
            warn!(
                "Appointment {} cannot be rescheduled from {}",
                appointment.id, appointment.status
            );
            return Err(AppointmentError::transition_not_allowed("reschedule", appointment.status));
        }

        let transition = find_transition(appointment.status, Action::Cancel)
            .ok_or_else(|| AppointmentError::transition_not_allowed("reschedule", appointment.status))?;

        Ok(self.apply(
            appointment,
            transition,
            actor,
            Some(RESCHEDULE_REASON.to_string()),
            now,
        ))
    }
}

impl Default for AppointmentLifecycleService {
    fn default() -> Self {
        Self::new()
    }
}

fn not_before(now: DateTime<Utc>, floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
    floor.map_or(now, |f| f.max(now))
}

fn append_note(appointment: &mut Appointment, note: Option<String>) {
    let Some(note) = note.filter(|n| !n.trim().is_empty()) else {
        return;
    };
    appointment.notes = Some(match appointment.notes.take() {
        Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, note),
        _ => note,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppointmentType, NewAppointment, Role};
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use uuid::Uuid;

    const ALL_STATES: [AppointmentStatus; 7] =
        [Scheduled, Confirmed, CheckedIn, InProgress, Completed, Cancelled, NoShow];

    fn appointment(status: AppointmentStatus) -> Appointment {
        let start = Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap();
        let mut a = NewAppointment {
            patient_id: Uuid::new_v4(),
            professional_id: Uuid::new_v4(),
            room_id: None,
            start_time: start,
            end_time: start + chrono::Duration::minutes(30),
            estimated_duration_minutes: 30,
            appointment_type: AppointmentType::Checkup,
            reason: None,
            notes: None,
            planned_procedures: Vec::new(),
            created_by_id: Uuid::new_v4(),
            rescheduled_from_id: None,
            created_at: start,
        }
        .into_appointment(1);
        a.status = status;
        a
    }

    fn admin() -> Actor {
        Actor::new(Uuid::new_v4(), Role::Admin)
    }

    #[test]
    fn transition_graph_matches_declared_edges() {
        let collect = |s| edges(s).collect::<Vec<_>>();
        assert_eq!(
            collect(Scheduled),
            vec![Action::Confirm, Action::CheckIn, Action::Start, Action::Cancel, Action::NoShow]
        );
        assert_eq!(
            collect(Confirmed),
            vec![Action::CheckIn, Action::Start, Action::Cancel, Action::NoShow]
        );
        assert_eq!(collect(CheckedIn), vec![Action::Start, Action::Cancel]);
        assert_eq!(collect(InProgress), vec![Action::Complete, Action::Cancel]);
        for terminal in [Completed, Cancelled, NoShow] {
            assert!(collect(terminal).is_empty());
        }
    }

    #[test]
    fn only_start_carries_the_consent_guard() {
        for t in TRANSITIONS {
            assert_eq!(t.guards.contains(&Guard::ConsentGate), t.action == Action::Start);
        }
    }

    #[test]
    fn terminal_states_reject_every_action_for_every_role() {
        let service = AppointmentLifecycleService::new();
        for status in [Completed, Cancelled, NoShow] {
            for role in [Role::Admin, Role::Professional, Role::Assistant, Role::Receptionist, Role::Unrecognized] {
                for action in Action::ALL {
                    let actor = Actor::new(Uuid::new_v4(), role);
                    assert_matches!(
                        service.authorize(&appointment(status), &actor, action),
                        Err(AppointmentError::StateTerminal(s)) if s == status
                    );
                }
            }
        }
    }

    #[test]
    fn role_is_checked_before_edge_existence() {
        let service = AppointmentLifecycleService::new();
        let receptionist = Actor::new(Uuid::new_v4(), Role::Receptionist);

        assert_matches!(
            service.authorize(&appointment(Scheduled), &receptionist, Action::Complete),
            Err(AppointmentError::Unauthorized { .. })
        );
        assert_matches!(
            service.authorize(&appointment(Scheduled), &admin(), Action::Complete),
            Err(AppointmentError::TransitionNotAllowed { .. })
        );
        assert_matches!(
            service.authorize(&appointment(CheckedIn), &receptionist, Action::NoShow),
            Err(AppointmentError::TransitionNotAllowed { .. })
        );
    }

    #[test]
    fn every_non_terminal_state_can_be_cancelled() {
        let service = AppointmentLifecycleService::new();
        for status in ALL_STATES.into_iter().filter(|s| !s.is_terminal()) {
            let transition = service
                .authorize(&appointment(status), &admin(), Action::Cancel)
                .unwrap();
            assert_eq!(transition.to, Cancelled);
        }
    }

    #[test]
    fn stale_version_is_rejected() {
        let service = AppointmentLifecycleService::new();
        let a = appointment(Scheduled);
        assert!(service.check_version(&a, None).is_ok());
        assert!(service.check_version(&a, Some(1)).is_ok());
        assert_matches!(
            service.check_version(&a, Some(0)),
            Err(AppointmentError::ConcurrentModification { expected: Some(0), actual: Some(1) })
        );
    }

    #[test]
    fn side_effects_stamp_monotonic_timestamps() {
        let service = AppointmentLifecycleService::new();
        let actor = admin();
        let t0 = Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap();

        let scheduled = appointment(Scheduled);
        let check_in = find_transition(Scheduled, Action::CheckIn).unwrap();
        let checked_in = service.apply(&scheduled, check_in, &actor, None, t0);
        assert_eq!(checked_in.checked_in_at, Some(t0));

        // A clock running behind never produces started_at < checked_in_at.
        let start = find_transition(CheckedIn, Action::Start).unwrap();
        let started = service.apply(&checked_in, start, &actor, None, t0 - chrono::Duration::minutes(5));
        assert_eq!(started.started_at, Some(t0));
        assert_eq!(started.status, InProgress);

        let complete = find_transition(InProgress, Action::Complete).unwrap();
        let done = service.apply(&started, complete, &actor, Some("all good".into()), t0 + chrono::Duration::minutes(30));
        assert_eq!(done.completed_at, Some(t0 + chrono::Duration::minutes(30)));
        assert_eq!(done.notes.as_deref(), Some("all good"));
        assert_eq!(done.cancel_reason, None);
    }

    #[test]
    fn release_records_who_and_why() {
        let service = AppointmentLifecycleService::new();
        let actor = Actor::new(Uuid::new_v4(), Role::Receptionist);
        let now = Utc::now();

        let no_show = find_transition(Confirmed, Action::NoShow).unwrap();
        let released = service.apply(&appointment(Confirmed), no_show, &actor, None, now);
        assert_eq!(released.status, NoShow);
        assert_eq!(released.cancel_reason.as_deref(), Some("no-show"));
        assert_eq!(released.cancelled_by_id, Some(actor.user_id));
        assert_eq!(released.cancelled_at, Some(now));
        assert!(!released.holds_slot());

        let cancel = find_transition(Scheduled, Action::Cancel).unwrap();
        let cancelled = service.apply(&appointment(Scheduled), cancel, &actor, Some("patient called".into()), now);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("patient called"));
    }

    #[test]
    fn reschedule_source_rules() {
        let service = AppointmentLifecycleService::new();
        let actor = admin();
        let now = Utc::now();

        let moved = service.cancel_for_reschedule(&appointment(Confirmed), &actor, now).unwrap();
        assert_eq!(moved.status, Cancelled);
        assert_eq!(moved.cancel_reason.as_deref(), Some(RESCHEDULE_REASON));

        assert_matches!(
            service.cancel_for_reschedule(&appointment(InProgress), &actor, now),
            Err(AppointmentError::TransitionNotAllowed { .. })
        );
        assert_matches!(
            service.cancel_for_reschedule(&appointment(Cancelled), &actor, now),
            Err(AppointmentError::StateTerminal(Cancelled))
        );
    }
}
