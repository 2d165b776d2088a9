// libs/appointment-cell/src/services/rbac.rs
//
// Role permissions, declared once. The transition guard and the detail view
// both read from here.

use crate::models::{Action, AppointmentStatus, Role};
use crate::services::lifecycle::edges;

const CLINICAL_AND_FRONT_OFFICE: &[Action] = &[
    Action::Confirm,
    Action::CheckIn,
    Action::Start,
    Action::Complete,
    Action::Cancel,
    Action::NoShow,
];

const CLINICAL_SUPPORT: &[Action] = &[
    Action::Confirm,
    Action::CheckIn,
    Action::Start,
    Action::Complete,
];

const FRONT_OFFICE: &[Action] = &[
    Action::Confirm,
    Action::CheckIn,
    Action::Cancel,
    Action::NoShow,
];

pub fn permitted_actions(role: Role) -> &'static [Action] {
    match role {
        Role::Admin | Role::Professional => CLINICAL_AND_FRONT_OFFICE,
        Role::Assistant => CLINICAL_SUPPORT,
        Role::Receptionist => FRONT_OFFICE,
        Role::Unrecognized => &[],
    }
}

pub fn role_permits(role: Role, action: Action) -> bool {
    permitted_actions(role).contains(&action)
}

/// Creating and rescheduling appointments.
pub fn can_book(role: Role) -> bool {
    matches!(role, Role::Admin | Role::Professional | Role::Receptionist)
}

/// What `role` may do to an appointment currently in `state`.
pub fn allowed_actions(role: Role, state: AppointmentStatus) -> Vec<Action> {
    edges(state)
        .filter(|action| role_permits(role, *action))
        .collect()
}
