// libs/appointment-cell/src/models.rs
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::calendar::{Interval, IntervalError};

pub type AppointmentId = i64;

// ==============================================================================
// CORE APPOINTMENT MODELS
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub patient_id: Uuid,
    pub professional_id: Uuid,
    pub room_id: Option<Uuid>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub estimated_duration_minutes: i32,
    pub appointment_type: AppointmentType,
    pub status: AppointmentStatus,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub cancel_reason: Option<String>,
    #[serde(default)]
    pub planned_procedures: Vec<PlannedProcedure>,
    pub created_by_id: Uuid,
    pub cancelled_by_id: Option<Uuid>,
    pub rescheduled_from_id: Option<AppointmentId>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    pub fn interval(&self) -> Result<Interval, IntervalError> {
        Interval::new(self.start_time, self.end_time)
    }

    pub fn holds_slot(&self) -> bool {
        self.status.holds_slot()
    }
}

/// A new appointment before the store has assigned its id and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAppointment {
    pub patient_id: Uuid,
    pub professional_id: Uuid,
    pub room_id: Option<Uuid>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub estimated_duration_minutes: i32,
    pub appointment_type: AppointmentType,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub planned_procedures: Vec<PlannedProcedure>,
    pub created_by_id: Uuid,
    pub rescheduled_from_id: Option<AppointmentId>,
    pub created_at: DateTime<Utc>,
}

impl NewAppointment {
    pub fn into_appointment(self, id: AppointmentId) -> Appointment {
        Appointment {
            id,
            patient_id: self.patient_id,
            professional_id: self.professional_id,
            room_id: self.room_id,
            start_time: self.start_time,
            end_time: self.end_time,
            estimated_duration_minutes: self.estimated_duration_minutes,
            appointment_type: self.appointment_type,
            status: AppointmentStatus::Scheduled,
            reason: self.reason,
            notes: self.notes,
            cancel_reason: None,
            planned_procedures: self.planned_procedures,
            created_by_id: self.created_by_id,
            cancelled_by_id: None,
            rescheduled_from_id: self.rescheduled_from_id,
            checked_in_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            version: 1,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedProcedure {
    pub code: String,
    #[serde(default)]
    pub requires_surgical_consent: bool,
}

/// The planned procedures that need a signed surgical consent.
pub fn surgical_procedures(procedures: &[PlannedProcedure]) -> impl Iterator<Item = &PlannedProcedure> {
    procedures.iter().filter(|p| p.requires_surgical_consent)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    CheckedIn,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub const SLOT_HOLDING: [AppointmentStatus; 4] = [
        AppointmentStatus::Scheduled,
        AppointmentStatus::Confirmed,
        AppointmentStatus::CheckedIn,
        AppointmentStatus::InProgress,
    ];

    pub fn holds_slot(&self) -> bool {
        Self::SLOT_HOLDING.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::NoShow
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppointmentStatus::Scheduled => write!(f, "scheduled"),
            AppointmentStatus::Confirmed => write!(f, "confirmed"),
            AppointmentStatus::CheckedIn => write!(f, "checked_in"),
            AppointmentStatus::InProgress => write!(f, "in_progress"),
            AppointmentStatus::Completed => write!(f, "completed"),
            AppointmentStatus::Cancelled => write!(f, "cancelled"),
            AppointmentStatus::NoShow => write!(f, "no_show"),
        }
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Ok(AppointmentStatus::Scheduled),
            "confirmed" => Ok(AppointmentStatus::Confirmed),
            "checked_in" => Ok(AppointmentStatus::CheckedIn),
            "in_progress" => Ok(AppointmentStatus::InProgress),
            "completed" => Ok(AppointmentStatus::Completed),
            "cancelled" => Ok(AppointmentStatus::Cancelled),
            "no_show" => Ok(AppointmentStatus::NoShow),
            other => Err(format!("unknown appointment status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentType {
    #[serde(alias = "consult", alias = "general")]
    GeneralConsult,
    #[serde(alias = "hygiene")]
    Cleaning,
    #[serde(alias = "endodontics")]
    RootCanal,
    Extraction,
    #[serde(alias = "urgent")]
    Emergency,
    Orthodontics,
    #[serde(alias = "check_up")]
    Checkup,
    Other,
}

impl AppointmentType {
    /// Specialties any one of which qualifies a professional for this type.
    /// `None` means the type carries no specialty requirement.
    pub fn required_specialties(&self) -> Option<&'static [Specialty]> {
        match self {
            AppointmentType::Cleaning => Some(&[
                Specialty::Hygiene,
                Specialty::Periodontics,
                Specialty::GeneralDentistry,
            ]),
            AppointmentType::RootCanal => Some(&[Specialty::Endodontics]),
            AppointmentType::Extraction => {
                Some(&[Specialty::OralSurgery, Specialty::GeneralDentistry])
            }
            AppointmentType::Orthodontics => Some(&[Specialty::Orthodontics]),
            AppointmentType::GeneralConsult
            | AppointmentType::Emergency
            | AppointmentType::Checkup
            | AppointmentType::Other => None,
        }
    }
}

impl fmt::Display for AppointmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppointmentType::GeneralConsult => write!(f, "general_consult"),
            AppointmentType::Cleaning => write!(f, "cleaning"),
            AppointmentType::RootCanal => write!(f, "root_canal"),
            AppointmentType::Extraction => write!(f, "extraction"),
            AppointmentType::Emergency => write!(f, "emergency"),
            AppointmentType::Orthodontics => write!(f, "orthodontics"),
            AppointmentType::Checkup => write!(f, "checkup"),
            AppointmentType::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Specialty {
    GeneralDentistry,
    Endodontics,
    Orthodontics,
    OralSurgery,
    Periodontics,
    Pediatric,
    Prosthodontics,
    Hygiene,
}

// ==============================================================================
// LIFECYCLE ACTIONS AND ACTORS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Confirm,
    #[serde(alias = "check-in")]
    CheckIn,
    Start,
    Complete,
    Cancel,
    #[serde(alias = "no-show")]
    NoShow,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Confirm,
        Action::CheckIn,
        Action::Start,
        Action::Complete,
        Action::Cancel,
        Action::NoShow,
    ];
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Confirm => write!(f, "confirm"),
            Action::CheckIn => write!(f, "check_in"),
            Action::Start => write!(f, "start"),
            Action::Complete => write!(f, "complete"),
            Action::Cancel => write!(f, "cancel"),
            Action::NoShow => write!(f, "no_show"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Professional,
    Assistant,
    Receptionist,
    /// Any role string the scheduler does not recognise; permits nothing.
    Unrecognized,
}

impl Role {
    pub fn from_claim(role: Option<&str>) -> Self {
        match role.map(|r| r.trim().to_ascii_lowercase()).as_deref() {
            Some("admin") | Some("administrator") => Role::Admin,
            Some("professional") | Some("doctor") | Some("dentist") => Role::Professional,
            Some("assistant") | Some("nurse") => Role::Assistant,
            Some("receptionist") | Some("front_desk") => Role::Receptionist,
            _ => Role::Unrecognized,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Professional => write!(f, "professional"),
            Role::Assistant => write!(f, "assistant"),
            Role::Receptionist => write!(f, "receptionist"),
            Role::Unrecognized => write!(f, "unrecognized"),
        }
    }
}

/// Who is performing a scheduling operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }
}

// ==============================================================================
// CALENDAR INPUTS (read-only, owned elsewhere)
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgendaBlock {
    pub id: Uuid,
    pub professional_id: Option<Uuid>,
    pub room_id: Option<Uuid>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub reason: Option<String>,
}

impl AgendaBlock {
    pub fn interval(&self) -> Result<Interval, IntervalError> {
        Interval::new(self.start_time, self.end_time)
    }
}

/// One open stretch of a professional's working day, `[start, end)` in clinic local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WorkingWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientFacts {
    pub id: Uuid,
    pub birth_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConsentKind {
    MinorAttention,
    Surgical,
}

impl fmt::Display for ConsentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsentKind::MinorAttention => write!(f, "minor_attention"),
            ConsentKind::Surgical => write!(f, "surgical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub appointment_id: Option<AppointmentId>,
    pub kind: ConsentKind,
    pub signed_at: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ConsentRecord {
    /// Not revoked and, when bounded, still valid at `at`.
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.valid_until.map_or(true, |until| until >= at)
    }
}

// ==============================================================================
// EVALUATION RESULTS
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvailabilityReason {
    NoWorkingDay,
    OutsideWorkingHours,
    IncompatibleSpecialty,
    ProfessionalHasNoSpecialties,
}

impl AvailabilityReason {
    pub fn code(&self) -> &'static str {
        match self {
            AvailabilityReason::NoWorkingDay => "NO_WORKING_DAY",
            AvailabilityReason::OutsideWorkingHours => "OUTSIDE_WORKING_HOURS",
            AvailabilityReason::IncompatibleSpecialty => "INCOMPATIBLE_SPECIALTY",
            AvailabilityReason::ProfessionalHasNoSpecialties => "PROFESSIONAL_HAS_NO_SPECIALTIES",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityDecision {
    pub allowed: bool,
    /// The primary reason; the time check wins over the specialty check.
    pub reason: Option<AvailabilityReason>,
    /// Every failed check, time first.
    pub reasons: Vec<AvailabilityReason>,
}

impl AvailabilityDecision {
    pub fn from_reasons(reasons: Vec<AvailabilityReason>) -> Self {
        Self {
            allowed: reasons.is_empty(),
            reason: reasons.first().copied(),
            reasons,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictingAppointment {
    pub id: AppointmentId,
    pub patient_id: Uuid,
    pub professional_id: Uuid,
    pub room_id: Option<Uuid>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: AppointmentStatus,
}

impl From<&Appointment> for ConflictingAppointment {
    fn from(a: &Appointment) -> Self {
        Self {
            id: a.id,
            patient_id: a.patient_id,
            professional_id: a.professional_id,
            room_id: a.room_id,
            start_time: a.start_time,
            end_time: a.end_time,
            status: a.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conflict {
    Appointment(ConflictingAppointment),
    Block(AgendaBlock),
}

/// Overlapping slot holders, split by the resource that collides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSet {
    pub professional: Vec<Conflict>,
    pub room: Vec<Conflict>,
}

impl ConflictSet {
    pub fn is_empty(&self) -> bool {
        self.professional.is_empty() && self.room.is_empty()
    }

    pub fn len(&self) -> usize {
        self.professional.len() + self.room.len()
    }

    /// Distinct ids of colliding appointments across both partitions.
    pub fn appointment_ids(&self) -> Vec<AppointmentId> {
        let mut seen = HashSet::new();
        self.professional
            .iter()
            .chain(self.room.iter())
            .filter_map(|c| match c {
                Conflict::Appointment(a) => Some(a.id),
                Conflict::Block(_) => None,
            })
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinorConsentCheck {
    /// `None` when the birth date is unknown.
    pub is_minor: Option<bool>,
    pub required: bool,
    pub satisfied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurgicalConsentCheck {
    pub required: bool,
    pub satisfied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentDecision {
    pub minor: MinorConsentCheck,
    pub surgery: SurgicalConsentCheck,
    pub blocks_start: bool,
    pub blocking_message: Option<String>,
}

impl ConsentDecision {
    pub fn minor_unsatisfied(&self) -> bool {
        self.minor.required && !self.minor.satisfied
    }

    pub fn surgery_unsatisfied(&self) -> bool {
        self.surgery.required && !self.surgery.satisfied
    }
}

// ==============================================================================
// REQUEST MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAppointmentRequest {
    pub patient_id: Uuid,
    pub professional_id: Uuid,
    pub room_id: Option<Uuid>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub estimated_duration_minutes: Option<i32>,
    pub appointment_type: AppointmentType,
    pub reason: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub planned_procedures: Vec<PlannedProcedure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub action: Action,
    pub note: Option<String>,
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleRequest {
    pub new_start_time: DateTime<Utc>,
    pub new_end_time: Option<DateTime<Utc>>,
    pub new_duration_minutes: Option<i32>,
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictCheckRequest {
    pub professional_id: Uuid,
    pub room_id: Option<Uuid>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub estimated_duration_minutes: Option<i32>,
    pub appointment_type: AppointmentType,
    pub exclude_appointment_id: Option<AppointmentId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentSearchQuery {
    pub patient_id: Option<Uuid>,
    pub professional_id: Option<Uuid>,
    pub room_id: Option<Uuid>,
    pub statuses: Vec<AppointmentStatus>,
    pub appointment_type: Option<AppointmentType>,
    /// Inclusive lower bound on start time.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on start time.
    pub to: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

impl AppointmentSearchQuery {
    pub fn matches(&self, appointment: &Appointment) -> bool {
        self.patient_id.map_or(true, |id| appointment.patient_id == id)
            && self.professional_id.map_or(true, |id| appointment.professional_id == id)
            && self.room_id.map_or(true, |id| appointment.room_id == Some(id))
            && (self.statuses.is_empty() || self.statuses.contains(&appointment.status))
            && self.appointment_type.map_or(true, |t| appointment.appointment_type == t)
            && self.from.map_or(true, |from| appointment.start_time >= from)
            && self.to.map_or(true, |to| appointment.start_time < to)
    }
}

// ==============================================================================
// RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentDetail {
    pub appointment: Appointment,
    pub consent: ConsentDecision,
    pub allowed_actions: Vec<Action>,
    pub rescheduled_into: Vec<AppointmentId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescheduleOutcome {
    pub cancelled: Appointment,
    pub created: Appointment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictCheckResponse {
    pub availability: AvailabilityDecision,
    pub conflicts: ConflictSet,
    pub has_conflict: bool,
    pub is_bookable: bool,
}
