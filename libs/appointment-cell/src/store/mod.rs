// libs/appointment-cell/src/store/mod.rs
//
// Persistence seam for the scheduler. Writes go through a `SchedulingTx`
// obtained from `AppointmentStore::begin`; dropping a transaction without
// committing discards everything staged on it.

pub mod memory;
pub mod supabase;

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::Weekday;
use uuid::Uuid;

use crate::models::{
    AgendaBlock, Appointment, AppointmentId, AppointmentSearchQuery, ConsentKind, ConsentRecord,
    NewAppointment, Page, PatientFacts, Specialty, WorkingWindow,
};
use crate::services::calendar::Interval;

pub use memory::InMemorySchedulingStore;
pub use supabase::SupabaseSchedulingStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The storage layer refused a write that would double-book a resource.
    #[error("slot already taken: {0}")]
    SlotTaken(String),

    #[error("appointment {id} version mismatch (expected {expected}, found {actual:?})")]
    VersionMismatch {
        id: AppointmentId,
        expected: i64,
        actual: Option<i64>,
    },

    #[error("appointment {0} not found")]
    NotFound(AppointmentId),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// A resource whose schedule a transaction serializes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    Professional(Uuid),
    Room(Uuid),
}

/// The set of resources a transaction locks, kept sorted so every caller
/// acquires locks in the same order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockScope {
    keys: BTreeSet<ResourceKey>,
}

impl LockScope {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn for_slot(professional_id: Uuid, room_id: Option<Uuid>) -> Self {
        let mut keys = BTreeSet::new();
        keys.insert(ResourceKey::Professional(professional_id));
        if let Some(room) = room_id {
            keys.insert(ResourceKey::Room(room));
        }
        Self { keys }
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.keys.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Rows written by a successful commit, as persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitOutcome {
    pub inserted: Vec<Appointment>,
    pub updated: Vec<Appointment>,
}

#[async_trait]
pub trait SchedulingTx: Send + Sync {
    /// Slot-holding appointments overlapping `interval` on the professional or the room.
    async fn find_overlapping(
        &self,
        professional_id: Uuid,
        room_id: Option<Uuid>,
        interval: &Interval,
        exclude_id: Option<AppointmentId>,
    ) -> Result<Vec<Appointment>, StoreError>;

    async fn find_blocks(
        &self,
        professional_id: Uuid,
        room_id: Option<Uuid>,
        interval: &Interval,
    ) -> Result<Vec<AgendaBlock>, StoreError>;

    fn stage_insert(&mut self, appointment: NewAppointment);

    /// Persist `appointment` only if the stored row is still at `expected_version`.
    /// The committed row carries `expected_version + 1`.
    fn stage_update(&mut self, appointment: Appointment, expected_version: i64);

    async fn commit(self: Box<Self>) -> Result<CommitOutcome, StoreError>;
}

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn begin(&self, scope: LockScope) -> Result<Box<dyn SchedulingTx>, StoreError>;

    async fn find_by_id(&self, id: AppointmentId) -> Result<Option<Appointment>, StoreError>;

    /// Ids of appointments whose `rescheduled_from_id` points at `id`.
    async fn find_rescheduled_from(&self, id: AppointmentId) -> Result<Vec<AppointmentId>, StoreError>;

    async fn search(&self, query: &AppointmentSearchQuery) -> Result<Page<Appointment>, StoreError>;

    async fn find_working_hours(
        &self,
        professional_id: Uuid,
        weekday: Weekday,
    ) -> Result<Vec<WorkingWindow>, StoreError>;

    async fn find_specialties(&self, professional_id: Uuid) -> Result<HashSet<Specialty>, StoreError>;

    async fn professional_exists(&self, professional_id: Uuid) -> Result<bool, StoreError>;

    async fn room_exists(&self, room_id: Uuid) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait ConsentDirectory: Send + Sync {
    async fn find_patient(&self, patient_id: Uuid) -> Result<Option<PatientFacts>, StoreError>;

    /// A non-revoked consent of `kind` scoped to exactly `appointment_id`.
    async fn find_active_consent(
        &self,
        patient_id: Uuid,
        appointment_id: AppointmentId,
        kind: ConsentKind,
    ) -> Result<Option<ConsentRecord>, StoreError>;
}
