// libs/appointment-cell/src/store/memory.rs
//
// In-process scheduling store. Detect-then-write is serialized per resource:
// `begin` takes an async lock for every professional/room in the scope and
// holds it until the transaction commits or is dropped. A resource's lock
// entry is removed once no transaction holds or waits on it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use chrono::Weekday;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::models::{
    AgendaBlock, Appointment, AppointmentId, AppointmentSearchQuery, ConsentKind, ConsentRecord,
    NewAppointment, Page, PatientFacts, Specialty, WorkingWindow,
};
use crate::services::calendar::{overlaps, Interval};

use super::{
    AppointmentStore, CommitOutcome, ConsentDirectory, LockScope, ResourceKey, SchedulingTx,
    StoreError,
};

#[derive(Debug, Default)]
struct MemoryState {
    last_id: AppointmentId,
    appointments: BTreeMap<AppointmentId, Appointment>,
    blocks: Vec<AgendaBlock>,
    working_hours: HashMap<(Uuid, Weekday), Vec<WorkingWindow>>,
    specialties: HashMap<Uuid, HashSet<Specialty>>,
    rooms: HashSet<Uuid>,
    patients: HashMap<Uuid, PatientFacts>,
    consents: Vec<ConsentRecord>,
}

impl MemoryState {
    fn overlapping(
        &self,
        professional_id: Uuid,
        room_id: Option<Uuid>,
        interval: &Interval,
        exclude_id: Option<AppointmentId>,
    ) -> Vec<Appointment> {
        self.appointments
            .values()
            .filter(|a| a.holds_slot())
            .filter(|a| Some(a.id) != exclude_id)
            .filter(|a| {
                a.professional_id == professional_id
                    || (room_id.is_some() && a.room_id == room_id)
            })
            .filter(|a| {
                a.interval()
                    .map(|existing| overlaps(&existing, interval))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

type LockRegistry = std::sync::Mutex<HashMap<ResourceKey, Arc<Mutex<()>>>>;

#[derive(Default)]
pub struct InMemorySchedulingStore {
    state: Arc<RwLock<MemoryState>>,
    locks: Arc<LockRegistry>,
}

impl InMemorySchedulingStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ==========================================================================
    // SEEDING
    // ==========================================================================

    pub async fn add_patient(&self, patient: PatientFacts) {
        self.state.write().await.patients.insert(patient.id, patient);
    }

    pub async fn add_professional(&self, professional_id: Uuid, specialties: impl IntoIterator<Item = Specialty>) {
        self.state
            .write()
            .await
            .specialties
            .insert(professional_id, specialties.into_iter().collect());
    }

    pub async fn set_working_hours(&self, professional_id: Uuid, weekday: Weekday, windows: Vec<WorkingWindow>) {
        self.state
            .write()
            .await
            .working_hours
            .insert((professional_id, weekday), windows);
    }

    pub async fn add_room(&self, room_id: Uuid) {
        self.state.write().await.rooms.insert(room_id);
    }

    pub async fn add_block(&self, block: AgendaBlock) {
        self.state.write().await.blocks.push(block);
    }

    pub async fn add_consent(&self, consent: ConsentRecord) {
        self.state.write().await.consents.push(consent);
    }

    pub async fn revoke_consent(&self, consent_id: Uuid, at: chrono::DateTime<chrono::Utc>) {
        let mut state = self.state.write().await;
        if let Some(record) = state.consents.iter_mut().find(|c| c.id == consent_id) {
            record.revoked_at = Some(at);
        }
    }

    pub async fn appointment_count(&self) -> usize {
        self.state.read().await.appointments.len()
    }

    fn lock_for(&self, key: ResourceKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct MemoryTx {
    state: Arc<RwLock<MemoryState>>,
    locks: Arc<LockRegistry>,
    keys: Vec<ResourceKey>,
    guards: Vec<OwnedMutexGuard<()>>,
    inserts: Vec<NewAppointment>,
    updates: Vec<(Appointment, i64)>,
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.guards.clear();

        // Entries are cloned only under the registry mutex, so a count of one
        // means no other transaction holds or waits on the lock.
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        for key in &self.keys {
            if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(key);
            }
        }
    }
}

#[async_trait]
impl SchedulingTx for MemoryTx {
    async fn find_overlapping(
        &self,
        professional_id: Uuid,
        room_id: Option<Uuid>,
        interval: &Interval,
        exclude_id: Option<AppointmentId>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let state = self.state.read().await;
        Ok(state.overlapping(professional_id, room_id, interval, exclude_id))
    }

    async fn find_blocks(
        &self,
        professional_id: Uuid,
        room_id: Option<Uuid>,
        interval: &Interval,
    ) -> Result<Vec<AgendaBlock>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .blocks
            .iter()
            .filter(|b| {
                b.professional_id == Some(professional_id)
                    || (room_id.is_some() && b.room_id == room_id)
            })
            .filter(|b| {
                b.interval()
                    .map(|block| overlaps(&block, interval))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    fn stage_insert(&mut self, appointment: NewAppointment) {
        self.inserts.push(appointment);
    }

    fn stage_update(&mut self, appointment: Appointment, expected_version: i64) {
        self.updates.push((appointment, expected_version));
    }

    async fn commit(self: Box<Self>) -> Result<CommitOutcome, StoreError> {
        let mut this = self;
        let updates = std::mem::take(&mut this.updates);
        let inserts = std::mem::take(&mut this.inserts);
        let mut state = this.state.write().await;

        // Validate everything before touching anything.
        for (appointment, expected) in &updates {
            let current = state
                .appointments
                .get(&appointment.id)
                .ok_or(StoreError::NotFound(appointment.id))?;
            if current.version != *expected {
                return Err(StoreError::VersionMismatch {
                    id: appointment.id,
                    expected: *expected,
                    actual: Some(current.version),
                });
            }
        }

        let mut outcome = CommitOutcome::default();

        for (mut appointment, expected) in updates {
            appointment.version = expected + 1;
            state.appointments.insert(appointment.id, appointment.clone());
            outcome.updated.push(appointment);
        }

        for new in inserts {
            state.last_id += 1;
            let appointment = new.into_appointment(state.last_id);
            state.appointments.insert(appointment.id, appointment.clone());
            outcome.inserted.push(appointment);
        }

        debug!(
            "Committed {} insert(s) and {} update(s)",
            outcome.inserted.len(),
            outcome.updated.len()
        );
        Ok(outcome)
    }
}

#[async_trait]
impl AppointmentStore for InMemorySchedulingStore {
    async fn begin(&self, scope: LockScope) -> Result<Box<dyn SchedulingTx>, StoreError> {
        let keys: Vec<ResourceKey> = scope.keys().copied().collect();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = self.lock_for(*key);
            guards.push(lock.lock_owned().await);
        }

        Ok(Box::new(MemoryTx {
            state: self.state.clone(),
            locks: self.locks.clone(),
            keys,
            guards,
            inserts: Vec::new(),
            updates: Vec::new(),
        }))
    }

    async fn find_by_id(&self, id: AppointmentId) -> Result<Option<Appointment>, StoreError> {
        Ok(self.state.read().await.appointments.get(&id).cloned())
    }

    async fn find_rescheduled_from(&self, id: AppointmentId) -> Result<Vec<AppointmentId>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .appointments
            .values()
            .filter(|a| a.rescheduled_from_id == Some(id))
            .map(|a| a.id)
            .collect())
    }

    async fn search(&self, query: &AppointmentSearchQuery) -> Result<Page<Appointment>, StoreError> {
        let state = self.state.read().await;
        let mut matching: Vec<&Appointment> =
            state.appointments.values().filter(|a| query.matches(a)).collect();
        matching.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .cloned()
            .collect();

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
        Ok(self
            .state
            .read()
            .await
            .working_hours
            .get(&(professional_id, weekday))
            .cloned()
            .unwrap_or_default())
    }

    async fn find_specialties(&self, professional_id: Uuid) -> Result<HashSet<Specialty>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .specialties
            .get(&professional_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn professional_exists(&self, professional_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.state.read().await.specialties.contains_key(&professional_id))
    }

    async fn room_exists(&self, room_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.state.read().await.rooms.contains(&room_id))
    }
}

#[async_trait]
impl ConsentDirectory for InMemorySchedulingStore {
    async fn find_patient(&self, patient_id: Uuid) -> Result<Option<PatientFacts>, StoreError> {
        Ok(self.state.read().await.patients.get(&patient_id).cloned())
    }

    async fn find_active_consent(
        &self,
        patient_id: Uuid,
        appointment_id: AppointmentId,
        kind: ConsentKind,
    ) -> Result<Option<ConsentRecord>, StoreError> {
        let state = self.state.read().await;
        // Open-ended records sort after any bounded one.
        Ok(state
            .consents
            .iter()
            .filter(|c| {
                c.patient_id == patient_id
                    && c.appointment_id == Some(appointment_id)
                    && c.kind == kind
                    && c.revoked_at.is_none()
            })
            .max_by_key(|c| (c.valid_until.is_none(), c.valid_until))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AppointmentType;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn new_appointment(professional_id: Uuid, start_hour: u32) -> NewAppointment {
        let start = Utc.with_ymd_and_hms(2024, 6, 3, start_hour, 0, 0).unwrap();
        NewAppointment {
            patient_id: Uuid::new_v4(),
            professional_id,
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
    }

    #[tokio::test]
    async fn commit_assigns_ids_and_initial_version() {
        let store = InMemorySchedulingStore::new();
        let professional = Uuid::new_v4();

        let mut tx = store.begin(LockScope::for_slot(professional, None)).await.unwrap();
        tx.stage_insert(new_appointment(professional, 9));
        tx.stage_insert(new_appointment(professional, 10));
        let outcome = tx.commit().await.unwrap();

        let ids: Vec<_> = outcome.inserted.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(outcome.inserted.iter().all(|a| a.version == 1));
    }

    #[tokio::test]
    async fn dropped_transaction_writes_nothing() {
        let store = InMemorySchedulingStore::new();
        let professional = Uuid::new_v4();

        {
            let mut tx = store.begin(LockScope::for_slot(professional, None)).await.unwrap();
            tx.stage_insert(new_appointment(professional, 9));
        }

        assert_eq!(store.appointment_count().await, 0);
    }

    #[tokio::test]
    async fn stale_update_is_rejected_without_partial_writes() {
        let store = InMemorySchedulingStore::new();
        let professional = Uuid::new_v4();

        let mut tx = store.begin(LockScope::none()).await.unwrap();
        tx.stage_insert(new_appointment(professional, 9));
        let created = tx.commit().await.unwrap().inserted.remove(0);

        let mut tx = store.begin(LockScope::none()).await.unwrap();
        tx.stage_insert(new_appointment(professional, 11));
        tx.stage_update(created.clone(), created.version + 5);
        let err = tx.commit().await.unwrap_err();

        assert_eq!(
            err,
            StoreError::VersionMismatch { id: created.id, expected: 6, actual: Some(1) }
        );
        assert_eq!(store.appointment_count().await, 1);
    }

    #[tokio::test]
    async fn scope_lock_blocks_second_transaction_until_release() {
        let store = Arc::new(InMemorySchedulingStore::new());
        let professional = Uuid::new_v4();

        let first = store.begin(LockScope::for_slot(professional, None)).await.unwrap();

        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                store.begin(LockScope::for_slot(professional, None)).await.map(|_| ())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender should acquire the lock once released")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn lock_entries_are_pruned_once_released() {
        let store = Arc::new(InMemorySchedulingStore::new());
        let professional = Uuid::new_v4();
        let room = Uuid::new_v4();

        let first = store.begin(LockScope::for_slot(professional, Some(room))).await.unwrap();
        assert_eq!(store.tracked_locks(), 2);

        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let tx = store.begin(LockScope::for_slot(professional, None)).await?;
                tx.commit().await.map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(first);
        // The waiting contender still holds the professional's entry.
        assert!(store.tracked_locks() >= 1);

        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender should finish once the lock is released")
            .unwrap()
            .unwrap();
        assert_eq!(store.tracked_locks(), 0);

        let tx = store.begin(LockScope::for_slot(professional, None)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn overlapping_query_ignores_released_slots_and_excluded_id() {
        let store = InMemorySchedulingStore::new();
        let professional = Uuid::new_v4();

        let mut tx = store.begin(LockScope::none()).await.unwrap();
        tx.stage_insert(new_appointment(professional, 9));
        tx.stage_insert(new_appointment(professional, 9));
        let outcome = tx.commit().await.unwrap();

        let mut cancelled = outcome.inserted[1].clone();
        cancelled.status = crate::models::AppointmentStatus::Cancelled;
        let mut tx = store.begin(LockScope::none()).await.unwrap();
        tx.stage_update(cancelled, 1);
        tx.commit().await.unwrap();

        let window = Interval::new(
            Utc.with_ymd_and_hms(2024, 6, 3, 9, 10, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 3, 9, 20, 0).unwrap(),
        )
        .unwrap();
        let tx = store.begin(LockScope::none()).await.unwrap();

        let hits = tx.find_overlapping(professional, None, &window, None).await.unwrap();
        assert_eq!(hits.len(), 1);

        let hits = tx
            .find_overlapping(professional, None, &window, Some(outcome.inserted[0].id))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
