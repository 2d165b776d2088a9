// libs/appointment-cell/src/services/conflict.rs
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{AgendaBlock, Appointment, AppointmentId, Conflict, ConflictSet, ConflictingAppointment};
use crate::services::calendar::{overlaps, Interval};
use crate::store::{SchedulingTx, StoreError};

/// A candidate slot to test against existing bookings and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictQuery {
    pub interval: Interval,
    pub professional_id: Uuid,
    pub room_id: Option<Uuid>,
    /// The appointment being moved, which must not collide with itself.
    pub exclude_id: Option<AppointmentId>,
}

pub struct ConflictDetectionService;

impl ConflictDetectionService {
    pub fn new() -> Self {
        Self
    }

    /// Read the overlapping set through `tx` so the answer is the one the
    /// subsequent write is serialized against.
    pub async fn find_conflicts(
        &self,
        tx: &dyn SchedulingTx,
        query: &ConflictQuery,
    ) -> Result<ConflictSet, StoreError> {
        debug!(
            "Checking conflicts for professional {} room {:?} at {}",
            query.professional_id, query.room_id, query.interval
        );

        let appointments = tx
            .find_overlapping(query.professional_id, query.room_id, &query.interval, query.exclude_id)
            .await?;
        let blocks = tx
            .find_blocks(query.professional_id, query.room_id, &query.interval)
            .await?;

        let conflicts = partition(query, &appointments, &blocks);
        if !conflicts.is_empty() {
            warn!(
                "Conflict detected for professional {} - {} colliding entries",
                query.professional_id,
                conflicts.len()
            );
        }
        Ok(conflicts)
    }
}

impl Default for ConflictDetectionService {
    fn default() -> Self {
        Self::new()
    }
}

/// Split overlapping appointments and blocks by the resource they collide on.
/// Rows the store returned that do not actually hold the slot or overlap are
/// dropped; an entry colliding on both resources appears in both partitions.
pub fn partition(query: &ConflictQuery, appointments: &[Appointment], blocks: &[AgendaBlock]) -> ConflictSet {
    let mut set = ConflictSet::default();

    for appointment in appointments {
        if !appointment.holds_slot() || Some(appointment.id) == query.exclude_id {
            continue;
        }
        let Ok(existing) = appointment.interval() else {
            continue;
        };
        if !overlaps(&existing, &query.interval) {
            continue;
        }

        if appointment.professional_id == query.professional_id {
            set.professional
                .push(Conflict::Appointment(ConflictingAppointment::from(appointment)));
        }
        if query.room_id.is_some() && appointment.room_id == query.room_id {
            set.room
                .push(Conflict::Appointment(ConflictingAppointment::from(appointment)));
        }
    }

    for block in blocks {
        let Ok(blocked) = block.interval() else {
            continue;
        };
        if !overlaps(&blocked, &query.interval) {
            continue;
        }

        if block.professional_id == Some(query.professional_id) {
            set.professional.push(Conflict::Block(block.clone()));
        }
        if query.room_id.is_some() && block.room_id == query.room_id {
            set.room.push(Conflict::Block(block.clone()));
        }
    }

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppointmentStatus, AppointmentType, NewAppointment};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, h, m, 0).unwrap()
    }

    fn appointment(
        id: AppointmentId,
        professional_id: Uuid,
        room_id: Option<Uuid>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: AppointmentStatus,
    ) -> Appointment {
        let mut a = NewAppointment {
            patient_id: Uuid::new_v4(),
            professional_id,
            room_id,
            start_time: start,
            end_time: end,
            estimated_duration_minutes: (end - start).num_minutes() as i32,
            appointment_type: AppointmentType::Checkup,
            reason: None,
            notes: None,
            planned_procedures: Vec::new(),
            created_by_id: Uuid::new_v4(),
            rescheduled_from_id: None,
            created_at: start,
        }
        .into_appointment(id);
        a.status = status;
        a
    }

    fn query(professional_id: Uuid, room_id: Option<Uuid>) -> ConflictQuery {
        ConflictQuery {
            interval: Interval::new(at(9, 0), at(9, 30)).unwrap(),
            professional_id,
            room_id,
            exclude_id: None,
        }
    }

    #[test]
    fn partitions_by_colliding_resource() {
        let professional = Uuid::new_v4();
        let room = Uuid::new_v4();
        let existing = vec![
            appointment(1, professional, None, at(9, 15), at(9, 45), AppointmentStatus::Scheduled),
            appointment(2, Uuid::new_v4(), Some(room), at(8, 45), at(9, 5), AppointmentStatus::Confirmed),
            appointment(3, professional, Some(room), at(9, 0), at(9, 30), AppointmentStatus::InProgress),
        ];

        let set = partition(&query(professional, Some(room)), &existing, &[]);

        let professional_ids: Vec<_> = set
            .professional
            .iter()
            .filter_map(|c| match c {
                Conflict::Appointment(a) => Some(a.id),
                _ => None,
            })
            .collect();
        assert_eq!(professional_ids, vec![1, 3]);
        assert_eq!(set.room.len(), 2);
        assert_eq!(set.appointment_ids(), vec![1, 3, 2]);
    }

    #[test]
    fn released_slots_touching_intervals_and_excluded_id_are_ignored() {
        let professional = Uuid::new_v4();
        let existing = vec![
            appointment(1, professional, None, at(9, 0), at(9, 30), AppointmentStatus::Cancelled),
            appointment(2, professional, None, at(9, 0), at(9, 30), AppointmentStatus::NoShow),
            appointment(3, professional, None, at(9, 0), at(9, 30), AppointmentStatus::Completed),
            appointment(4, professional, None, at(9, 30), at(10, 0), AppointmentStatus::Scheduled),
            appointment(5, professional, None, at(8, 30), at(9, 0), AppointmentStatus::Scheduled),
            appointment(6, professional, None, at(9, 0), at(9, 30), AppointmentStatus::Confirmed),
        ];

        let mut q = query(professional, None);
        q.exclude_id = Some(6);

        assert!(partition(&q, &existing, &[]).is_empty());
    }

    #[test]
    fn every_colliding_appointment_is_reported() {
        let professional = Uuid::new_v4();
        let existing: Vec<_> = (0..4)
            .map(|i| {
                appointment(
                    i + 1,
                    professional,
                    None,
                    at(9, i as u32 * 5),
                    at(9, 25),
                    AppointmentStatus::Scheduled,
                )
            })
            .collect();

        let set = partition(&query(professional, None), &existing, &[]);
        assert_eq!(set.appointment_ids(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn agenda_blocks_conflict_on_their_resource() {
        let professional = Uuid::new_v4();
        let room = Uuid::new_v4();
        let blocks = vec![
            AgendaBlock {
                id: Uuid::new_v4(),
                professional_id: Some(professional),
                room_id: None,
                start_time: at(8, 0),
                end_time: at(12, 0),
                reason: Some("vacation".to_string()),
            },
            AgendaBlock {
                id: Uuid::new_v4(),
                professional_id: None,
                room_id: Some(room),
                start_time: at(9, 20),
                end_time: at(9, 40),
                reason: Some("maintenance".to_string()),
            },
        ];

        let set = partition(&query(professional, Some(room)), &[], &blocks);
        assert_eq!(set.professional.len(), 1);
        assert_eq!(set.room.len(), 1);
        assert!(set.appointment_ids().is_empty());
    }
}
