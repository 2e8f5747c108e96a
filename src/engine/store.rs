use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub type SharedDay = Arc<RwLock<DayRecord>>;
pub type SharedAppointment = Arc<RwLock<Appointment>>;

/// Write guards over a set of day records, in lock order. Keys with no record
/// are absent from the list.
pub type DayGuards = Vec<(DayId, OwnedRwLockWriteGuard<DayRecord>)>;

/// In-memory home of every versioned record: per-(person, day) free sets,
/// the appointment ledger, and the person directory.
///
/// Day records are never removed from the map once created; withdrawing
/// availability flips `declared` under the record's own lock, so a task that
/// fetched the handle earlier can never write into an orphaned record.
pub struct AvailabilityStore {
    days: DashMap<DayId, SharedDay>,
    appointments: DashMap<Ulid, SharedAppointment>,
    /// person → appointments they host or attend
    person_appointments: DashMap<Ulid, Vec<Ulid>>,
    people: DashMap<Ulid, Person>,
    emails: DashMap<String, Ulid>,
    /// ids of bookings between their uniqueness check and their ledger insert
    claimed_ids: DashSet<Ulid>,
}

impl Default for AvailabilityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityStore {
    pub fn new() -> Self {
        Self {
            days: DashMap::new(),
            appointments: DashMap::new(),
            person_appointments: DashMap::new(),
            people: DashMap::new(),
            emails: DashMap::new(),
            claimed_ids: DashSet::new(),
        }
    }

    // ── People ───────────────────────────────────────────────

    pub fn person_count(&self) -> usize {
        self.people.len()
    }

    pub fn get_person(&self, id: &Ulid) -> Option<Person> {
        self.people.get(id).map(|e| e.value().clone())
    }

    pub fn email_in_use(&self, email: &str) -> bool {
        self.emails.contains_key(&email.to_lowercase())
    }

    pub fn insert_person(&self, person: Person) {
        self.emails.insert(person.email.to_lowercase(), person.id);
        self.people.insert(person.id, person);
    }

    pub fn remove_person(&self, id: &Ulid) -> Option<Person> {
        let (_, person) = self.people.remove(id)?;
        self.emails.remove(&person.email.to_lowercase());
        Some(person)
    }

    pub fn people(&self) -> Vec<Person> {
        self.people.iter().map(|e| e.value().clone()).collect()
    }

    // ── Day records ──────────────────────────────────────────

    pub fn get_day(&self, id: &DayId) -> Option<SharedDay> {
        self.days.get(id).map(|e| e.value().clone())
    }

    /// Fetch the record for `id`, creating an undeclared one if needed.
    pub fn day_or_vacant(&self, id: DayId) -> SharedDay {
        self.days
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(DayRecord::vacant(id))))
            .value()
            .clone()
    }

    pub fn day_handles(&self) -> Vec<SharedDay> {
        self.days.iter().map(|e| e.value().clone()).collect()
    }

    /// Write-lock every existing record among `ids` in ascending `DayId`
    /// order, each wait bounded by `timeout`.
    pub async fn lock_days(&self, ids: &[DayId], timeout: Duration) -> Result<DayGuards, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(day) = self.get_day(&id) {
                guards.push((id, acquire_write(day, timeout, "availability lock").await?));
            }
        }
        Ok(guards)
    }

    /// Like [`lock_days`](Self::lock_days) but creates missing records, for
    /// operations that declare availability.
    pub async fn lock_days_for_write(
        &self,
        ids: &[DayId],
        timeout: Duration,
    ) -> Result<DayGuards, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let day = self.day_or_vacant(id);
            guards.push((id, acquire_write(day, timeout, "availability lock").await?));
        }
        Ok(guards)
    }

    pub async fn read_day(
        &self,
        id: &DayId,
        timeout: Duration,
    ) -> Result<Option<OwnedRwLockReadGuard<DayRecord>>, EngineError> {
        let Some(day) = self.get_day(id) else {
            return Ok(None);
        };
        acquire_read(day, timeout, "availability lock").await.map(Some)
    }

    // ── Appointment ledger ───────────────────────────────────

    /// Reserve `id` for a booking in flight. `None` if the ledger already has
    /// it or another booking holds the claim. The claim is released on drop,
    /// which must come after `insert_appointment` on success.
    pub fn claim_appointment_id(&self, id: Ulid) -> Option<IdClaim<'_>> {
        if self.appointments.contains_key(&id) || !self.claimed_ids.insert(id) {
            return None;
        }
        let claim = IdClaim { store: self, id };
        // A booking with this id may have committed and dropped its claim
        // between the two checks above.
        if self.appointments.contains_key(&id) {
            return None;
        }
        Some(claim)
    }

    pub fn get_appointment(&self, id: &Ulid) -> Option<SharedAppointment> {
        self.appointments.get(id).map(|e| e.value().clone())
    }

    pub async fn lock_appointment(
        &self,
        id: &Ulid,
        timeout: Duration,
    ) -> Result<OwnedRwLockWriteGuard<Appointment>, EngineError> {
        let apt = self.get_appointment(id).ok_or(EngineError::NotFound(*id))?;
        acquire_write(apt, timeout, "appointment lock").await
    }

    /// Add a new ledger row and index it under both participants.
    pub fn insert_appointment(&self, appointment: Appointment) {
        let id = appointment.id;
        for person in [appointment.host_id, appointment.attendee_id] {
            self.person_appointments.entry(person).or_default().push(id);
        }
        self.appointments.insert(id, Arc::new(RwLock::new(appointment)));
    }

    pub fn appointments_of(&self, person_id: &Ulid) -> Vec<SharedAppointment> {
        let ids = self
            .person_appointments
            .get(person_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get_appointment(id)).collect()
    }

    pub fn appointment_handles(&self) -> Vec<SharedAppointment> {
        self.appointments.iter().map(|e| e.value().clone()).collect()
    }
}

pub struct IdClaim<'a> {
    store: &'a AvailabilityStore,
    id: Ulid,
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.store.claimed_ids.remove(&self.id);
    }
}

fn lock_timeout(what: &'static str) -> EngineError {
    metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL, "lock" => what).increment(1);
    tracing::warn!("timed out waiting for {what}");
    EngineError::Timeout(what)
}

pub(super) async fn acquire_read<T>(
    lock: Arc<RwLock<T>>,
    timeout: Duration,
    what: &'static str,
) -> Result<OwnedRwLockReadGuard<T>, EngineError> {
    tokio::time::timeout(timeout, lock.read_owned())
        .await
        .map_err(|_| lock_timeout(what))
}

async fn acquire_write<T>(
    lock: Arc<RwLock<T>>,
    timeout: Duration,
    what: &'static str,
) -> Result<OwnedRwLockWriteGuard<T>, EngineError> {
    tokio::time::timeout(timeout, lock.write_owned())
        .await
        .map_err(|_| lock_timeout(what))
}
