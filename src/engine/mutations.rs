use std::collections::{BTreeMap, HashMap};

use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::tz;

use super::intervals::{release, reserve};
use super::queries::project_day;
use super::store::DayGuards;
use super::{Engine, EngineError, WalCommand};

/// Absolute span and day key of a requested appointment.
fn appointment_window(start: &str, end: &str, zone: &str) -> Result<(DayKey, Span), EngineError> {
    let zone = tz::parse_zone(zone)?;
    let start = tz::parse_local(start)?;
    let end = tz::parse_local(end)?;
    if start.date() != end.date() {
        return Err(EngineError::InvalidTimestamp(
            "appointment must start and end on the same date".into(),
        ));
    }
    let start_ms = tz::resolve(start, zone)?;
    let end_ms = tz::resolve(end, zone)?;
    if end_ms <= start_ms {
        return Err(EngineError::InvalidTimestamp(
            "appointment must end after it starts".into(),
        ));
    }
    Ok((tz::day_key(start.date()), Span::new(start_ms, end_ms)))
}

fn reject(reason: &'static str, err: EngineError) -> EngineError {
    metrics::counter!(crate::observability::BOOKING_REJECTIONS_TOTAL, "reason" => reason).increment(1);
    debug!("booking rejected: {err}");
    err
}

fn guard_index(guards: &DayGuards, id: &DayId) -> Option<usize> {
    guards.iter().position(|(gid, _)| gid == id)
}

/// Every write of a free set, split or merge, stays under the per-day cap.
fn check_slot_cap(slots: &[Span]) -> Result<(), EngineError> {
    if slots.len() > MAX_SLOTS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many free slots on one day"));
    }
    Ok(())
}

/// Write resulting free sets into the locked records.
fn apply_days(guards: &mut DayGuards, days: &[DaySnapshot]) {
    for snap in days {
        if let Some(idx) = guard_index(guards, &snap.id) {
            guards[idx].1.store(snap.slots.clone());
        }
    }
}

impl Engine {
    // ── Person directory ─────────────────────────────────────

    pub async fn register_person(&self, id: Ulid, email: String) -> Result<Person, EngineError> {
        let email = email.trim().to_string();
        if email.is_empty() || !email.contains('@') {
            return Err(EngineError::InvalidRequest("email must look like name@domain"));
        }
        if email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("email too long"));
        }

        let _directory = self.directory_lock.lock().await;
        if self.store.person_count() >= MAX_PEOPLE {
            return Err(EngineError::LimitExceeded("too many people"));
        }
        if self.store.get_person(&id).is_some() {
            return Err(EngineError::AlreadyExists(format!("person {id}")));
        }
        if self.store.email_in_use(&email) {
            return Err(EngineError::AlreadyExists(format!("email {email}")));
        }

        let _gate = self.enter_commit().await?;
        let event = Event::PersonRegistered { id, email: email.clone() };
        self.wal_append(&event).await?;
        let person = Person { id, email };
        self.store.insert_person(person.clone());
        info!("registered person {id}");
        Ok(person)
    }

    /// Drop a person from the directory. Their availability and appointment
    /// history stay in place.
    pub async fn remove_person(&self, id: Ulid) -> Result<(), EngineError> {
        let _directory = self.directory_lock.lock().await;
        if self.store.get_person(&id).is_none() {
            return Err(EngineError::PersonNotFound(id));
        }

        let _gate = self.enter_commit().await?;
        self.wal_append(&Event::PersonRemoved { id }).await?;
        self.store.remove_person(&id);
        info!("removed person {id}");
        Ok(())
    }

    // ── Availability ─────────────────────────────────────────

    /// Merge `slots` into the person's free sets, one per local date.
    /// Returns the resulting set of every date touched.
    pub async fn set_availability(
        &self,
        person_id: Ulid,
        slots: &[SlotInput],
        zone: &str,
    ) -> Result<Vec<DayAvailability>, EngineError> {
        if slots.is_empty() {
            return Err(EngineError::InvalidRequest("no availability slots given"));
        }
        if slots.len() > MAX_AVAILABILITY_ROWS {
            return Err(EngineError::LimitExceeded("too many availability rows"));
        }
        let tz_zone = tz::parse_zone(zone)?;

        let mut by_day: BTreeMap<DayKey, Vec<Span>> = BTreeMap::new();
        for slot in slots {
            let date = tz::parse_date(&slot.date)?;
            let start = date.and_time(tz::parse_clock(&slot.start)?);
            let end = tz::slot_end(date, &slot.end)?;
            if end <= start {
                return Err(EngineError::InvalidTimestamp(format!(
                    "slot {} {}-{} must end after it starts on the same date",
                    slot.date, slot.start, slot.end
                )));
            }
            let start_ms = tz::resolve(start, tz_zone)?;
            let end_ms = tz::resolve(end, tz_zone)?;
            if end_ms <= start_ms {
                return Err(EngineError::InvalidTimestamp(format!(
                    "slot {} {}-{} is empty in {zone}",
                    slot.date, slot.start, slot.end
                )));
            }
            by_day.entry(tz::day_key(date)).or_default().push(Span::new(start_ms, end_ms));
        }
        self.get_person(&person_id)?;

        let ids: Vec<DayId> = by_day.keys().map(|&day| DayId::new(person_id, day)).collect();
        let _gate = self.enter_commit().await?;
        let mut guards = self.store.lock_days_for_write(&ids, self.lock_timeout).await?;

        let mut days = Vec::with_capacity(guards.len());
        for (id, record) in &guards {
            let existing = record.declared_slots().unwrap_or_default();
            let added = by_day.get(&id.day).map(Vec::as_slice).unwrap_or_default();
            let merged = release(existing, added);
            check_slot_cap(&merged)?;
            days.push(DaySnapshot { id: *id, slots: merged });
        }

        self.wal_append(&Event::AvailabilitySet { days: days.clone() }).await?;
        apply_days(&mut guards, &days);
        debug!("availability set for {person_id} on {} day(s)", days.len());

        Ok(guards
            .iter()
            .map(|(_, record)| project_day(record, tz_zone))
            .collect())
    }

    /// Withdraw the person's availability for one local date.
    pub async fn clear_availability(
        &self,
        person_id: Ulid,
        date: &str,
        zone: &str,
    ) -> Result<(), EngineError> {
        tz::parse_zone(zone)?;
        let id = DayId::new(person_id, tz::day_key(tz::parse_date(date)?));
        self.get_person(&person_id)?;

        let _gate = self.enter_commit().await?;
        let mut guards = self.store.lock_days(&[id], self.lock_timeout).await?;
        let Some((_, record)) = guards.first_mut() else {
            return Err(EngineError::AvailabilityNotFound(id));
        };
        if !record.declared {
            return Err(EngineError::AvailabilityNotFound(id));
        }

        self.wal_append(&Event::AvailabilityCleared { id }).await?;
        record.withdraw();
        debug!("availability cleared for {person_id} on {date}");
        Ok(())
    }

    // ── Booking orchestration ────────────────────────────────

    /// Reserve the same span from host and attendee and record a confirmed
    /// appointment. Both free sets and the ledger row commit as one WAL event.
    pub async fn book(
        &self,
        id: Ulid,
        host_id: Ulid,
        attendee_id: Ulid,
        start: &str,
        end: &str,
        zone: &str,
    ) -> Result<Appointment, EngineError> {
        if host_id == attendee_id {
            return Err(EngineError::InvalidRequest("host and attendee must be different people"));
        }
        let (day, span) = appointment_window(start, end, zone)?;
        // Held until the ledger row is inserted, so a concurrent booking
        // with the same id cannot reserve capacity too.
        let _claim = self
            .store
            .claim_appointment_id(id)
            .ok_or_else(|| EngineError::AlreadyExists(format!("appointment {id}")))?;
        let host = self.get_person(&host_id)?;
        let attendee = self.get_person(&attendee_id)?;

        let host_day = DayId::new(host_id, day);
        let attendee_day = DayId::new(attendee_id, day);
        let _gate = self.enter_commit().await?;
        let mut guards = self
            .store
            .lock_days(&[host_day, attendee_day], self.lock_timeout)
            .await?;

        let mut reserved = Vec::with_capacity(2);
        for (person, day_id) in [(host_id, host_day), (attendee_id, attendee_day)] {
            let slots = guard_index(&guards, &day_id)
                .and_then(|idx| guards[idx].1.declared_slots())
                .ok_or_else(|| reject("availability_not_found", EngineError::AvailabilityNotFound(day_id)))?;
            let reservation = reserve(slots, span)
                .ok_or_else(|| reject("slot_unavailable", EngineError::SlotUnavailable(person)))?;
            check_slot_cap(&reservation.remaining)?;
            reserved.push((day_id, reservation));
        }

        let appointment = Appointment {
            id,
            host_id,
            host_email: host.email,
            attendee_id,
            attendee_email: attendee.email,
            day,
            span,
            status: AppointmentStatus::Confirmed,
            consumed_host: reserved[0].1.consumed.clone(),
            consumed_attendee: reserved[1].1.consumed.clone(),
        };
        let days: Vec<DaySnapshot> = reserved
            .into_iter()
            .map(|(id, r)| DaySnapshot { id, slots: r.remaining })
            .collect();

        self.wal_append(&Event::AppointmentBooked {
            appointment: appointment.clone(),
            days: days.clone(),
        })
        .await?;
        apply_days(&mut guards, &days);
        self.store.insert_appointment(appointment.clone());
        info!("booked appointment {id} for {host_id} with {attendee_id}");
        Ok(appointment)
    }

    /// Mark a confirmed appointment cancelled and give each participant back
    /// exactly the fragments it consumed.
    pub async fn cancel(&self, id: Ulid, requester_id: Ulid) -> Result<Appointment, EngineError> {
        let _gate = self.enter_commit().await?;
        let mut apt = self.store.lock_appointment(&id, self.lock_timeout).await?;
        if !apt.is_participant(&requester_id) {
            return Err(reject(
                "unauthorized",
                EngineError::Unauthorized { appointment: id, requester: requester_id },
            ));
        }
        if apt.status == AppointmentStatus::Cancelled {
            return Err(reject("already_cancelled", EngineError::AlreadyCancelled(id)));
        }

        let mut guards = self
            .store
            .lock_days(&[apt.host_day(), apt.attendee_day()], self.lock_timeout)
            .await?;
        let mut days = Vec::with_capacity(2);
        for (day_id, consumed) in [
            (apt.host_day(), &apt.consumed_host),
            (apt.attendee_day(), &apt.consumed_attendee),
        ] {
            // A withdrawn day has nothing to give back to.
            if let Some(slots) = guard_index(&guards, &day_id).and_then(|i| guards[i].1.declared_slots()) {
                days.push(DaySnapshot { id: day_id, slots: release(slots, consumed) });
            }
        }

        self.wal_append(&Event::AppointmentCancelled { id, days: days.clone() }).await?;
        apply_days(&mut guards, &days);
        apt.status = AppointmentStatus::Cancelled;
        info!("cancelled appointment {id} at the request of {requester_id}");
        Ok(apt.clone())
    }

    /// Move a confirmed appointment. The old reservation is released and the
    /// new one taken on working copies while every touched record is locked,
    /// so a failure leaves the appointment and all free sets as they were.
    pub async fn reschedule(
        &self,
        id: Ulid,
        requester_id: Ulid,
        start: &str,
        end: &str,
        zone: &str,
    ) -> Result<Appointment, EngineError> {
        let (day, span) = appointment_window(start, end, zone)?;

        let _gate = self.enter_commit().await?;
        let mut apt = self.store.lock_appointment(&id, self.lock_timeout).await?;
        if !apt.is_participant(&requester_id) {
            return Err(reject(
                "unauthorized",
                EngineError::Unauthorized { appointment: id, requester: requester_id },
            ));
        }
        if apt.status == AppointmentStatus::Cancelled {
            return Err(reject("already_cancelled", EngineError::AlreadyCancelled(id)));
        }

        let new_host = DayId::new(apt.host_id, day);
        let new_attendee = DayId::new(apt.attendee_id, day);
        let mut guards = self
            .store
            .lock_days(
                &[apt.host_day(), apt.attendee_day(), new_host, new_attendee],
                self.lock_timeout,
            )
            .await?;

        let mut working: HashMap<DayId, Vec<Span>> = guards
            .iter()
            .filter_map(|(id, record)| record.declared_slots().map(|s| (*id, s.to_vec())))
            .collect();

        for (day_id, consumed) in [
            (apt.host_day(), &apt.consumed_host),
            (apt.attendee_day(), &apt.consumed_attendee),
        ] {
            if let Some(slots) = working.get_mut(&day_id) {
                *slots = release(slots, consumed);
            }
        }

        let mut consumed = Vec::with_capacity(2);
        for (person, day_id) in [(apt.host_id, new_host), (apt.attendee_id, new_attendee)] {
            let slots = working
                .get_mut(&day_id)
                .ok_or_else(|| reject("availability_not_found", EngineError::AvailabilityNotFound(day_id)))?;
            let reservation = reserve(slots, span)
                .ok_or_else(|| reject("slot_unavailable", EngineError::SlotUnavailable(person)))?;
            check_slot_cap(&reservation.remaining)?;
            *slots = reservation.remaining;
            consumed.push(reservation.consumed);
        }

        let mut updated = apt.clone();
        updated.day = day;
        updated.span = span;
        updated.consumed_attendee = consumed.pop().unwrap_or_default();
        updated.consumed_host = consumed.pop().unwrap_or_default();

        let mut days: Vec<DaySnapshot> = working
            .into_iter()
            .map(|(id, slots)| DaySnapshot { id, slots })
            .collect();
        days.sort_by_key(|d| d.id);

        self.wal_append(&Event::AppointmentRescheduled {
            appointment: updated.clone(),
            days: days.clone(),
        })
        .await?;
        apply_days(&mut guards, &days);
        *apt = updated;
        info!("rescheduled appointment {id} at the request of {requester_id}");
        Ok(apt.clone())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event list that recreates current state.
    /// Holds the commit gate exclusively, so no mutation commits between the
    /// snapshot and the file swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut people = self.store.people();
        people.sort_by_key(|p| p.id);
        let mut events: Vec<Event> = people
            .into_iter()
            .map(|p| Event::PersonRegistered { id: p.id, email: p.email })
            .collect();

        let mut days = Vec::new();
        for handle in self.store.day_handles() {
            let record = handle.read().await;
            if record.declared {
                days.push(DaySnapshot { id: record.id, slots: record.slots.clone() });
            }
        }
        days.sort_by_key(|d| d.id);
        if !days.is_empty() {
            events.push(Event::AvailabilitySet { days });
        }

        let mut appointments = Vec::new();
        for handle in self.store.appointment_handles() {
            appointments.push(handle.read().await.clone());
        }
        appointments.sort_by_key(|a| a.id);
        events.extend(
            appointments
                .into_iter()
                .map(|appointment| Event::AppointmentBooked { appointment, days: Vec::new() }),
        );

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
