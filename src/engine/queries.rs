use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;
use crate::tz;

use super::store::acquire_read;
use super::{Engine, EngineError};

/// Render a ledger row in `zone`.
pub fn project_appointment(apt: &Appointment, zone: Tz) -> AppointmentInfo {
    AppointmentInfo {
        id: apt.id,
        host_id: apt.host_id,
        host_email: apt.host_email.clone(),
        attendee_id: apt.attendee_id,
        attendee_email: apt.attendee_email.clone(),
        day: tz::format_date(apt.day),
        start: tz::format_local(apt.span.start, zone),
        end: tz::format_local(apt.span.end, zone),
        status: apt.status,
    }
}

pub(super) fn project_day(record: &DayRecord, zone: Tz) -> DayAvailability {
    let date = tz::date_of_key(record.id.day);
    DayAvailability {
        person_id: record.id.person_id,
        date: tz::format_date(record.id.day),
        version: record.version,
        slots: record
            .slots
            .iter()
            .map(|s| LocalSlot {
                start: tz::format_clock_on(s.start, zone, date),
                end: tz::format_clock_on(s.end, zone, date),
            })
            .collect(),
    }
}

impl Engine {
    pub fn person_count(&self) -> usize {
        self.store.person_count()
    }

    pub fn get_person(&self, id: &Ulid) -> Result<Person, EngineError> {
        self.store.get_person(id).ok_or(EngineError::PersonNotFound(*id))
    }

    /// Declared free sets for `person_id` on every date in `[from, to]`.
    /// Dates without declared availability are omitted.
    pub async fn get_availability(
        &self,
        person_id: Ulid,
        from: &str,
        to: &str,
        zone: &str,
    ) -> Result<Vec<DayAvailability>, EngineError> {
        let zone = tz::parse_zone(zone)?;
        let keys = tz::day_range(tz::parse_date(from)?, tz::parse_date(to)?)?;
        self.get_person(&person_id)?;

        let mut days = Vec::new();
        for key in keys {
            let id = DayId::new(person_id, key);
            if let Some(record) = self.store.read_day(&id, self.lock_timeout).await?
                && record.declared
            {
                days.push(project_day(&record, zone));
            }
        }
        Ok(days)
    }

    /// Appointments `person_id` hosts or attends on dates in `[from, to]`,
    /// ordered by start time.
    pub async fn get_appointments(
        &self,
        person_id: Ulid,
        from: &str,
        to: &str,
        zone: &str,
        status: Option<AppointmentStatus>,
    ) -> Result<Vec<AppointmentInfo>, EngineError> {
        let zone = tz::parse_zone(zone)?;
        let keys = tz::day_range(tz::parse_date(from)?, tz::parse_date(to)?)?;
        self.get_person(&person_id)?;
        let (Some(&first), Some(&last)) = (keys.first(), keys.last()) else {
            return Ok(Vec::new());
        };

        let mut rows = Vec::new();
        for handle in self.store.appointments_of(&person_id) {
            let apt = acquire_read(handle, self.lock_timeout, "appointment lock").await?;
            if apt.day < first || apt.day > last {
                continue;
            }
            if status.is_some_and(|s| s != apt.status) {
                continue;
            }
            rows.push(apt.clone());
        }
        rows.sort_by_key(|a| (a.span.start, a.id));
        Ok(rows.iter().map(|a| project_appointment(a, zone)).collect())
    }

    pub async fn get_appointment(&self, id: &Ulid, zone: &str) -> Result<AppointmentInfo, EngineError> {
        let zone = tz::parse_zone(zone)?;
        let handle = self.store.get_appointment(id).ok_or(EngineError::NotFound(*id))?;
        let apt = acquire_read(handle, self.lock_timeout, "appointment lock").await?;
        Ok(project_appointment(&apt, zone))
    }
}
