use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// A calendar date encoded as the Unix ms of its UTC midnight.
pub type DayKey = Ms;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Identifies one person's Interval Set. Ordering (person, then day) is the
/// global lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DayId {
    pub person_id: Ulid,
    pub day: DayKey,
}

impl DayId {
    pub fn new(person_id: Ulid, day: DayKey) -> Self {
        Self { person_id, day }
    }
}

/// Free time for one person on one day.
///
/// `declared == false` means the person has no availability on record for the
/// day (never set, or cleared). That is distinct from a declared day whose
/// `slots` are empty because everything has been booked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayRecord {
    pub id: DayId,
    /// Sorted, pairwise disjoint, non-touching free spans.
    pub slots: Vec<Span>,
    /// Bumped on every committed write.
    pub version: u64,
    pub declared: bool,
}

impl DayRecord {
    pub fn vacant(id: DayId) -> Self {
        Self {
            id,
            slots: Vec::new(),
            version: 0,
            declared: false,
        }
    }

    pub fn declared_slots(&self) -> Option<&[Span]> {
        self.declared.then_some(self.slots.as_slice())
    }

    /// Replace the free set and mark the day as declared.
    pub fn store(&mut self, slots: Vec<Span>) {
        self.slots = slots;
        self.declared = true;
        self.version += 1;
    }

    /// Withdraw availability for the day.
    pub fn withdraw(&mut self) {
        self.slots.clear();
        self.declared = false;
        self.version += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: Ulid,
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Confirmed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "confirmed" => Some(AppointmentStatus::Confirmed),
            "cancelled" | "canceled" => Some(AppointmentStatus::Cancelled),
            _ => None,
        }
    }
}

/// A ledger entry. Never deleted; cancellation and rescheduling mutate it in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub host_id: Ulid,
    pub host_email: String,
    pub attendee_id: Ulid,
    pub attendee_email: String,
    pub day: DayKey,
    pub span: Span,
    pub status: AppointmentStatus,
    /// Exactly what was taken from the host's free set at the last confirm/reschedule.
    pub consumed_host: Vec<Span>,
    /// Exactly what was taken from the attendee's free set at the last confirm/reschedule.
    pub consumed_attendee: Vec<Span>,
}

impl Appointment {
    pub fn is_participant(&self, person_id: &Ulid) -> bool {
        self.host_id == *person_id || self.attendee_id == *person_id
    }

    pub fn host_day(&self) -> DayId {
        DayId::new(self.host_id, self.day)
    }

    pub fn attendee_day(&self) -> DayId {
        DayId::new(self.attendee_id, self.day)
    }
}

/// One requested availability slot, still in wall-clock form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInput {
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM[:SS]`
    pub start: String,
    /// `HH:MM[:SS]`
    pub end: String,
}

/// The resulting free set of one day, carried inside WAL events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySnapshot {
    pub id: DayId,
    pub slots: Vec<Span>,
}

/// One event per committed operation. This is the WAL record format.
///
/// Each event carries the full resulting state of every record it touched, so
/// replaying a single event is all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PersonRegistered {
        id: Ulid,
        email: String,
    },
    PersonRemoved {
        id: Ulid,
    },
    AvailabilitySet {
        days: Vec<DaySnapshot>,
    },
    AvailabilityCleared {
        id: DayId,
    },
    /// Appointment row written verbatim. Compaction also uses it to snapshot
    /// cancelled rows, so `status` is not always `Confirmed`.
    AppointmentBooked {
        appointment: Appointment,
        days: Vec<DaySnapshot>,
    },
    AppointmentCancelled {
        id: Ulid,
        days: Vec<DaySnapshot>,
    },
    AppointmentRescheduled {
        appointment: Appointment,
        days: Vec<DaySnapshot>,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A free slot projected into a caller's zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSlot {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub person_id: Ulid,
    /// `YYYY-MM-DD`
    pub date: String,
    pub version: u64,
    pub slots: Vec<LocalSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentInfo {
    pub id: Ulid,
    pub host_id: Ulid,
    pub host_email: String,
    pub attendee_id: Ulid,
    pub attendee_email: String,
    /// `YYYY-MM-DD`
    pub day: String,
    /// `YYYY-MM-DD HH:MM` in the requested zone.
    pub start: String,
    /// `YYYY-MM-DD HH:MM` in the requested zone.
    pub end: String,
    pub status: AppointmentStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        let inner = Span::new(150, 300);
        let partial = Span::new(50, 200);
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn day_id_orders_by_person_then_day() {
        let a = Ulid::from_parts(1, 0);
        let b = Ulid::from_parts(2, 0);
        let mut ids = vec![DayId::new(b, 0), DayId::new(a, 86_400_000), DayId::new(a, 0)];
        ids.sort();
        assert_eq!(ids, vec![DayId::new(a, 0), DayId::new(a, 86_400_000), DayId::new(b, 0)]);
    }

    #[test]
    fn day_record_declared_vs_vacant() {
        let id = DayId::new(Ulid::new(), 0);
        let mut rec = DayRecord::vacant(id);
        assert!(rec.declared_slots().is_none());

        rec.store(Vec::new());
        assert_eq!(rec.declared_slots(), Some(&[][..]));
        assert_eq!(rec.version, 1);

        rec.store(vec![Span::new(0, 10)]);
        rec.withdraw();
        assert!(rec.declared_slots().is_none());
        assert_eq!(rec.version, 3);
    }

    #[test]
    fn status_parse() {
        assert_eq!(AppointmentStatus::parse("CONFIRMED"), Some(AppointmentStatus::Confirmed));
        assert_eq!(AppointmentStatus::parse("canceled"), Some(AppointmentStatus::Cancelled));
        assert_eq!(AppointmentStatus::parse("pending"), None);
        assert_eq!(AppointmentStatus::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn appointment_participants() {
        let host = Ulid::new();
        let attendee = Ulid::new();
        let apt = Appointment {
            id: Ulid::new(),
            host_id: host,
            host_email: "h@example.com".into(),
            attendee_id: attendee,
            attendee_email: "a@example.com".into(),
            day: 0,
            span: Span::new(10, 20),
            status: AppointmentStatus::Confirmed,
            consumed_host: vec![Span::new(10, 20)],
            consumed_attendee: vec![Span::new(10, 20)],
        };
        assert!(apt.is_participant(&host));
        assert!(apt.is_participant(&attendee));
        assert!(!apt.is_participant(&Ulid::new()));
        assert_eq!(apt.host_day(), DayId::new(host, 0));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AvailabilitySet {
            days: vec![DaySnapshot {
                id: DayId::new(Ulid::new(), 1_700_000_000_000),
                slots: vec![Span::new(100, 200), Span::new(300, 400)],
            }],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
