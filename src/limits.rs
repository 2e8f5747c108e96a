//! Hard caps applied before any state is touched.

pub const MAX_PEOPLE: usize = 100_000;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_ZONE_NAME_LEN: usize = 64;
/// Free fragments kept per (person, day). 15-minute granularity over 24h.
pub const MAX_SLOTS_PER_DAY: usize = 96;
/// Rows accepted by a single SetAvailability.
pub const MAX_AVAILABILITY_ROWS: usize = 1000;
/// Widest inclusive date range a query may cover.
pub const MAX_QUERY_DAYS: i64 = 366;
