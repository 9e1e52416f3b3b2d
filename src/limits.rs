//! Hard caps that keep a single request from exhausting memory or the WAL.

/// Upper bound on `max_participants` for one reservation.
pub const MAX_PARTICIPANTS: u32 = 500;

/// Reservations a single field may hold at once.
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;

/// Catalog size.
pub const MAX_RESOURCES: usize = 10_000;

pub const MAX_RESOURCE_NAME_LEN: usize = 200;

/// Earliest accepted instant (2000-01-01T00:00:00Z).
pub const MIN_VALID_TIMESTAMP_MS: i64 = 946_684_800_000;

/// Latest accepted instant (2100-01-01T00:00:00Z).
pub const MAX_VALID_TIMESTAMP_MS: i64 = 4_102_444_800_000;
