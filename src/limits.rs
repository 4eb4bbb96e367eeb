use crate::model::Ms;

pub const MAX_MOVIE_NAME_LEN: usize = 50;
pub const MIN_MOVIE_DURATION_MINUTES: u32 = 30;
pub const MAX_MOVIE_DURATION_MINUTES: u32 = 350;

pub const MAX_HALL_SEATS: u32 = 100_000;
pub const MAX_HALLS: usize = 100_000;
pub const MAX_MOVIES: usize = 100_000;
pub const MAX_SESSIONS_PER_HALL: usize = 100_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const DEFAULT_BOOKING_TIMEOUT_SECS: u64 = 100;
pub const MAX_BOOKING_TIMEOUT_SECS: u64 = 86_400;
