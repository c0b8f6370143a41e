use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;

/// Seats per class session.
pub const MAX_CAPACITY: u32 = 10_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single session may not run longer than one day.
pub const MAX_SPAN_DURATION_MS: Ms = 86_400_000;

/// Retry attempts on a transient store failure are capped here regardless of config.
pub const MAX_TRANSACTION_RETRIES: usize = 10;
