use std::time::{SystemTime, UNIX_EPOCH};

pub mod clock;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};

pub const MS_PER_SECOND: u64 = 1_000;
pub const MS_PER_HOUR: u64 = 60 * 60 * MS_PER_SECOND;
pub const MS_PER_DAY: u64 = 24 * MS_PER_HOUR;

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Zero-padded rendering of an epoch timestamp so that lexicographic key
/// order matches numeric order.
pub fn sortable_ts(ts_ms: u64) -> String {
    format!("{ts_ms:020}")
}
