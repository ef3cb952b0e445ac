use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current unix timestamp in seconds.
#[inline]
pub fn timestamp_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs() as i64
}

/// Returns the current unix timestamp in milliseconds, used for resend
/// timers and timeout bookkeeping where second resolution is too coarse.
#[inline]
pub fn timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as i64
}
