// Absolute epoch-millisecond expiry arithmetic; `0` is the never-expires sentinel.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) const NEVER: i64 = 0;

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(saturating_millis)
        .unwrap_or_default()
}

fn saturating_millis(elapsed: Duration) -> i64 {
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

/// Absolute expiry for a row written now; a zero ttl never expires.
pub(crate) fn expires_at(ttl: Duration) -> i64 {
    expires_at_from(now_millis(), ttl)
}

pub(crate) fn expires_at_from(now: i64, ttl: Duration) -> i64 {
    if ttl.is_zero() {
        return NEVER;
    }
    now.saturating_add(saturating_millis(ttl).max(1))
}

pub(crate) fn is_live(expires_at: i64, now: i64) -> bool {
    expires_at == NEVER || expires_at > now
}

/// SQL fragment matching live rows; binds the current time as `?{param}`.
pub(crate) fn live_predicate(param: usize) -> String {
    format!("(expires_at = 0 OR expires_at > ?{param})")
}
