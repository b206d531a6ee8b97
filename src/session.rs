use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global counter for generating unique session IDs
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique session ID for one accepted connection.
///
/// The ID combines the lower 48 bits of the current nanosecond timestamp with
/// a monotonic counter, giving a compact lowercase-hex token that stays unique
/// under high accept rates. It only exists to correlate log lines and spans
/// belonging to the same tunnel.
pub fn new_session_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);

    format!(
        "{:x}{:x}",
        now.as_nanos() & 0xffffffffffff,
        counter & 0xffffffff
    )
}
