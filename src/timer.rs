//! Clocks for the sampling loops.
//!
//! Sample intervals are measured with the monotonic clock ([`now_nsec`]);
//! the optional per-line timestamps use the wall clock.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since the first call in this process.
///
/// Only deltas are meaningful.
#[inline]
pub fn now_nsec() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Wall-clock seconds since the Unix epoch, as a float with µs precision.
pub fn unix_seconds() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(_) => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::now_nsec;

    #[test]
    fn monotonic() {
        let a = now_nsec();
        let b = now_nsec();
        assert!(b >= a);
    }
}
