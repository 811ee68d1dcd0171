//! Loop pacer: computes the sleep duration so the next blocking await-edge
//! call is already pending roughly 150 µs before the PPS edge arrives.
//! Grounded on `setSyncDelay()` in the original controller.

use std::time::Duration;

const USECS_PER_SEC: i64 = 1_000_000;

/// Offset (µs) applied before the expected edge: ~50µs wake-from-sleep
/// latency plus ~100µs of interrupt recognition latency (`spec.md` §4.8).
pub const SYNC_DELAY_US: i64 = -150;

/// Given the current fractional-second microseconds of the host clock,
/// returns how long to sleep before re-entering the blocking edge read.
pub fn sleep_duration(current_frac_usec: i64) -> Duration {
    let mut timer_val = USECS_PER_SEC + SYNC_DELAY_US - current_frac_usec;
    if timer_val >= USECS_PER_SEC {
        timer_val -= USECS_PER_SEC;
        return Duration::from_secs(1) + Duration::from_micros(timer_val as u64);
    }
    if timer_val < 0 {
        timer_val += USECS_PER_SEC;
    }
    Duration::from_micros(timer_val as u64)
}
