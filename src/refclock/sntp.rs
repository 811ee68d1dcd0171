//! SNTP whole-second reference poller (`spec.md` §4.10): queries up to
//! `MAX_SERVERS` time servers roughly every `CHECK_TIME` seconds and takes
//! the mode of their integer-second offsets, writing the result to a shared
//! `ConsensusWord`. Grounded on the teacher `NtpClient`'s `rsntp` usage
//! (`src/ntp.rs`), extended from a single server to a multi-server mode
//! vote per `original_source/client/pps-sntp.cpp`'s `allocNTPServerList`
//! default server set.

use super::ConsensusWord;
use rsntp::SntpClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const MAX_SERVERS: usize = 4;

/// ~17 minutes between polling rounds, matching the source's `CHECK_TIME`.
pub const CHECK_TIME: Duration = Duration::from_secs(1024);

pub const DEFAULT_SERVERS: [&str; MAX_SERVERS] = [
    "0.debian.pool.ntp.org",
    "1.debian.pool.ntp.org",
    "2.debian.pool.ntp.org",
    "3.debian.pool.ntp.org",
];

pub struct SntpPoller {
    servers: Vec<String>,
}

impl SntpPoller {
    pub fn new(servers: Vec<String>) -> Self {
        SntpPoller { servers }
    }

    pub fn with_default_servers() -> Self {
        Self::new(DEFAULT_SERVERS.iter().map(|s| s.to_string()).collect())
    }

    fn query_one(server: &str) -> Option<i32> {
        let client = SntpClient::new();
        let result = client.synchronize(server).ok()?;
        let offset = result.clock_offset().as_secs_f64();
        Some(offset.round() as i32)
    }

    fn poll_round(&self) -> Option<i32> {
        let offsets: Vec<i32> = self
            .servers
            .iter()
            .filter_map(|s| Self::query_one(s))
            .collect();
        mode_of_offsets(&offsets)
    }

    /// Spawns a detached polling thread that writes `consensus` whenever a
    /// round's mode offset is nonzero. Runs until `exit` is set.
    pub fn spawn(self, consensus: ConsensusWord, exit: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("pps-sntp".to_string())
            .stack_size(16 * 1024)
            .spawn(move || {
                while !exit.load(Ordering::Relaxed) {
                    if let Some(offset) = self.poll_round() {
                        if offset != 0 {
                            consensus.set(offset);
                        }
                    }
                    sleep_in_slices(CHECK_TIME, &exit);
                }
            })
            .expect("spawning sntp poller thread")
    }
}

/// Sleeps in one-second slices so `exit` is noticed promptly rather than at
/// the end of a 17-minute sleep.
fn sleep_in_slices(total: Duration, exit: &Arc<AtomicBool>) {
    let mut remaining = total;
    let slice = Duration::from_secs(1);
    while remaining > Duration::ZERO {
        if exit.load(Ordering::Relaxed) {
            return;
        }
        let step = slice.min(remaining);
        std::thread::sleep(step);
        remaining -= step;
    }
}

/// Returns the most frequent value in `offsets`, preferring the smallest
/// magnitude to break ties; `None` if `offsets` is empty.
fn mode_of_offsets(offsets: &[i32]) -> Option<i32> {
    if offsets.is_empty() {
        return None;
    }
    let mut counts: Vec<(i32, u32)> = Vec::new();
    for &v in offsets {
        if let Some(entry) = counts.iter_mut().find(|(val, _)| *val == v) {
            entry.1 += 1;
        } else {
            counts.push((v, 1));
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.abs().cmp(&b.0.abs())));
    counts.first().map(|(v, _)| *v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_picks_the_most_common_offset() {
        assert_eq!(mode_of_offsets(&[1, 1, 0, 1]), Some(1));
    }

    #[test]
    fn mode_breaks_ties_toward_smaller_magnitude() {
        assert_eq!(mode_of_offsets(&[1, -1]), Some(1));
        assert_eq!(mode_of_offsets(&[3, -3, 3, -3]), Some(3));
    }

    #[test]
    fn mode_of_empty_list_is_none() {
        assert_eq!(mode_of_offsets(&[]), None);
    }

    #[test]
    fn mode_with_all_zero_offsets_is_zero() {
        assert_eq!(mode_of_offsets(&[0, 0, 0]), Some(0));
    }
}
