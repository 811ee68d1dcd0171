//! Serial GPRMC whole-second reference poller (`spec.md` §4.10): reads
//! `$GPRMC` sentences from a GPS receiver and compares the sentence's UTC
//! time of day against the host clock, writing the integer-second
//! discrepancy to a shared `ConsensusWord` only after a second reading
//! confirms it (debounce). Grounded on
//! `original_source/client/pps-serial.cpp`'s `getGPSMessage`/
//! `doSerialTimeCheck` (`$GPRMC` scan, `sscanf` field layout, confirm-before-
//! commit loop); `serialport` is new to this repo since the teacher has no
//! serial I/O precedent.

use super::ConsensusWord;
use anyhow::{anyhow, Context, Result};
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BAUD_RATE: u32 = 4800;
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct SerialPoller {
    port_path: String,
}

impl SerialPoller {
    pub fn new(port_path: impl Into<String>) -> Self {
        SerialPoller {
            port_path: port_path.into(),
        }
    }

    fn open(&self) -> Result<BufReader<Box<dyn serialport::SerialPort>>> {
        let port = serialport::new(&self.port_path, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()
            .with_context(|| format!("opening serial port {}", self.port_path))?;
        Ok(BufReader::new(port))
    }

    /// Reads lines until a `$GPRMC` sentence is found or the port goes
    /// quiet, returning the parsed UTC seconds-of-day field.
    fn read_gprmc_seconds(reader: &mut impl BufRead) -> Result<u32> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                return Err(anyhow!("serial port closed before a GPRMC sentence arrived"));
            }
            if let Some(secs) = parse_gprmc_utc_seconds(&line) {
                return Ok(secs);
            }
        }
    }

    /// Polls once, verifying any nonzero discrepancy with a second reading
    /// before returning it, matching the source's confirm-before-commit
    /// behavior.
    pub fn poll_round(&self, host_utc_seconds_of_day: impl Fn() -> u32) -> Result<i32> {
        let mut reader = self.open()?;
        let first = Self::read_gprmc_seconds(&mut reader)? as i64;
        let discrepancy = first - host_utc_seconds_of_day() as i64;
        if discrepancy == 0 {
            return Ok(0);
        }
        let second = Self::read_gprmc_seconds(&mut reader)? as i64;
        let confirm = second - host_utc_seconds_of_day() as i64;
        if confirm == discrepancy {
            Ok(discrepancy as i32)
        } else {
            Ok(0)
        }
    }

    pub fn spawn(
        self,
        consensus: ConsensusWord,
        exit: Arc<AtomicBool>,
        host_utc_seconds_of_day: impl Fn() -> u32 + Send + 'static,
    ) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("pps-serial".to_string())
            .stack_size(16 * 1024)
            .spawn(move || {
                while !exit.load(Ordering::Relaxed) {
                    match self.poll_round(&host_utc_seconds_of_day) {
                        Ok(offset) if offset != 0 => consensus.set(offset),
                        Ok(_) => {}
                        Err(e) => log::warn!("pps-serial: {e:#}"),
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            })
            .expect("spawning serial poller thread")
    }
}

/// Parses the UTC time-of-day (seconds since midnight) out of a `$GPRMC`
/// sentence's `hhmmss.sss` field:
/// `$GPRMC,205950.000,A,3614.5277,N,08051.3851,W,0.02,288.47,051217,,,D*75`
fn parse_gprmc_utc_seconds(line: &str) -> Option<u32> {
    let line = line.trim();
    let pos = line.find("$GPRMC")?;
    let rest = &line[pos..];
    let mut fields = rest.split(',');
    fields.next()?; // "$GPRMC"
    let time_field = fields.next()?;
    if time_field.len() < 6 {
        return None;
    }
    let hh: u32 = time_field[0..2].parse().ok()?;
    let mm: u32 = time_field[2..4].parse().ok()?;
    let ss: u32 = time_field[4..6].parse().ok()?;
    if hh > 23 || mm > 59 || ss > 59 {
        return None;
    }
    Some(hh * 3600 + mm * 60 + ss)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_time_of_day_from_a_gprmc_sentence() {
        let line = "$GPRMC,205950.000,A,3614.5277,N,08051.3851,W,0.02,288.47,051217, ,,D*75";
        assert_eq!(parse_gprmc_utc_seconds(line), Some(20 * 3600 + 59 * 60 + 50));
    }

    #[test]
    fn ignores_non_gprmc_sentences() {
        let line = "$GPGSV,3,1,11,10,63,137,17,07,61,098,15*70";
        assert_eq!(parse_gprmc_utc_seconds(line), None);
    }

    #[test]
    fn rejects_malformed_time_field() {
        let line = "$GPRMC,,A,,,,,,,,,,*";
        assert_eq!(parse_gprmc_utc_seconds(line), None);
    }

    #[test]
    fn debounced_poll_commits_only_when_two_readings_agree() {
        let data = b"$GPRMC,120001.000,A,,,,,,,,,,*\n$GPRMC,120002.000,A,,,,,,,,,,*\n".to_vec();
        let mut reader = std::io::BufReader::new(&data[..]);
        let first = SerialPoller::read_gprmc_seconds(&mut reader).unwrap();
        assert_eq!(first, 12 * 3600 + 1);
        let second = SerialPoller::read_gprmc_seconds(&mut reader).unwrap();
        assert_eq!(second, 12 * 3600 + 2);
    }
}
