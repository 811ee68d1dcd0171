//! Status/record emitter (`spec.md` §4.9/§6): per-second status line written
//! to a shared status file, plus the circular record buffers consulted by
//! the `-s <label>` CLI dump. Grounded on the teacher `SyncStatus`
//! serde/`Default` shape, restructured to the PPS field set; ring-buffer
//! bookkeeping follows `spec.md` §3's record buffer table.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

pub const STATUS_FILE: &str = "/run/shm/pps-display-params";
pub const TIMESTAMP_FILE: &str = "/run/shm/pps-assert";
pub const SYSDELAY_FILE: &str = "/run/shm/pps-sysDelay";

const OFFSET_REC_LEN: usize = 600;
const FIVE_MIN_REC_LEN: usize = 288;
const SECS_PER_5_MIN: u64 = 300;

/// Live per-second status, shared with the `-v` CLI viewer.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonStatus {
    pub timestamp: String,
    pub seq_num: u64,
    pub is_delay_spike: bool,
    pub jitter_us: i32,
    pub freq_offset_ppm: f64,
    pub avg_correction: f64,
    pub clamp: i32,
}

impl Default for DaemonStatus {
    fn default() -> Self {
        DaemonStatus {
            timestamp: String::new(),
            seq_num: 0,
            is_delay_spike: false,
            jitter_us: 0,
            freq_offset_ppm: 0.0,
            avg_correction: 0.0,
            clamp: 32768,
        }
    }
}

impl DaemonStatus {
    /// Formats the exact status line from `spec.md` §6:
    /// `YYYY-MM-DD HH:MM:SS.ffffff  <seq>  [*]jitter: <µs>  freqOffset: <ppm>  avgCorrection: <µs>  clamp: <pow2>`
    pub fn format_line(&self) -> String {
        let marker = if self.is_delay_spike { "*" } else { "" };
        format!(
            "{}  {}  {}jitter: {}  freqOffset: {:.6}  avgCorrection: {:.3}  clamp: {}",
            self.timestamp,
            self.seq_num,
            marker,
            self.jitter_us,
            self.freq_offset_ppm,
            self.avg_correction,
            self.clamp
        )
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("opening status file {}", path.display()))?;
        writeln!(f, "{}", self.format_line())?;
        Ok(())
    }
}

/// Named record buffers exposed via the `-s <label>` CLI surface
/// (`spec.md` §6): `rawError` and `intrptError` are the noise-pipeline and
/// calibrator distributions respectively; `frequency-vars` and
/// `pps-offsets` are the per-second/per-5-minute ring buffers below.
pub struct RecordStore {
    idx_60s: usize,
    pub offset_rec: [i32; OFFSET_REC_LEN],
    pub freq_offset_rec2: [f64; OFFSET_REC_LEN],
    pub seq_num_rec: [u64; OFFSET_REC_LEN],

    idx_5min: usize,
    last_5min_tick: u64,
    pub freq_offset_rec: [f64; FIVE_MIN_REC_LEN],
    pub freq_allan_dev: [f64; FIVE_MIN_REC_LEN],
    pub timestamp_rec: [i64; FIVE_MIN_REC_LEN],
}

impl RecordStore {
    pub fn new() -> Self {
        RecordStore {
            idx_60s: 0,
            offset_rec: [0; OFFSET_REC_LEN],
            freq_offset_rec2: [0.0; OFFSET_REC_LEN],
            seq_num_rec: [0; OFFSET_REC_LEN],
            idx_5min: 0,
            last_5min_tick: 0,
            freq_offset_rec: [0.0; FIVE_MIN_REC_LEN],
            freq_allan_dev: [0.0; FIVE_MIN_REC_LEN],
            timestamp_rec: [0; FIVE_MIN_REC_LEN],
        }
    }

    /// Records one second's offset correction, indexed mod 600.
    pub fn record_offset(&mut self, seq_num: u64, time_correction: i32, freq_offset_ppm: f64) {
        let i = self.idx_60s % OFFSET_REC_LEN;
        self.offset_rec[i] = time_correction;
        self.freq_offset_rec2[i] = freq_offset_ppm;
        self.seq_num_rec[i] = seq_num;
        self.idx_60s += 1;
    }

    /// Records a 5-minute frequency slot if at least 300 seconds have
    /// elapsed since the last slot, for the 24-hour Allan-deviation export.
    pub fn maybe_record_5min(&mut self, unix_secs: u64, freq_offset_ppm: f64, allan_dev: f64) {
        if self.last_5min_tick != 0 && unix_secs - self.last_5min_tick < SECS_PER_5_MIN {
            return;
        }
        self.last_5min_tick = unix_secs;
        let i = self.idx_5min % FIVE_MIN_REC_LEN;
        self.freq_offset_rec[i] = freq_offset_ppm;
        self.freq_allan_dev[i] = allan_dev;
        self.timestamp_rec[i] = unix_secs as i64;
        self.idx_5min += 1;
    }

    pub fn dump_pps_offsets(&self) -> String {
        let mut out = String::new();
        for i in 0..OFFSET_REC_LEN {
            out.push_str(&format!(
                "{} {} {}\n",
                self.seq_num_rec[i], self.offset_rec[i], self.freq_offset_rec2[i]
            ));
        }
        out
    }

    pub fn dump_frequency_vars(&self) -> String {
        let mut out = String::new();
        for i in 0..FIVE_MIN_REC_LEN {
            out.push_str(&format!(
                "{} {} {}\n",
                self.timestamp_rec[i], self.freq_offset_rec[i], self.freq_allan_dev[i]
            ));
        }
        out
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}
