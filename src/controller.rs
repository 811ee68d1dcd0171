//! Clock discipline controller: the closed loop that turns one PPS edge per
//! second into an offset correction and, once a minute, a frequency trim.
//! Owns the noise pipeline, the rolling correction FIFO, the ten lifetime
//! per-minute-second integral accumulators, the calibrator, and the
//! Startup/Acquiring/Locked state machine with restart-on-divergence.
//! Grounded on the teacher
//! `PtpController`'s one-struct-per-process-one-entry-point-per-edge shape
//! (`src/controller.rs`), with the ACQ/PROD/NANO phase logic and PTP packet
//! handling replaced by the gains and state transitions in `pps-client.cpp`/
//! `pps-client.h`.

use crate::calibrator::Calibrator;
use crate::clock::ClockAdjust;
use crate::driver::{CaptureDriver, EdgeCapture};
use crate::noise::NoisePipeline;
use crate::ringbuffer::SumRing;
use crate::status::{DaemonStatus, RecordStore};
use anyhow::{Context, Result};

const INV_GAIN_0: i32 = 4;
const INV_GAIN_1: i32 = 1;
const INTEGRAL_GAIN: f64 = 0.63212;
const SLEW_MAX: f64 = 65.0;
const INITIAL_SYSTEM_DELAY: i32 = 6;

const LOSS_WARN_THRESHOLD: u32 = 15;
const LOSS_EXIT_THRESHOLD: u32 = 3600;

/// Outcome of a single edge-processing cycle.
pub struct EdgeOutcome {
    pub status: DaemonStatus,
    pub restarted: bool,
}

/// Disposition of a missed edge, returned by `record_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossAction {
    Continue,
    Warn,
    ExitRequested,
}

pub struct Controller {
    seq_num: u64,
    active_count: u32,
    is_acquiring: bool,
    slew_is_low: bool,
    inv_proportional_gain: i32,

    noise: NoisePipeline,

    system_delay: i32,
    calibrator: Calibrator,
    calibrate_enabled: bool,

    correction_fifo: SumRing<60>,
    fifo_pos: usize,
    avg_correction: f64,

    integral: [f64; 10],
    avg_integral: f64,
    integral_count: u32,
    last_freq_offset_ppm: f64,

    loss_count: u32,

    records: RecordStore,
}

impl Controller {
    pub fn new(calibrate_enabled: bool) -> Self {
        Controller {
            seq_num: 0,
            active_count: 0,
            is_acquiring: false,
            slew_is_low: false,
            inv_proportional_gain: INV_GAIN_0,
            noise: NoisePipeline::new(),
            system_delay: INITIAL_SYSTEM_DELAY,
            calibrator: Calibrator::new(INITIAL_SYSTEM_DELAY),
            calibrate_enabled,
            correction_fifo: SumRing::new(),
            fifo_pos: 0,
            avg_correction: 0.0,
            integral: [0.0; 10],
            avg_integral: 0.0,
            integral_count: 0,
            last_freq_offset_ppm: 0.0,
            loss_count: 0,
            records: RecordStore::new(),
        }
    }

    pub fn seq_num(&self) -> u64 {
        self.seq_num
    }

    pub fn is_acquiring(&self) -> bool {
        self.is_acquiring
    }

    pub fn hard_limit(&self) -> i32 {
        self.noise.hard_limit
    }

    pub fn system_delay(&self) -> i32 {
        self.system_delay
    }

    pub fn noise_level(&self) -> i32 {
        self.noise.noise_level
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// The `-s rawError` CLI dump source: the noise pipeline's decaying
    /// raw-error histogram.
    pub fn raw_error_distribution(&self) -> &[f64] {
        self.noise.distribution()
    }

    /// The `-s intrptError` CLI dump source: the calibrator's decaying
    /// interrupt-delay-error histogram.
    pub fn intrpt_error_distribution(&self) -> &[f64] {
        self.calibrator.distribution()
    }

    /// Applies config-driven settings on a reload (startup or post-restart
    /// re-read); currently only the calibration toggle affects the core
    /// loop's behavior.
    pub fn set_calibrate_enabled(&mut self, enabled: bool) {
        self.calibrate_enabled = enabled;
    }

    /// Call once per missed edge. Resets on the next successful
    /// `process_edge` call.
    pub fn record_timeout(&mut self) -> LossAction {
        self.loss_count += 1;
        if self.loss_count >= LOSS_EXIT_THRESHOLD {
            LossAction::ExitRequested
        } else if self.loss_count >= LOSS_WARN_THRESHOLD {
            LossAction::Warn
        } else {
            LossAction::Continue
        }
    }

    /// Processes one PPS edge end to end: whole-second correction, noise
    /// suppression, offset adjustment, frequency submission at minute
    /// boundaries, state-machine transitions, divergence/restart check, and
    /// (when due) a loopback calibration round trip. `consensus_time_error`
    /// is the out-of-band whole-second correction observed by the caller
    /// this second (0 if none); `timestamp` is the pre-formatted wall-clock
    /// string for the status line.
    pub fn process_edge(
        &mut self,
        capture: EdgeCapture,
        timestamp: String,
        driver: &mut dyn CaptureDriver,
        clock: &mut dyn ClockAdjust,
        consensus_time_error: i32,
    ) -> Result<EdgeOutcome> {
        self.loss_count = 0;
        self.seq_num += 1;

        if consensus_time_error != 0 {
            driver
                .inject_whole_second(consensus_time_error)
                .context("injecting whole-second correction")?;
        }

        let captured_usec = capture.tv_usec;
        let interrupt_time = if captured_usec <= 500_000 {
            captured_usec
        } else {
            captured_usec - 1_000_000
        };
        let raw_error = interrupt_time - self.system_delay;

        let (zero_error, is_spike) =
            self.noise
                .remove_noise(raw_error, self.active_count, self.avg_correction.abs());

        let time_correction = if is_spike {
            0
        } else {
            -zero_error / self.inv_proportional_gain
        };
        clock
            .adjust_offset(time_correction)
            .context("applying offset correction")?;

        if !is_spike {
            self.on_non_spike_second(time_correction);
            self.maybe_submit_frequency(clock)?;
            self.update_state_machine();
        }

        let restarted = self.maybe_restart(clock)?;

        if !restarted && self.calibrate_enabled && self.noise.hard_limit == 1 {
            std::thread::sleep(std::time::Duration::from_micros(100));
            let loopback = driver
                .request_loopback()
                .context("requesting loopback calibration")?;
            self.system_delay = self.calibrator.process(
                &loopback,
                self.system_delay,
                self.noise.hard_limit,
                self.noise.noise_level,
            );
        }

        self.records
            .record_offset(self.seq_num, zero_error, self.last_freq_offset_ppm);
        self.records
            .maybe_record_5min(capture.tv_sec.max(0) as u64, self.last_freq_offset_ppm, 0.0);

        let status = DaemonStatus {
            timestamp,
            seq_num: self.seq_num,
            is_delay_spike: is_spike,
            jitter_us: zero_error,
            freq_offset_ppm: self.last_freq_offset_ppm,
            avg_correction: self.avg_correction,
            clamp: self.noise.hard_limit,
        };

        Ok(EdgeOutcome { status, restarted })
    }

    fn on_non_spike_second(&mut self, time_correction: i32) {
        self.correction_fifo.push(time_correction);
        self.avg_correction = self.correction_fifo.average();

        if self.is_acquiring {
            self.active_count += 1;
        }

        if self.fifo_pos >= 50 {
            let i = self.fifo_pos - 50;
            if i == 0 {
                self.avg_integral = 0.0;
                self.integral_count = 0;
            }

            self.integral[i] += self.avg_correction;
            if self.noise.hard_limit == 1 {
                self.avg_integral += self.integral[i];
                self.integral_count += 1;
            }

            if self.fifo_pos == 59 && self.integral_count == 10 {
                self.avg_integral /= 10.0;
            }
        }

        self.fifo_pos += 1;
        if self.fifo_pos == 60 {
            self.fifo_pos = 0;
        }
    }

    /// Runs only on the second the FIFO wraps back to position 0 (the
    /// minute boundary). `integral[i]` is a lifetime accumulator for the
    /// minute-second offset `i` (the last ten seconds of every minute each
    /// add their `avg_correction` into their own slot); it is never reset
    /// except on a full controller reinit. Selects `avg_integral` (this
    /// minute's own ten-slot average, built while `hard_limit == 1`
    /// throughout) when available, else falls back to the single stored
    /// `integral[9]`.
    fn maybe_submit_frequency(&mut self, clock: &mut dyn ClockAdjust) -> Result<()> {
        if self.fifo_pos != 0 {
            return Ok(());
        }

        self.noise.set_delay_trackers(self.system_delay);

        let selected = if self.noise.hard_limit == 1 && self.integral_count == 10 {
            self.avg_integral
        } else {
            self.integral[9]
        };

        if !self.is_acquiring {
            return Ok(());
        }

        let freq_offset = selected * INTEGRAL_GAIN;
        clock
            .adjust_frequency(freq_offset)
            .context("submitting frequency correction")?;
        self.last_freq_offset_ppm = freq_offset;
        Ok(())
    }

    fn update_state_machine(&mut self) {
        if !self.slew_is_low && self.noise.slew_updated && self.noise.avg_slew.abs() < SLEW_MAX {
            self.slew_is_low = true;
        }

        if !self.is_acquiring && self.slew_is_low && self.seq_num >= 60 {
            self.is_acquiring = true;
            log::info!("pps: controller entering Acquiring at seq {}", self.seq_num);
        }

        self.inv_proportional_gain = if self.is_acquiring {
            INV_GAIN_1
        } else {
            INV_GAIN_0
        };
    }

    fn maybe_restart(&mut self, clock: &mut dyn ClockAdjust) -> Result<bool> {
        let stuck_in_startup = !self.is_acquiring && self.seq_num >= 60;
        let diverged_while_acquiring = self.is_acquiring
            && self.noise.hard_limit > 1024
            && self.noise.avg_slew.abs() > SLEW_MAX;

        if !(stuck_in_startup || diverged_while_acquiring) {
            return Ok(false);
        }

        log::warn!(
            "pps: controller restarting after divergence at seq {}",
            self.seq_num
        );
        clock
            .adjust_frequency(0.0)
            .context("zeroing frequency offset on restart")?;
        self.reinit();
        Ok(true)
    }

    fn reinit(&mut self) {
        self.active_count = 0;
        self.is_acquiring = false;
        self.slew_is_low = false;
        self.inv_proportional_gain = INV_GAIN_0;
        self.noise = NoisePipeline::new();
        self.correction_fifo = SumRing::new();
        self.fifo_pos = 0;
        self.avg_correction = 0.0;
        self.integral = [0.0; 10];
        self.avg_integral = 0.0;
        self.integral_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClockAdjust;
    use crate::driver::{LoopbackCapture, MockCaptureDriver};

    fn edge(tv_usec: i32) -> EdgeCapture {
        EdgeCapture {
            tv_sec: 1_700_000_000,
            tv_usec,
        }
    }

    fn run_seconds(
        ctrl: &mut Controller,
        driver: &mut dyn CaptureDriver,
        clock: &mut dyn ClockAdjust,
        tv_usec: i32,
        count: usize,
    ) {
        for _ in 0..count {
            ctrl.process_edge(edge(tv_usec), String::new(), driver, clock, 0)
                .unwrap();
        }
    }

    #[test]
    fn fifo_running_sum_matches_average_once_full() {
        let mut ctrl = Controller::new(false);
        let mut driver = MockCaptureDriver::new();
        let mut clock = MockClockAdjust::new();
        clock.expect_adjust_offset().returning(|_| Ok(()));
        clock.expect_adjust_frequency().returning(|_| Ok(()));
        driver.expect_inject_whole_second().returning(|_| Ok(()));

        run_seconds(&mut ctrl, &mut driver, &mut clock, 300, 60);

        assert_eq!(
            ctrl.avg_correction,
            ctrl.correction_fifo.sum as f64 / 60.0
        );
    }

    #[test]
    fn hard_limit_is_always_a_power_of_two() {
        let mut ctrl = Controller::new(false);
        let mut driver = MockCaptureDriver::new();
        let mut clock = MockClockAdjust::new();
        clock.expect_adjust_offset().returning(|_| Ok(()));
        clock.expect_adjust_frequency().returning(|_| Ok(()));

        run_seconds(&mut ctrl, &mut driver, &mut clock, 10, 200);

        let hl = ctrl.hard_limit();
        assert!(hl >= 1 && hl <= 32768 && (hl & (hl - 1)) == 0);
    }

    #[test]
    fn hard_limit_stays_at_none_through_the_fifty_ninth_edge() {
        let mut ctrl = Controller::new(false);
        let mut driver = MockCaptureDriver::new();
        let mut clock = MockClockAdjust::new();
        clock.expect_adjust_offset().returning(|_| Ok(()));
        clock.expect_adjust_frequency().returning(|_| Ok(()));

        run_seconds(&mut ctrl, &mut driver, &mut clock, 0, 59);
        assert_eq!(ctrl.noise.hard_limit, 32768);
    }

    #[test]
    fn delay_spike_suppresses_offset_and_skips_fifo_and_frequency() {
        let mut ctrl = Controller::new(false);
        ctrl.noise.hard_limit = 1;
        ctrl.noise.noise_level = 10;

        let mut driver = MockCaptureDriver::new();
        let mut clock = MockClockAdjust::new();
        clock
            .expect_adjust_offset()
            .withf(|&tc| tc == 0)
            .times(1)
            .returning(|_| Ok(()));
        clock.expect_adjust_frequency().times(0);

        let outcome = ctrl
            .process_edge(edge(150), String::new(), &mut driver, &mut clock, 0)
            .unwrap();
        assert!(outcome.status.is_delay_spike);
        assert_eq!(outcome.status.jitter_us, 0);
        assert_eq!(ctrl.correction_fifo.sum, 0);
    }

    #[test]
    fn spike_counter_caps_at_thirty_then_stops_suppressing() {
        let mut ctrl = Controller::new(false);
        ctrl.noise.hard_limit = 1;
        ctrl.noise.noise_level = 10;

        let mut driver = MockCaptureDriver::new();
        let mut clock = MockClockAdjust::new();
        clock.expect_adjust_offset().returning(|_| Ok(()));
        clock.expect_adjust_frequency().returning(|_| Ok(()));

        let mut last_is_spike = false;
        for _ in 0..31 {
            let outcome = ctrl
                .process_edge(edge(150), String::new(), &mut driver, &mut clock, 0)
                .unwrap();
            last_is_spike = outcome.status.is_delay_spike;
        }
        // the 31st consecutive above-threshold sample is no longer suppressed
        assert!(!last_is_spike);
    }

    #[test]
    fn frequency_adjust_never_issued_before_acquiring() {
        let mut ctrl = Controller::new(false);
        let mut driver = MockCaptureDriver::new();
        let mut clock = MockClockAdjust::new();
        clock.expect_adjust_offset().returning(|_| Ok(()));
        clock.expect_adjust_frequency().times(0);

        run_seconds(&mut ctrl, &mut driver, &mut clock, 0, 59);
        assert!(!ctrl.is_acquiring());
    }

    #[test]
    fn whole_second_correction_precedes_offset_adjustment() {
        let mut ctrl = Controller::new(false);
        let mut driver = MockCaptureDriver::new();
        let mut clock = MockClockAdjust::new();

        driver
            .expect_inject_whole_second()
            .withf(|&s| s == 1)
            .times(1)
            .returning(|_| Ok(()));
        clock.expect_adjust_offset().returning(|_| Ok(()));

        ctrl.process_edge(edge(0), String::new(), &mut driver, &mut clock, 1)
            .unwrap();
    }

    #[test]
    fn restart_resets_hard_limit_and_acquiring_but_keeps_seq_num() {
        let mut ctrl = Controller::new(false);
        ctrl.is_acquiring = true;
        ctrl.noise.hard_limit = 2048;
        ctrl.noise.avg_slew = 100.0;
        ctrl.seq_num = 500;

        let mut driver = MockCaptureDriver::new();
        let mut clock = MockClockAdjust::new();
        clock.expect_adjust_offset().returning(|_| Ok(()));
        clock.expect_adjust_frequency().returning(|_| Ok(()));

        let outcome = ctrl
            .process_edge(edge(0), String::new(), &mut driver, &mut clock, 0)
            .unwrap();

        assert!(outcome.restarted);
        assert!(!ctrl.is_acquiring());
        assert_eq!(ctrl.hard_limit(), 32768);
        assert_eq!(ctrl.seq_num(), 501);
    }

    #[test]
    fn calibrator_snaps_system_delay_on_first_low_hard_limit_second() {
        let mut ctrl = Controller::new(true);
        ctrl.noise.hard_limit = 1;

        let mut driver = MockCaptureDriver::new();
        driver.expect_request_loopback().times(1).returning(|| {
            Ok(LoopbackCapture {
                tm: [0, 0, 0, 0, 0, 20],
            })
        });
        let mut clock = MockClockAdjust::new();
        clock.expect_adjust_offset().returning(|_| Ok(()));

        ctrl.process_edge(edge(0), String::new(), &mut driver, &mut clock, 0)
            .unwrap();

        assert_eq!(ctrl.system_delay(), 20);
    }

    #[test]
    fn loss_counter_escalates_at_spec_thresholds() {
        let mut ctrl = Controller::new(false);
        let mut last = LossAction::Continue;
        for _ in 0..15 {
            last = ctrl.record_timeout();
        }
        assert_eq!(last, LossAction::Warn);
    }
}
