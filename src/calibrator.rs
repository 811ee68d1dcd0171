//! Loopback self-calibration (`spec.md` §4.6): drives an output GPIO wired
//! back to an input GPIO and times the round trip to estimate the constant
//! portion of interrupt-service latency (`system_delay`). Grounded on
//! `getInterruptDelay()`/`detectIntrptDelaySpike()`/`removeIntrptNoise()` in
//! the original controller — kept as an independent spike-suppression path
//! with its own consecutive-spike counter, separate from the main
//! `NoisePipeline`, per the spec's explicit separation.

use crate::driver::LoopbackCapture;

const HARD_LIMIT_4: i32 = 4;
const MAX_SPIKES: i32 = 30;
const ONE_MINUTE_WEIGHT: f64 = 1.0 / 60.0;

/// Same bin layout as the noise pipeline's raw-error histogram
/// (`noise::ERROR_DISTRIB_LEN`), applied here to `intrpt_error` instead, for
/// the `-s intrptError` CLI dump.
const DISTRIB_LEN: usize = 121;
const DISTRIB_ZERO: usize = 20;
const DISTRIB_DECAY: f64 = 0.98851;

pub struct Calibrator {
    n_intrpt_delay_spikes: i32,
    delay_median: f64,
    snapped_once: bool,
    intrpt_error_distrib: Vec<f64>,
    distrib_sample_count: u64,
}

impl Calibrator {
    pub fn new(initial_system_delay: i32) -> Self {
        Calibrator {
            n_intrpt_delay_spikes: 0,
            delay_median: initial_system_delay as f64,
            snapped_once: false,
            intrpt_error_distrib: vec![0.0; DISTRIB_LEN],
            distrib_sample_count: 0,
        }
    }

    pub fn delay_median(&self) -> f64 {
        self.delay_median
    }

    pub fn distribution(&self) -> &[f64] {
        &self.intrpt_error_distrib
    }

    fn record_distribution(&mut self, intrpt_error: i32, hard_limit: i32) {
        if hard_limit != 1 {
            return;
        }
        self.distrib_sample_count += 1;
        let idx = (intrpt_error as isize + DISTRIB_ZERO as isize)
            .clamp(0, DISTRIB_LEN as isize - 1) as usize;
        self.intrpt_error_distrib[idx] += 1.0;
        if self.distrib_sample_count > 600 && self.distrib_sample_count % 60 == 0 {
            for bin in self.intrpt_error_distrib.iter_mut() {
                *bin *= DISTRIB_DECAY;
            }
        }
    }

    fn detect_spike(&mut self, intrpt_error: i32, hard_limit: i32, noise_level: i32) -> bool {
        if hard_limit <= HARD_LIMIT_4 && intrpt_error >= noise_level {
            if self.n_intrpt_delay_spikes < MAX_SPIKES {
                self.n_intrpt_delay_spikes += 1;
                return true;
            }
            return false;
        }
        self.n_intrpt_delay_spikes = 0;
        false
    }

    fn clamp(intrpt_error: i32, hard_limit: i32) -> i32 {
        intrpt_error.clamp(-hard_limit, hard_limit)
    }

    /// Processes one loopback round trip and returns the updated
    /// `system_delay` (µs), rounded from the exponentially-smoothed
    /// `delay_median`. The spike check runs first: a second classified as a
    /// spike never reaches the one-time `delay_median` snap, so spike-
    /// contaminated samples can't corrupt the startup acquisition of
    /// `system_delay`.
    pub fn process(
        &mut self,
        capture: &LoopbackCapture,
        system_delay: i32,
        hard_limit: i32,
        noise_level: i32,
    ) -> i32 {
        let intrpt_delay = capture.tm[5] - capture.tm[3];
        let intrpt_error = intrpt_delay - system_delay;
        self.record_distribution(intrpt_error, hard_limit);

        if self.detect_spike(intrpt_error, hard_limit, noise_level) {
            return self.delay_median.round() as i32;
        }

        if !self.snapped_once && hard_limit <= HARD_LIMIT_4 {
            self.snapped_once = true;
            self.delay_median = intrpt_delay as f64;
        }

        let zero_error = Self::clamp(intrpt_error, hard_limit);
        self.delay_median += zero_error as f64 * ONE_MINUTE_WEIGHT;
        self.delay_median.round() as i32
    }
}
