//! Noise suppression pipeline: delay-spike detection, slew tracking, the
//! adaptive power-of-two clamp, and final jitter clamping. Grounded on
//! `removeNoise()`/`detectDelaySpike()`/`getTimeSlew()`/`setHardLimit()`/
//! `clampJitter()` in the original controller.

const NOISE_FACTOR: f64 = 0.354;
const NOISE_LEVEL_MIN: i32 = 4;
const SLEW_LEN: u32 = 10;
const SLEW_MAX: f64 = 65.0;
const MAX_SPIKES: i32 = 30;

const HARD_LIMIT_NONE: i32 = 32768;
const HARD_LIMIT_4: i32 = 4;
const HARD_LIMIT_1: i32 = 1;
const HARD_LIMIT_05: f64 = 0.5;

pub const ERROR_DISTRIB_LEN: usize = 121;
const RAW_ERROR_ZERO: usize = 20;
const RAW_ERROR_DECAY: f64 = 0.98851;

/// Mutable state of the noise pipeline, owned by the controller and updated
/// once per PPS edge.
pub struct NoisePipeline {
    pub noise_level: i32,
    pub hard_limit: i32,
    n_delay_spikes: i32,
    slew_accum: f64,
    slew_accum_cnt: u32,
    pub avg_slew: f64,
    pub slew_updated: bool,
    pub is_delay_spike: bool,
    raw_error_distrib: Vec<f64>,
    distrib_sample_count: u64,
}

impl NoisePipeline {
    pub fn new() -> Self {
        NoisePipeline {
            noise_level: NOISE_LEVEL_MIN,
            hard_limit: HARD_LIMIT_NONE,
            n_delay_spikes: 0,
            slew_accum: 0.0,
            slew_accum_cnt: 0,
            avg_slew: 0.0,
            slew_updated: false,
            is_delay_spike: false,
            raw_error_distrib: vec![0.0; ERROR_DISTRIB_LEN],
            distrib_sample_count: 0,
        }
    }

    /// Called once a minute (on `integral_is_ready()`) to retrack the noise
    /// level against the current system delay.
    pub fn set_delay_trackers(&mut self, sys_delay: i32) {
        let level = (sys_delay as f64 * NOISE_FACTOR).round() as i32 + 1;
        self.noise_level = level.max(NOISE_LEVEL_MIN);
    }

    /// Detects a continuous run of above-threshold positive jitter. Returns
    /// true (and suppresses) for up to `MAX_SPIKES` consecutive seconds, then
    /// stops suppressing even if the raw error remains above threshold,
    /// since a sustained elevation indicates a real shift rather than noise.
    fn detect_delay_spike(&mut self, raw_error: i32) -> bool {
        if self.hard_limit > HARD_LIMIT_4 {
            self.n_delay_spikes = 0;
            return false;
        }
        if raw_error >= self.noise_level {
            if self.n_delay_spikes < MAX_SPIKES {
                self.n_delay_spikes += 1;
                return true;
            }
            return false;
        }
        self.n_delay_spikes = 0;
        false
    }

    /// Accumulates `raw_error` and refreshes `avg_slew` every `SLEW_LEN`
    /// samples.
    fn get_time_slew(&mut self, raw_error: i32) {
        self.slew_accum += raw_error as f64;
        self.slew_accum_cnt += 1;
        self.slew_updated = false;
        if self.slew_accum_cnt == SLEW_LEN {
            self.avg_slew = self.slew_accum / SLEW_LEN as f64;
            self.slew_accum = 0.0;
            self.slew_accum_cnt = 0;
            self.slew_updated = true;
        }
    }

    /// Adapts `hard_limit` as a power of two with hysteresis around the
    /// running average magnitude of recent corrections.
    fn set_hard_limit(&mut self, active_count: u32, avg_median_mag: f64) {
        if active_count < 60 {
            self.hard_limit = HARD_LIMIT_NONE;
            return;
        }

        if self.avg_slew.abs() > SLEW_MAX {
            while self.hard_limit <= HARD_LIMIT_NONE / 2 && (self.hard_limit as f64) <= 4.0 * self.avg_slew.abs() {
                self.hard_limit *= 2;
            }
            if self.hard_limit > HARD_LIMIT_NONE {
                self.hard_limit = HARD_LIMIT_NONE;
            }
            return;
        }

        if self.hard_limit == HARD_LIMIT_1 && avg_median_mag > HARD_LIMIT_05 {
            self.hard_limit *= 2;
        } else if avg_median_mag < HARD_LIMIT_05 {
            self.hard_limit = HARD_LIMIT_1;
        } else if avg_median_mag < self.hard_limit as f64 / 4.0 {
            self.hard_limit /= 2;
            if self.hard_limit < HARD_LIMIT_1 {
                self.hard_limit = HARD_LIMIT_1;
            }
        } else if avg_median_mag > self.hard_limit as f64 / 2.0 {
            self.hard_limit = (self.hard_limit * 2).min(HARD_LIMIT_NONE);
        }
    }

    /// Clips `raw_error` to `[-hard_limit, hard_limit]`.
    fn clamp_jitter(&self, raw_error: i32) -> i32 {
        raw_error.clamp(-self.hard_limit, self.hard_limit)
    }

    /// Records `raw_error` into the exponentially-decaying delay-peak
    /// histogram, used only for diagnostics (the `-s error` dump); decayed
    /// roughly hourly while `hard_limit == 1`.
    fn build_raw_error_distrib(&mut self, raw_error: i32) {
        if self.hard_limit != HARD_LIMIT_1 {
            return;
        }
        self.distrib_sample_count += 1;
        let idx = (raw_error as isize + RAW_ERROR_ZERO as isize).clamp(0, ERROR_DISTRIB_LEN as isize - 1) as usize;
        self.raw_error_distrib[idx] += 1.0;
        if self.distrib_sample_count > 600 && self.distrib_sample_count % 60 == 0 {
            for bin in self.raw_error_distrib.iter_mut() {
                *bin *= RAW_ERROR_DECAY;
            }
        }
    }

    pub fn distribution(&self) -> &[f64] {
        &self.raw_error_distrib
    }

    /// Runs the full pipeline for one edge: spike detection (which, if
    /// triggered, short-circuits the rest), slew tracking, adaptive clamp,
    /// and final clamping. Returns `(zero_error, is_delay_spike)`.
    pub fn remove_noise(
        &mut self,
        raw_error: i32,
        active_count: u32,
        avg_median_mag: f64,
    ) -> (i32, bool) {
        self.build_raw_error_distrib(raw_error);

        self.is_delay_spike = self.detect_delay_spike(raw_error);
        if self.is_delay_spike {
            return (0, true);
        }

        self.get_time_slew(raw_error);
        self.set_hard_limit(active_count, avg_median_mag);
        (self.clamp_jitter(raw_error), false)
    }
}

impl Default for NoisePipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_delay_trackers_respects_minimum() {
        let mut p = NoisePipeline::new();
        p.set_delay_trackers(0);
        assert_eq!(p.noise_level, NOISE_LEVEL_MIN);
        p.set_delay_trackers(20);
        assert_eq!(p.noise_level, (20.0 * NOISE_FACTOR).round() as i32 + 1);
    }

    #[test]
    fn delay_spike_suppresses_up_to_max_spikes_then_passes_through() {
        let mut p = NoisePipeline::new();
        p.noise_level = 10;
        p.hard_limit = HARD_LIMIT_1;

        for _ in 0..MAX_SPIKES {
            assert!(p.detect_delay_spike(50));
        }
        // the 31st consecutive above-threshold sample is no longer suppressed
        assert!(!p.detect_delay_spike(50));
        // a sub-threshold sample resets the counter
        assert!(!p.detect_delay_spike(1));
        assert!(p.detect_delay_spike(50));
    }

    #[test]
    fn delay_spike_inactive_once_hard_limit_above_four() {
        let mut p = NoisePipeline::new();
        p.noise_level = 5;
        p.hard_limit = HARD_LIMIT_4 * 2;
        assert!(!p.detect_delay_spike(1000));
    }

    #[test]
    fn slew_average_updates_every_ten_samples() {
        let mut p = NoisePipeline::new();
        for _ in 0..9 {
            p.get_time_slew(10);
        }
        assert_eq!(p.avg_slew, 0.0);
        p.get_time_slew(10);
        assert_eq!(p.avg_slew, 10.0);
        assert_eq!(p.slew_accum, 0.0);
    }

    #[test]
    fn hard_limit_stays_at_none_before_sixty_active_cycles() {
        let mut p = NoisePipeline::new();
        p.set_hard_limit(10, 100.0);
        assert_eq!(p.hard_limit, HARD_LIMIT_NONE);
    }

    #[test]
    fn hard_limit_doubles_when_slew_is_high() {
        let mut p = NoisePipeline::new();
        p.hard_limit = 1;
        p.avg_slew = 200.0;
        p.set_hard_limit(100, 1.0);
        assert!(p.hard_limit > 1);
    }

    #[test]
    fn clamp_jitter_clips_to_hard_limit() {
        let mut p = NoisePipeline::new();
        p.hard_limit = 10;
        assert_eq!(p.clamp_jitter(50), 10);
        assert_eq!(p.clamp_jitter(-50), -10);
        assert_eq!(p.clamp_jitter(5), 5);
    }

    #[test]
    fn remove_noise_short_circuits_on_spike() {
        let mut p = NoisePipeline::new();
        p.noise_level = 5;
        p.hard_limit = HARD_LIMIT_1;
        let (zero_error, is_spike) = p.remove_noise(50, 100, 1.0);
        assert_eq!(zero_error, 0);
        assert!(is_spike);
    }
}
