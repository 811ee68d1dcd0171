use anyhow::Result;

mod linux;
pub use self::linux::LinuxClock as PlatformClock;

/// Platform clock-adjustment interface: one-shot offset injection, frequency
/// trim, and whole-second stepping.
#[cfg_attr(test, mockall::automock)]
pub trait ClockAdjust {
    /// Applies a single-shot time offset correction in microseconds via
    /// `ADJ_OFFSET_SINGLESHOT`. Magnitude is clamped by the kernel.
    fn adjust_offset(&mut self, time_correction_us: i32) -> Result<()>;

    /// Sets the frequency trim in parts-per-million. 0.0 disables the trim.
    fn adjust_frequency(&mut self, freq_offset_ppm: f64) -> Result<()>;
}
