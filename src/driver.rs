use anyhow::{anyhow, Context, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

/// A single PPS edge as reported by the driver: whole seconds and the
/// fractional microsecond offset of the interrupt response within that
/// second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeCapture {
    pub tv_sec: i64,
    pub tv_usec: i32,
}

/// The six timestamps returned by a loopback calibration round trip:
/// GPIO-output-set time, response time, and reception time, each as
/// (seconds, microseconds) pairs. Interrupt delay is `tm[5] - tm[3]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackCapture {
    pub tm: [i32; 6],
}

/// Edge-capture character-device contract (`spec.md` §6): a blocking read of
/// one PPS edge, a loopback self-calibration round trip, and a whole-second
/// clock step written back to the driver rather than the kernel directly.
#[cfg_attr(test, mockall::automock)]
pub trait CaptureDriver {
    fn await_edge(&mut self, timeout: Duration) -> Result<EdgeCapture>;
    fn request_loopback(&mut self) -> Result<LoopbackCapture>;
    fn inject_whole_second(&mut self, seconds: i32) -> Result<()>;
}

const DEFAULT_DEVICE_PATH: &str = "/dev/pps-client";

pub struct LinuxCaptureDriver {
    device: File,
}

impl LinuxCaptureDriver {
    pub fn open() -> Result<Self> {
        Self::open_path(DEFAULT_DEVICE_PATH)
    }

    pub fn open_path(path: &str) -> Result<Self> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening capture device {path}"))?;
        Ok(LinuxCaptureDriver { device })
    }

    fn read_words(&mut self, count: usize) -> Result<Vec<i32>> {
        let mut buf = vec![0u8; count * std::mem::size_of::<i32>()];
        let n = nix::unistd::read(self.device.as_raw_fd(), &mut buf)
            .map_err(|e| anyhow!("read from capture device failed: {e}"))?;
        if n != buf.len() {
            return Err(anyhow!(
                "short read from capture device: expected {} bytes, got {n}",
                buf.len()
            ));
        }
        Ok(buf
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes(c.try_into().expect("chunk is 4 bytes")))
            .collect())
    }

    fn write_words(&mut self, words: &[i32]) -> Result<()> {
        let buf: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
        let n = nix::unistd::write(&self.device, &buf)
            .map_err(|e| anyhow!("write to capture device failed: {e}"))?;
        if n != buf.len() {
            return Err(anyhow!("short write to capture device"));
        }
        Ok(())
    }
}

impl CaptureDriver for LinuxCaptureDriver {
    fn await_edge(&mut self, _timeout: Duration) -> Result<EdgeCapture> {
        let words = self.read_words(2)?;
        Ok(EdgeCapture {
            tv_sec: words[0] as i64,
            tv_usec: words[1],
        })
    }

    fn request_loopback(&mut self) -> Result<LoopbackCapture> {
        self.write_words(&[1])?;
        let words = self.read_words(6)?;
        self.write_words(&[0])?;
        let mut tm = [0i32; 6];
        tm.copy_from_slice(&words);
        Ok(LoopbackCapture { tm })
    }

    fn inject_whole_second(&mut self, seconds: i32) -> Result<()> {
        self.write_words(&[3, seconds])
    }
}
