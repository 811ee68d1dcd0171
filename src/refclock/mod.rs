//! Auxiliary whole-second reference tasks (`spec.md` §4.10/§5): an SNTP
//! poller and a serial GPRMC poller, each a detached thread that writes its
//! finding into a single shared word. No locks are used — the
//! single-writer-per-word discipline from `spec.md` §5 is the contract, and
//! whichever task wrote most recently wins (Open Question (c), accepted
//! as-is per `DESIGN.md`).

pub mod serial;
pub mod sntp;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// A single word shared between the core loop and the auxiliary pollers.
/// Writers call `set`; the core loop calls `take` once per second, which
/// reads and clears the flag atomically so the whole-second correction is
/// applied at most once (`spec.md` §4.7).
#[derive(Clone, Default)]
pub struct ConsensusWord(Arc<AtomicI32>);

impl ConsensusWord {
    pub fn new() -> Self {
        ConsensusWord(Arc::new(AtomicI32::new(0)))
    }

    pub fn set(&self, seconds: i32) {
        self.0.store(seconds, Ordering::Relaxed);
    }

    pub fn take(&self) -> i32 {
        self.0.swap(0, Ordering::Relaxed)
    }
}
