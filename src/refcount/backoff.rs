use std::hint;
use std::thread;

/// How a compare-and-swap loop on a control block behaves under contention.
///
/// Once `spin_limit` consecutive attempts have failed, the loop yields the
/// processor before its next retry and starts counting again. Earlier
/// failures only spin. With the default of 5, failures 1 to 4 spin and the
/// 5th yields. Limits of 0 and 1 both yield after every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    spin_limit: u32,
}

impl Backoff {
    pub const DEFAULT_SPIN_LIMIT: u32 = 5;

    pub const fn new(spin_limit: u32) -> Self {
        Self { spin_limit }
    }

    pub const fn spin_limit(&self) -> u32 {
        self.spin_limit
    }

    pub(crate) fn start(self) -> Contention {
        Contention {
            spin_limit: self.spin_limit,
            failures: 0,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SPIN_LIMIT)
    }
}

/// Failure counter for a single run of a retry loop.
pub(crate) struct Contention {
    spin_limit: u32,
    failures: u32,
}

impl Contention {
    /// Called after every failed CAS. Returns `true` if it yielded.
    pub(crate) fn snooze(&mut self) -> bool {
        self.failures += 1;
        if self.failures >= self.spin_limit {
            log::debug!("yielding after {} failed CAS attempts", self.failures);
            self.failures = 0;
            thread::yield_now();
            true
        } else {
            hint::spin_loop();
            false
        }
    }
}
