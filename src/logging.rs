// src/logging.rs
//
// Operational logging helpers.
// - Verbosity: gate for stderr diagnostics (0=quiet, 1=summary, 2=debug)
// - LogThrottle: per-component rate limiter for repetitive log lines

/// Verbosity level carried by configs and runners.
pub type Verbosity = u8;

pub const VERBOSITY_QUIET: Verbosity = 0;
pub const VERBOSITY_SUMMARY: Verbosity = 1;
pub const VERBOSITY_DEBUG: Verbosity = 2;

/// Rate limiter for a repetitive log line.
///
/// Owned by the component that logs. The first occurrence is always
/// reported, then every `every`-th one after it (1st, 11th, 21st, ... for
/// `every = 10`).
#[derive(Debug, Clone)]
pub struct LogThrottle {
    every: u64,
    count: u64,
}

impl LogThrottle {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            count: 0,
        }
    }

    /// Record one occurrence; returns true if this one should be logged.
    pub fn hit(&mut self) -> bool {
        self.count += 1;
        self.count % self.every == 1 % self.every
    }

    /// Total occurrences recorded so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_logs_first_and_every_tenth() {
        let mut throttle = LogThrottle::new(10);
        let logged: Vec<u64> = (1..=25).filter(|_| throttle.hit()).collect();
        assert_eq!(logged, vec![1, 11, 21]);
        assert_eq!(throttle.count(), 25);
    }

    #[test]
    fn throttle_every_one_logs_everything() {
        let mut throttle = LogThrottle::new(1);
        assert!((0..5).all(|_| throttle.hit()));
    }
}
