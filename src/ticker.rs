//! A fixed-rate scheduler for the endpoint's periodic worker thread.
//!
//! Grounded on `examples/original_source/src/Networking/Socket.cpp`'s `UpdateLimiter`, used
//! by `m_update_thread` to run the per-tick bookkeeping at a steady rate: each iteration
//! sleeps for whatever is left of the period after the work ran, and if the work itself ran
//! long there is no attempt to "catch up" by firing extra ticks: the next tick simply
//! starts late.

use std::time::{Duration, Instant};

pub struct TickLimiter {
    period: Duration,
    last: Option<Instant>,
}

impl TickLimiter {
    pub fn new(period: Duration) -> Self {
        TickLimiter { period, last: None }
    }

    pub fn from_hz(hz: u32) -> Self {
        Self::new(Duration::from_nanos(1_000_000_000 / u64::from(hz)))
    }

    /// Blocks until `period` has elapsed since the previous call returned (or, on the first
    /// call, returns immediately). Call this once per tick, right before doing the tick's work.
    pub fn wait(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.period {
                std::thread::sleep(self.period - elapsed);
            }
            // elapsed >= period: the tick ran long; proceed immediately, no catch-up.
        }
        self.last = Some(Instant::now());
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_wait_does_not_block() {
        let mut limiter = TickLimiter::new(Duration::from_secs(10));
        let start = Instant::now();
        limiter.wait();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn subsequent_wait_sleeps_out_the_remainder_of_the_period() {
        let mut limiter = TickLimiter::new(Duration::from_millis(40));
        limiter.wait();
        let start = Instant::now();
        limiter.wait();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(30), "elapsed = {:?}", elapsed);
    }

    #[test]
    fn from_hz_computes_period() {
        let limiter = TickLimiter::from_hz(64);
        assert_eq!(limiter.period(), Duration::from_nanos(1_000_000_000 / 64));
    }
}
