//! # Tick Pacer
//!
//! Fixed-rate driver for [`crate::Session::update`].
//!
//! The session never blocks, so something has to call it regularly. The
//! pacer sleeps between ticks and tracks how long each tick took.

use std::time::{Duration, Instant};

/// Default update rate for interactive nodes.
pub const DEFAULT_TICK_RATE: u32 = 60;

/// Fixed-rate tick controller.
pub struct TickPacer {
    tick_duration: Duration,
    next_tick: Instant,
    tick_count: u64,
    stats: TickStats,
}

/// Tick timing statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Longest tick observed, in microseconds.
    pub max_tick_us: u64,
    /// Rolling average tick duration, in microseconds.
    pub avg_tick_us: u64,
    /// Ticks that overran their slot.
    pub late_ticks: u64,
}

impl TickPacer {
    /// Creates a pacer running `tick_rate` times per second.
    ///
    /// A rate of zero is treated as one tick per second.
    #[must_use]
    pub fn new(tick_rate: u32) -> Self {
        let rate = u64::from(tick_rate.max(1));
        Self {
            tick_duration: Duration::from_micros(1_000_000 / rate),
            next_tick: Instant::now(),
            tick_count: 0,
            stats: TickStats::default(),
        }
    }

    /// Runs `work` once, then sleeps until the next slot.
    ///
    /// If the tick overran, the schedule restarts from now instead of
    /// bursting to catch up.
    pub fn tick<F: FnOnce()>(&mut self, work: F) {
        let start = Instant::now();
        work();
        self.record(start.elapsed());

        self.next_tick += self.tick_duration;
        let now = Instant::now();
        if self.next_tick > now {
            std::thread::sleep(self.next_tick - now);
        } else {
            self.next_tick = now;
        }
    }

    fn record(&mut self, elapsed: Duration) {
        let elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.tick_count += 1;
        self.stats.max_tick_us = self.stats.max_tick_us.max(elapsed_us);
        self.stats.avg_tick_us = if self.tick_count == 1 {
            elapsed_us
        } else {
            (self.stats.avg_tick_us * 15 + elapsed_us) / 16
        };
        if elapsed > self.tick_duration {
            self.stats.late_ticks += 1;
        }
    }

    /// Number of ticks run.
    #[must_use]
    pub const fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Target tick duration.
    #[must_use]
    pub const fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// Timing statistics.
    #[must_use]
    pub const fn stats(&self) -> &TickStats {
        &self.stats
    }
}

impl Default for TickPacer {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacer_creation() {
        let pacer = TickPacer::new(60);
        assert_eq!(pacer.tick_count(), 0);
        assert_eq!(pacer.tick_duration(), Duration::from_micros(16666));
        assert_eq!(TickPacer::new(0).tick_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_pacer_holds_rate() {
        let mut pacer = TickPacer::new(200);
        let start = Instant::now();
        let mut runs = 0;
        for _ in 0..10 {
            pacer.tick(|| runs += 1);
        }
        assert_eq!(runs, 10);
        assert_eq!(pacer.tick_count(), 10);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_late_tick_is_counted() {
        let mut pacer = TickPacer::new(1000);
        pacer.tick(|| std::thread::sleep(Duration::from_millis(3)));
        assert_eq!(pacer.stats().late_ticks, 1);
        assert!(pacer.stats().max_tick_us >= 3000);
    }
}
