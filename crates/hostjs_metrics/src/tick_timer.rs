//! Event loop tick timing over a rolling window

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct TickTimer {
    started: Option<Instant>,
    window: VecDeque<Duration>,
    capacity: usize,
    total: Duration,
}

impl TickTimer {
    /// Keeps the last `capacity` ticks (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            started: None,
            window: VecDeque::with_capacity(capacity),
            capacity,
            total: Duration::ZERO,
        }
    }

    pub fn begin(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Records the tick opened by `begin`. Ignored without one.
    pub fn end(&mut self) {
        if let Some(started) = self.started.take() {
            self.record(started.elapsed());
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        if self.window.len() == self.capacity {
            if let Some(oldest) = self.window.pop_front() {
                self.total -= oldest;
            }
        }
        self.window.push_back(elapsed);
        self.total += elapsed;
    }

    /// Number of ticks currently held in the window.
    pub fn samples(&self) -> usize {
        self.window.len()
    }

    pub fn average(&self) -> Duration {
        match self.window.len() {
            0 => Duration::ZERO,
            n => self.total / n as u32,
        }
    }

    /// Slowest tick still in the window.
    pub fn slowest(&self) -> Duration {
        self.window.iter().copied().max().unwrap_or_default()
    }

    pub fn tick_time_ms(&self) -> f64 {
        self.average().as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_drops_oldest() {
        let mut timer = TickTimer::new(3);
        for ms in [10, 20, 30, 40] {
            timer.record(Duration::from_millis(ms));
        }
        assert_eq!(timer.samples(), 3);
        assert_eq!(timer.average(), Duration::from_millis(30));
        assert_eq!(timer.slowest(), Duration::from_millis(40));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut timer = TickTimer::new(0);
        timer.record(Duration::from_millis(5));
        timer.record(Duration::from_millis(7));
        assert_eq!(timer.samples(), 1);
        assert_eq!(timer.average(), Duration::from_millis(7));
    }

    #[test]
    fn test_end_without_begin_is_ignored() {
        let mut timer = TickTimer::new(4);
        timer.end();
        assert_eq!(timer.samples(), 0);
        assert_eq!(timer.average(), Duration::ZERO);

        timer.begin();
        timer.end();
        timer.end();
        assert_eq!(timer.samples(), 1);
    }
}
