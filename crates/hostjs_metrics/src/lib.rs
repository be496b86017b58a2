//! hostjs Metrics - event loop instrumentation
//!
//! Tick timing and named counters for the embedding runtime's event loop.
//! Everything here vanishes when the `metrics` feature is disabled: the
//! public types keep their API but record nothing and report zeroes.
//!
//! # Feature Flags
//!
//! - `metrics` - Enable metrics collection (default: disabled)
//!
//! # Usage
//!
//! ```ignore
//! use hostjs_metrics::{Counter, TickTimer};
//!
//! let mut timer = TickTimer::new(64); // Track last 64 ticks
//! let mut counter = Counter::new();
//! timer.begin();
//! // ... run one event loop tick ...
//! timer.end();
//! counter.increment("ticks", 1);
//! println!("avg tick: {:.3}ms", timer.tick_time_ms());
//! ```

#[cfg(feature = "metrics")]
mod counter;
#[cfg(feature = "metrics")]
mod tick_timer;

#[cfg(feature = "metrics")]
pub use counter::Counter;
#[cfg(feature = "metrics")]
pub use tick_timer::TickTimer;

/// Whether this build records anything at all.
pub const ENABLED: bool = cfg!(feature = "metrics");

// ============================================================================
// No-op stubs when metrics disabled
// ============================================================================

#[cfg(not(feature = "metrics"))]
pub struct TickTimer;

#[cfg(not(feature = "metrics"))]
impl TickTimer {
    pub fn new(_capacity: usize) -> Self { Self }
    pub fn begin(&mut self) {}
    pub fn end(&mut self) {}
    pub fn record(&mut self, _elapsed: std::time::Duration) {}
    pub fn samples(&self) -> usize { 0 }
    pub fn average(&self) -> std::time::Duration { std::time::Duration::ZERO }
    pub fn slowest(&self) -> std::time::Duration { std::time::Duration::ZERO }
    pub fn tick_time_ms(&self) -> f64 { 0.0 }
}

#[cfg(not(feature = "metrics"))]
pub struct Counter;

#[cfg(not(feature = "metrics"))]
impl Counter {
    pub fn new() -> Self { Self }
    pub fn increment(&mut self, _name: &'static str, _value: usize) {}
    pub fn get(&self, _name: &str) -> usize { 0 }
    pub fn snapshot(&self) -> Vec<(&'static str, usize)> { Vec::new() }
    pub fn reset_all(&mut self) {}
}

#[cfg(not(feature = "metrics"))]
impl Default for Counter {
    fn default() -> Self { Self }
}
